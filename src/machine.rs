// Replicated State Machine Contract
//
// The consensus actor is generic over a user-supplied deterministic state
// machine. The actor guarantees that every replica observes the same
// sequence of `invoke` calls; the machine must be deterministic with
// respect to that sequence for the replicas to stay identical.

use crate::error::Result;
use bytes::Bytes;

/// The state machine driven by the replicated log.
///
/// `invoke` is called by the applier, in log order, once per committed
/// command. `snapshot` captures a point-in-time image between `invoke`
/// calls, and `consume` restores the machine from an image installed by
/// the leader. Snapshot payloads are opaque to the consensus core.
pub trait StateMachine: Send + 'static {
    /// Apply a committed command. A failure is treated according to the
    /// configured [`ApplyErrorPolicy`]; under the default policy the
    /// applier retries the same command on its next tick.
    fn invoke(&mut self, command: &[u8]) -> Result<()>;

    /// Capture a point-in-time image of the machine state.
    fn snapshot(&self) -> Bytes;

    /// Restore the machine from a snapshot image.
    fn consume(&mut self, snapshot: &[u8]) -> Result<()>;
}

/// What the applier does when [`StateMachine::invoke`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyErrorPolicy {
    /// Yield without advancing and re-apply the entry on the next tick.
    /// A permanently failing command is an application bug.
    Retry,

    /// Log the failure and advance past the entry.
    Skip,

    /// Disarm the applier; no further entries are applied.
    Halt,
}
