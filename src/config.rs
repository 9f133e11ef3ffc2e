// Consensus actor configuration

use crate::machine::ApplyErrorPolicy;
use std::time::Duration;

/// Tuning knobs for the consensus actor
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Lower bound of the election timeout; the actual timeout is drawn
    /// uniformly from [election_timeout, 2 * election_timeout] each time
    /// the timer is armed
    pub election_timeout: Duration,

    /// Idle interval after which a leader sends an empty AppendEntries
    /// to each follower
    pub heartbeat_timeout: Duration,

    /// Maximum committed entries fed to the state machine per applier tick
    pub message_size: u64,

    /// Applied entries between automatic state machine snapshots
    pub snapshot_threshold: u64,

    /// Maximum log entries carried by a single AppendEntries request
    pub batch_max: u64,

    /// What the applier does when the state machine rejects a command
    pub apply_error_policy: ApplyErrorPolicy,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(150),
            heartbeat_timeout: Duration::from_millis(50),
            message_size: 128,
            snapshot_threshold: 4096,
            batch_max: 100,
            apply_error_policy: ApplyErrorPolicy::Retry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let options = RaftOptions::default();
        assert!(options.heartbeat_timeout < options.election_timeout);
        assert!(options.message_size > 0);
        assert!(options.batch_max > 0);
    }
}
