// Crash-Durable Node State
//
// The persistent counterpart of the transient role state. Every field here
// must reach stable storage before any RPC reply that depends on it.

use super::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Per-node persistent state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    /// Highest term this node has observed
    pub current_term: Term,

    /// Candidate granted a vote in `current_term`, if any
    pub voted_for: Option<NodeId>,

    /// Highest index known to be committed
    pub commit_index: LogIndex,

    /// Highest index delivered to the state machine
    pub last_applied: LogIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = HardState::default();
        assert_eq!(state.current_term, 0);
        assert!(state.voted_for.is_none());
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
    }
}
