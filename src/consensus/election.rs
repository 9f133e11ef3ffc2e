// Candidacy Bookkeeping
//
// Each election round owns a small state object counting granted votes.
// The object is invalidated when the round is superseded (timer re-fire,
// step-down, victory) so that late vote replies become no-ops. Outbound
// vote requests additionally carry the round's epoch; a reply whose epoch
// does not match the live round is ignored before any counting happens.

/// Vote tally for one election round
#[derive(Debug)]
pub(crate) struct ElectionState {
    epoch: u64,
    granted: usize,
    active: bool,
}

impl ElectionState {
    /// Fresh round; the candidate votes for itself
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            granted: 1,
            active: true,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Invalidate the round; late replies are ignored from here on
    pub fn disable(&mut self) {
        self.active = false;
    }

    /// Count one granted vote and return the new tally
    pub fn record_grant(&mut self) -> usize {
        self.granted += 1;
        self.granted
    }
}

/// Strict majority of the cluster, the local node included
pub(crate) fn has_majority(granted: usize, peer_count: usize) -> bool {
    granted > (peer_count + 1) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_majority_three_node_cluster() {
        // Two peers plus self: two votes carry the election
        assert!(!has_majority(1, 2));
        assert!(has_majority(2, 2));
    }

    #[test]
    fn test_majority_five_node_cluster() {
        assert!(!has_majority(2, 4));
        assert!(has_majority(3, 4));
    }

    #[test]
    fn test_majority_single_node_cluster() {
        assert!(has_majority(1, 0));
    }

    #[test]
    fn test_disabled_round_stays_disabled() {
        let mut round = ElectionState::new(7);
        assert!(round.is_active());
        round.disable();
        assert!(!round.is_active());
        assert_eq!(round.epoch(), 7);
    }

    #[test]
    fn test_grant_tally() {
        let mut round = ElectionState::new(1);
        assert_eq!(round.record_grant(), 2);
        assert_eq!(round.record_grant(), 3);
    }
}
