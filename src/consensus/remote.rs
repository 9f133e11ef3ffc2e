// Remote Peer Replication Engine
//
// Per-peer state a leader keeps while replicating its log: the classic
// next_index / match_index pair, an in-flight flag preventing concurrent
// dispatch to the same peer, and a heartbeat deadline that fires empty
// AppendEntries when the pipeline is otherwise idle.
//
// The engine only builds requests; the actor owns dispatch and feeds
// replies back through the `note_*` methods.

use super::log::RaftLog;
use super::message::{AppendEntriesRequest, InstallSnapshotRequest};
use super::{LogIndex, NodeId, Term};
use crate::config::RaftOptions;
use std::time::Instant;

/// One outbound replication step for a single peer
#[derive(Debug)]
pub(crate) enum PeerDispatch {
    Append {
        request: AppendEntriesRequest,
        sent: u64,
    },
    Snapshot {
        request: InstallSnapshotRequest,
    },
}

/// Replication state for one remote cluster member
pub(crate) struct RemotePeer {
    pub id: NodeId,
    next_index: LogIndex,
    match_index: LogIndex,
    in_flight: bool,
    heartbeat_deadline: Option<Instant>,
}

impl RemotePeer {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            next_index: 1,
            match_index: 0,
            in_flight: false,
            heartbeat_deadline: None,
        }
    }

    /// Reinitialize for a fresh term of leadership. The deadline is set to
    /// `now` so the first heartbeat pass dispatches immediately.
    pub fn begin_leadership(&mut self, last_index: LogIndex, now: Instant) {
        self.next_index = last_index + 1;
        self.match_index = 0;
        self.in_flight = false;
        self.heartbeat_deadline = Some(now);
    }

    /// Stop the heartbeat and void any in-flight bookkeeping
    pub fn finish_leadership(&mut self) {
        self.in_flight = false;
        self.heartbeat_deadline = None;
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        self.heartbeat_deadline
    }

    pub fn heartbeat_due(&self, now: Instant) -> bool {
        self.heartbeat_deadline
            .map(|deadline| deadline <= now)
            .unwrap_or(false)
    }

    /// The peer still lacks entries the log already holds
    pub fn behind(&self, last_index: LogIndex) -> bool {
        self.next_index <= last_index
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn clear_in_flight(&mut self) {
        self.in_flight = false;
    }

    /// Push the heartbeat deadline out while a dispatch is still in flight
    pub fn defer_heartbeat(&mut self, deadline: Instant) {
        if self.heartbeat_deadline.is_some() {
            self.heartbeat_deadline = Some(deadline);
        }
    }

    /// Build the next replication request for this peer, if one may be
    /// dispatched. Chooses InstallSnapshot when the log has already been
    /// compacted past `next_index`, an entry batch (possibly empty, a
    /// heartbeat) otherwise. Marks the peer in flight and re-arms its
    /// heartbeat deadline.
    pub fn replicate(
        &mut self,
        log: &RaftLog,
        term: Term,
        commit_index: LogIndex,
        leader_id: &NodeId,
        options: &RaftOptions,
        now: Instant,
    ) -> Option<PeerDispatch> {
        if self.in_flight || self.heartbeat_deadline.is_none() {
            return None;
        }

        self.in_flight = true;
        self.heartbeat_deadline = Some(now + options.heartbeat_timeout);

        if self.next_index <= log.snapshot_index() {
            let snapshot = log.snapshot();
            return Some(PeerDispatch::Snapshot {
                request: InstallSnapshotRequest {
                    term,
                    leader_id: leader_id.clone(),
                    last_included_index: snapshot.index,
                    last_included_term: snapshot.term,
                    data: snapshot.data.clone(),
                    leader_commit: commit_index,
                },
            });
        }

        let prev_log_index = self.next_index - 1;
        let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
        let entries = log.entries_from(self.next_index, options.batch_max);
        let sent = entries.len() as u64;

        Some(PeerDispatch::Append {
            request: AppendEntriesRequest {
                term,
                leader_id: leader_id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            },
            sent,
        })
    }

    /// Successful append ack covering entries up to `replicated`
    pub fn note_success(&mut self, replicated: LogIndex) {
        self.match_index = self.match_index.max(replicated);
        self.next_index = self.match_index + 1;
    }

    /// Consistency rejection; back off one entry and retry
    pub fn note_rejection(&mut self) {
        self.next_index = self.next_index.saturating_sub(1).max(1);
    }

    /// Snapshot installed through `index`
    pub fn note_snapshot_ack(&mut self, index: LogIndex) {
        self.match_index = self.match_index.max(index);
        self.next_index = self.match_index + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::log::{LogEntry, Snapshot};
    use bytes::Bytes;

    fn log_with_entries(n: u64) -> RaftLog {
        let mut log = RaftLog::restore(
            Snapshot {
                index: 0,
                term: 0,
                data: Bytes::new(),
            },
            Vec::new(),
        );
        for _ in 0..n {
            log.append(LogEntry::noop(1), None);
        }
        log
    }

    fn options() -> RaftOptions {
        RaftOptions::default()
    }

    #[test]
    fn test_begin_leadership_resets_indices() {
        let mut peer = RemotePeer::new("b:1".to_string());
        peer.note_success(7);
        peer.begin_leadership(10, Instant::now());

        assert_eq!(peer.next_index(), 11);
        assert_eq!(peer.match_index(), 0);
        assert!(peer.heartbeat_due(Instant::now()));
    }

    #[test]
    fn test_replicate_builds_entry_batch() {
        let log = log_with_entries(5);
        let mut peer = RemotePeer::new("b:1".to_string());
        let now = Instant::now();
        peer.begin_leadership(5, now);
        peer.note_rejection();
        peer.note_rejection();

        let dispatch = peer
            .replicate(&log, 3, 2, &"a:1".to_string(), &options(), now)
            .unwrap();
        match dispatch {
            PeerDispatch::Append { request, sent } => {
                assert_eq!(request.prev_log_index, 3);
                assert_eq!(request.prev_log_term, 1);
                assert_eq!(sent, 2);
                assert_eq!(request.leader_commit, 2);
            }
            PeerDispatch::Snapshot { .. } => panic!("expected an entry batch"),
        }
    }

    #[test]
    fn test_replicate_falls_back_to_snapshot() {
        let mut log = log_with_entries(5);
        log.set_snapshot(4, 1, Bytes::from_static(b"img"));

        let mut peer = RemotePeer::new("b:1".to_string());
        let now = Instant::now();
        peer.begin_leadership(5, now);
        for _ in 0..4 {
            peer.note_rejection();
        }
        assert_eq!(peer.next_index(), 2);

        let dispatch = peer
            .replicate(&log, 3, 5, &"a:1".to_string(), &options(), now)
            .unwrap();
        match dispatch {
            PeerDispatch::Snapshot { request } => {
                assert_eq!(request.last_included_index, 4);
                assert_eq!(request.last_included_term, 1);
            }
            PeerDispatch::Append { .. } => panic!("expected a snapshot"),
        }
    }

    #[test]
    fn test_in_flight_blocks_dispatch() {
        let log = log_with_entries(2);
        let mut peer = RemotePeer::new("b:1".to_string());
        let now = Instant::now();
        peer.begin_leadership(2, now);

        assert!(peer
            .replicate(&log, 1, 0, &"a:1".to_string(), &options(), now)
            .is_some());
        assert!(peer
            .replicate(&log, 1, 0, &"a:1".to_string(), &options(), now)
            .is_none());

        peer.clear_in_flight();
        assert!(peer
            .replicate(&log, 1, 0, &"a:1".to_string(), &options(), now)
            .is_some());
    }

    #[test]
    fn test_rejection_floor() {
        let mut peer = RemotePeer::new("b:1".to_string());
        peer.begin_leadership(0, Instant::now());
        peer.note_rejection();
        peer.note_rejection();
        assert_eq!(peer.next_index(), 1);
    }

    #[test]
    fn test_snapshot_ack_advances_past_snapshot() {
        let mut peer = RemotePeer::new("b:1".to_string());
        peer.begin_leadership(10, Instant::now());
        peer.note_snapshot_ack(6);
        assert_eq!(peer.match_index(), 6);
        assert_eq!(peer.next_index(), 7);
    }

    #[test]
    fn test_finish_leadership_stops_heartbeat() {
        let log = log_with_entries(1);
        let mut peer = RemotePeer::new("b:1".to_string());
        let now = Instant::now();
        peer.begin_leadership(1, now);
        peer.finish_leadership();

        assert!(peer.heartbeat_deadline().is_none());
        assert!(peer
            .replicate(&log, 1, 0, &"a:1".to_string(), &options(), now)
            .is_none());
    }
}
