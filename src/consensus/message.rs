// Raft RPC Messages
//
// The three RPCs exchanged between consensus actors. Command and snapshot
// payloads are opaque byte strings; the transport is free to wrap these
// shapes in whatever codec it uses on the wire.

use super::log::LogEntry;
use super::{LogIndex, NodeId, Term};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Log replication request (empty `entries` is a heartbeat)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term
    pub term: Term,

    /// So the follower can redirect clients
    pub leader_id: NodeId,

    /// Index of the log entry immediately preceding `entries`
    pub prev_log_index: LogIndex,

    /// Term of the entry at `prev_log_index`
    pub prev_log_term: Term,

    /// Entries to replicate, starting at `prev_log_index + 1`
    pub entries: Vec<LogEntry>,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself
    pub term: Term,

    /// True if the follower accepted the batch
    pub success: bool,
}

/// Election vote request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Candidate's term
    pub term: Term,

    /// Candidate requesting the vote
    pub candidate_id: NodeId,

    /// Index of the candidate's last log entry
    pub last_log_index: LogIndex,

    /// Term of the candidate's last log entry
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    /// Current term, for the candidate to update itself
    pub term: Term,

    /// True if the candidate received the vote
    pub vote_granted: bool,
}

/// Snapshot transfer for followers whose log the leader has compacted past
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term
    pub term: Term,

    /// So the follower can redirect clients
    pub leader_id: NodeId,

    /// Index of the last entry covered by the snapshot
    pub last_included_index: LogIndex,

    /// Term of the entry at `last_included_index`
    pub last_included_term: Term,

    /// Opaque state machine image
    pub data: Bytes,

    /// Leader's commit index
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term
    pub term: Term,

    /// True if the snapshot was installed
    pub success: bool,
}
