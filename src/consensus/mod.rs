// Raft Consensus Core
//
// This module implements the Raft consensus actor through specialized
// submodules that handle distinct responsibilities:
//
// - `message`: the three RPC request/response shapes
// - `log`: the replicated log with its compacted snapshot prefix
// - `state`: crash-durable per-node state
// - `election`: candidacy bookkeeping with stale-reply invalidation
// - `remote`: the per-peer replication engine
// - `actor`: the single-writer consensus core and its tokio driver
// - `handle`: the cloneable command-channel front end
//
// Reference: https://raft.github.io/raft.pdf

pub mod message;
pub mod log;
pub mod state;
pub mod election;
pub mod remote;
pub mod actor;
pub mod handle;

pub use actor::{RaftActor, RaftStatus, Role};
pub use handle::{Proposal, RaftHandle};
pub use log::{EntryPayload, LogEntry, RaftLog, Snapshot};
pub use message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
pub use state::HardState;

/// Stable node identifier, typically "host:port"
pub type NodeId = String;

/// Logical clock for leader elections; at most one leader per term
pub type Term = u64;

/// 1-based position in the replicated log; index 0 is the virtual origin
/// covered by the initial snapshot
pub type LogIndex = u64;
