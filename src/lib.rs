// RustyRaft - Raft consensus actor for replicated state machines
// Core library module

pub mod config;
pub mod consensus;
pub mod error;
pub mod machine;
pub mod storage;
pub mod transport;

pub use config::RaftOptions;
pub use consensus::{
    AppendEntriesRequest, AppendEntriesResponse, EntryPayload, HardState, InstallSnapshotRequest,
    InstallSnapshotResponse, LogEntry, LogIndex, NodeId, Proposal, RaftActor, RaftHandle,
    RaftStatus, Role, Snapshot, Term, VoteRequest, VoteResponse,
};
pub use error::{RaftError, Result};
pub use machine::{ApplyErrorPolicy, StateMachine};
pub use storage::{DurableState, FileStorage, MemoryStorage, Storage};
pub use transport::RaftTransport;
