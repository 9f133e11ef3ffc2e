use crate::consensus::{LogIndex, NodeId};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("log corruption at index {index}: {reason}")]
    Corruption { index: LogIndex, reason: String },

    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("proposal abandoned before commit")]
    ProposalAbandoned,

    #[error("state machine error: {0}")]
    StateMachine(String),

    #[error("actor has shut down")]
    Shutdown,
}
