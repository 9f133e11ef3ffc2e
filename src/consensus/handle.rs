// Actor Front End
//
// Handlers may be called from any task or transport thread; each call
// becomes a command carrying a one-shot reply sink, and the reply is
// produced inside the actor's serialized region. This is the
// single-writer boundary of the crate.

use super::actor::RaftStatus;
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use super::{LogIndex, NodeId, Term};
use crate::error::{RaftError, Result};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// Inbound work for the actor task
pub(crate) enum Command {
    AppendEntries {
        request: AppendEntriesRequest,
        reply: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        request: VoteRequest,
        reply: oneshot::Sender<VoteResponse>,
    },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        reply: oneshot::Sender<InstallSnapshotResponse>,
    },
    Propose {
        command: Bytes,
        reply: oneshot::Sender<Result<oneshot::Receiver<Option<LogIndex>>>>,
    },
    Status {
        reply: oneshot::Sender<RaftStatus>,
    },
    AppendAck {
        peer: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        sent: u64,
        reply: Option<AppendEntriesResponse>,
    },
    SnapshotAck {
        peer: NodeId,
        term: Term,
        index: LogIndex,
        reply: Option<InstallSnapshotResponse>,
    },
    VoteReply {
        epoch: u64,
        from: NodeId,
        reply: Option<VoteResponse>,
    },
    Shutdown,
}

/// Cloneable handle to a running consensus actor
#[derive(Clone)]
pub struct RaftHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RaftHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { tx }
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(build(tx))
            .map_err(|_| RaftError::Shutdown)?;
        rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Serve an inbound AppendEntries RPC
    pub async fn append_entries(
        &self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.request(|reply| Command::AppendEntries { request, reply })
            .await
    }

    /// Serve an inbound RequestVote RPC
    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        self.request(|reply| Command::RequestVote { request, reply })
            .await
    }

    /// Serve an inbound InstallSnapshot RPC
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.request(|reply| Command::InstallSnapshot { request, reply })
            .await
    }

    /// Submit a command to the replicated state machine. Fails with
    /// [`RaftError::NotLeader`] unless this node currently leads.
    pub async fn propose(&self, command: Bytes) -> Result<Proposal> {
        let rx = self
            .request(|reply| Command::Propose { command, reply })
            .await??;
        Ok(Proposal { rx })
    }

    pub async fn status(&self) -> Result<RaftStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn is_leader(&self) -> Result<bool> {
        Ok(self.status().await?.role == super::Role::Leader)
    }

    /// Last known leader, usable as a redirect hint
    pub async fn leader_hint(&self) -> Result<Option<NodeId>> {
        Ok(self.status().await?.leader_hint)
    }

    /// Ask the actor to stop; pending proposals complete negatively
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Outcome of a submitted proposal
pub struct Proposal {
    rx: oneshot::Receiver<Option<LogIndex>>,
}

impl Proposal {
    /// Resolve to the applied index once the entry commits, or to
    /// [`RaftError::ProposalAbandoned`] if leadership was lost first.
    pub async fn wait(self) -> Result<LogIndex> {
        match self.rx.await {
            Ok(Some(index)) => Ok(index),
            Ok(None) | Err(_) => Err(RaftError::ProposalAbandoned),
        }
    }
}
