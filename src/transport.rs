// Outbound RPC Transport
//
// The consensus core issues the same three RPCs it serves. The wire
// protocol, codec and connection management live behind this trait; the
// core only sees an optional reply, where `None` means the transport
// failed to deliver or the peer did not answer. Transport failures are
// never errors: the replication engine retries on its next heartbeat.

use crate::consensus::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    NodeId, VoteRequest, VoteResponse,
};
use async_trait::async_trait;

/// Delivery of the three consensus RPCs to a remote node
#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> Option<AppendEntriesResponse>;

    async fn request_vote(&self, target: &NodeId, request: VoteRequest) -> Option<VoteResponse>;

    async fn install_snapshot(
        &self,
        target: &NodeId,
        request: InstallSnapshotRequest,
    ) -> Option<InstallSnapshotResponse>;
}
