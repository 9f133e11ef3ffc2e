// Consensus Actor
//
// The single-writer core of the crate. All role transitions, log
// mutations, timer expiries, RPC handler bodies and applier ticks execute
// on one task; inbound work arrives as commands carrying reply sinks and
// outbound RPCs leave through a dispatch queue drained by the driver.
//
// `RaftCore` is the synchronous state machine: deterministic, time passed
// in, side effects limited to storage writes and the outbound queue. The
// `RaftActor` driver wraps it in a tokio event loop.

use super::election::{has_majority, ElectionState};
use super::handle::{Command, RaftHandle};
use super::log::{Completion, EntryPayload, LogEntry, RaftLog, Snapshot};
use super::message::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use super::remote::{PeerDispatch, RemotePeer};
use super::state::HardState;
use super::{LogIndex, NodeId, Term};
use crate::config::RaftOptions;
use crate::error::{RaftError, Result};
use crate::machine::{ApplyErrorPolicy, StateMachine};
use crate::storage::Storage;
use crate::transport::RaftTransport;
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Transient role; exactly one holds at any time and none survive a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Observability snapshot of one actor
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader_hint: Option<NodeId>,
    pub last_index: LogIndex,
    pub snapshot_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
}

/// Outbound RPC queued for the driver to dispatch
#[derive(Debug)]
pub(crate) enum Outbound {
    Append {
        to: NodeId,
        request: AppendEntriesRequest,
        sent: u64,
    },
    Snapshot {
        to: NodeId,
        request: InstallSnapshotRequest,
    },
    Vote {
        to: NodeId,
        request: VoteRequest,
        epoch: u64,
    },
}

/// State machine image captured by the applier but not yet installed into
/// the log; held back so the log keeps enough committed tail entries to
/// serve slow followers without an immediate snapshot transfer
struct PendingSnapshot {
    index: LogIndex,
    term: Term,
    data: Bytes,
}

pub(crate) struct RaftCore<M, S> {
    id: NodeId,
    peers: Vec<RemotePeer>,
    options: RaftOptions,
    machine: M,
    storage: S,
    log: RaftLog,
    hard: HardState,
    role: Role,
    leader_hint: Option<NodeId>,
    election: Option<ElectionState>,
    election_epoch: u64,
    election_deadline: Option<Instant>,
    applier_armed: bool,
    pending_snapshot: Option<PendingSnapshot>,
    outbound: Vec<Outbound>,
}

impl<M: StateMachine, S: Storage> RaftCore<M, S> {
    pub fn new(
        id: NodeId,
        peer_ids: Vec<NodeId>,
        machine: M,
        mut storage: S,
        options: RaftOptions,
    ) -> Result<Self> {
        let (hard, log) = match storage.load()? {
            Some(state) => (
                state.hard_state,
                RaftLog::restore(state.snapshot, state.entries),
            ),
            None => {
                // First boot: seed the virtual origin entry as a zero-term
                // snapshot of the pristine state machine.
                let snapshot = Snapshot {
                    index: 0,
                    term: 0,
                    data: machine.snapshot(),
                };
                storage.save_snapshot(&snapshot, &[])?;
                let hard = HardState::default();
                storage.save_hard_state(&hard)?;
                (hard, RaftLog::restore(snapshot, Vec::new()))
            }
        };

        Ok(Self {
            id,
            peers: peer_ids.into_iter().map(RemotePeer::new).collect(),
            options,
            machine,
            storage,
            log,
            hard,
            role: Role::Follower,
            leader_hint: None,
            election: None,
            election_epoch: 0,
            election_deadline: None,
            applier_armed: false,
            pending_snapshot: None,
            outbound: Vec::new(),
        })
    }

    pub fn start(&mut self, now: Instant) -> Result<()> {
        tracing::info!(id = %self.id, "running consensus actor");
        self.step_down(self.hard.current_term + 1, now)
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    pub fn applier_armed(&self) -> bool {
        self.applier_armed
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.role {
            Role::Leader => self
                .peers
                .iter()
                .filter_map(|peer| peer.heartbeat_deadline())
                .min(),
            Role::Follower | Role::Candidate => self.election_deadline,
        }
    }

    /// Route one inbound command; `Ok(false)` stops the actor
    pub fn handle_command(&mut self, command: Command, now: Instant) -> Result<bool> {
        match command {
            Command::AppendEntries { request, reply } => {
                let response = self.handle_append(request, now)?;
                let _ = reply.send(response);
            }
            Command::InstallSnapshot { request, reply } => {
                let response = self.handle_install(request, now)?;
                let _ = reply.send(response);
            }
            Command::RequestVote { request, reply } => {
                let response = self.handle_vote(request, now)?;
                let _ = reply.send(response);
            }
            Command::Propose { command, reply } => match self.propose(command, now) {
                Ok(rx) => {
                    let _ = reply.send(Ok(rx));
                }
                Err(error @ RaftError::NotLeader { .. }) => {
                    let _ = reply.send(Err(error));
                }
                Err(error) => {
                    let _ = reply.send(Err(RaftError::Shutdown));
                    return Err(error);
                }
            },
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::AppendAck {
                peer,
                term,
                prev_log_index,
                sent,
                reply,
            } => self.handle_append_ack(peer, term, prev_log_index, sent, reply, now)?,
            Command::SnapshotAck {
                peer,
                term,
                index,
                reply,
            } => self.handle_snapshot_ack(peer, term, index, reply, now)?,
            Command::VoteReply { epoch, from, reply } => {
                self.handle_vote_reply(epoch, from, reply, now)?
            }
            Command::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    pub fn handle_timer(&mut self, now: Instant) -> Result<()> {
        match self.role {
            Role::Leader => {
                self.heartbeat_pass(now);
                Ok(())
            }
            Role::Follower | Role::Candidate => {
                let due = self
                    .election_deadline
                    .map(|deadline| deadline <= now)
                    .unwrap_or(false);
                if due {
                    self.start_election(now)?;
                }
                Ok(())
            }
        }
    }

    pub fn shutdown(&mut self) {
        tracing::info!(id = %self.id, "consensus actor stopping");
        self.election_deadline = None;
        if let Some(election) = &mut self.election {
            election.disable();
        }
        self.election = None;
        self.finish_leadership();
        self.role = Role::Follower;
    }

    fn status(&self) -> RaftStatus {
        RaftStatus {
            id: self.id.clone(),
            role: self.role,
            term: self.hard.current_term,
            leader_hint: self.leader_hint.clone(),
            last_index: self.log.last_index(),
            snapshot_index: self.log.snapshot_index(),
            commit_index: self.hard.commit_index,
            last_applied: self.hard.last_applied,
        }
    }

    fn persist_hard_state(&mut self) -> Result<()> {
        self.storage.save_hard_state(&self.hard)
    }

    fn restart_election_timer(&mut self, now: Instant) {
        let low = self.options.election_timeout.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(low..=low * 2);
        self.election_deadline = Some(now + Duration::from_millis(timeout_ms));
        tracing::trace!(timeout_ms, "election timer armed");
    }

    /// Adopt `term` if newer and drop every non-follower activity
    fn step_down(&mut self, term: Term, now: Instant) -> Result<()> {
        if term > self.hard.current_term {
            tracing::debug!(term, "stepping down to newer term");
            self.hard.current_term = term;
            self.hard.voted_for = None;
            self.persist_hard_state()?;
        }
        self.restart_election_timer(now);
        if let Some(election) = &mut self.election {
            election.disable();
        }
        self.election = None;
        self.finish_leadership();
        self.role = Role::Follower;
        Ok(())
    }

    /// Stop all peer activity; a deposed leader releases every proposal
    /// that is no longer guaranteed to commit under it
    fn finish_leadership(&mut self) {
        for peer in &mut self.peers {
            peer.finish_leadership();
        }
        if self.role == Role::Leader {
            tracing::debug!(term = self.hard.current_term, "leadership finished");
            for index in self.hard.commit_index + 1..=self.log.last_index() {
                if let Some(tx) = self.log.take_completion(index) {
                    let _ = tx.send(None);
                }
            }
        }
    }

    // Inbound RPC handlers

    fn handle_append(
        &mut self,
        request: AppendEntriesRequest,
        now: Instant,
    ) -> Result<AppendEntriesResponse> {
        tracing::trace!(
            from = %request.leader_id,
            term = request.term,
            prev = request.prev_log_index,
            entries = request.entries.len(),
            commit = request.leader_commit,
            "append request"
        );

        if request.term < self.hard.current_term {
            return Ok(AppendEntriesResponse {
                term: self.hard.current_term,
                success: false,
            });
        }

        self.step_down(request.term, now)?;
        self.leader_hint = Some(request.leader_id.clone());

        let prev_index = request.prev_log_index;
        let batch = request.entries.len() as u64;
        let snapshot_index = self.log.snapshot_index();

        let consistent = if snapshot_index > prev_index && snapshot_index <= prev_index + batch {
            // The local snapshot boundary falls inside the batch; the only
            // term we can still compare is the one at the boundary itself.
            let offset = (snapshot_index - prev_index - 1) as usize;
            request.entries[offset].term == self.log.snapshot_term()
        } else if prev_index >= snapshot_index && prev_index <= self.log.last_index() {
            self.log.term_at(prev_index) == Some(request.prev_log_term)
        } else {
            false
        };

        if !consistent {
            return Ok(AppendEntriesResponse {
                term: self.hard.current_term,
                success: false,
            });
        }

        let mut appended: Vec<LogEntry> = Vec::new();
        for (i, entry) in request.entries.iter().enumerate() {
            let index = prev_index + 1 + i as u64;
            if index <= self.log.snapshot_index() {
                continue;
            }
            if index <= self.log.last_index() {
                if self.log.term_at(index) == Some(entry.term) {
                    continue;
                }
                self.storage.truncate(index)?;
                self.log.truncate(index);
            }
            appended.push(entry.clone());
            self.log.append(entry.clone(), None);
        }
        if !appended.is_empty() {
            self.storage.append_entries(&appended)?;
        }

        self.set_commit_index(request.leader_commit)?;

        Ok(AppendEntriesResponse {
            term: self.hard.current_term,
            success: true,
        })
    }

    fn handle_install(
        &mut self,
        request: InstallSnapshotRequest,
        now: Instant,
    ) -> Result<InstallSnapshotResponse> {
        tracing::debug!(
            from = %request.leader_id,
            term = request.term,
            index = request.last_included_index,
            "snapshot install request"
        );

        if request.term < self.hard.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.hard.current_term,
                success: false,
            });
        }

        self.step_down(request.term, now)?;
        self.leader_hint = Some(request.leader_id.clone());

        let index = request.last_included_index;
        let term = request.last_included_term;

        if index > self.log.snapshot_index()
            && index <= self.log.last_index()
            && self.log.term_at(index) != Some(term)
        {
            self.storage.truncate(index)?;
            self.log.truncate(index);
        }

        self.install_snapshot_into_log(index, term, request.data)?;

        // The applier consumes the snapshot itself and lifts last_applied
        // the final step to the snapshot index.
        self.hard.last_applied = index.saturating_sub(1);
        self.persist_hard_state()?;

        if let Some(pending) = &self.pending_snapshot {
            if pending.index <= index {
                self.pending_snapshot = None;
            }
        }

        self.set_commit_index(request.leader_commit)?;

        Ok(InstallSnapshotResponse {
            term: self.hard.current_term,
            success: true,
        })
    }

    fn handle_vote(&mut self, request: VoteRequest, now: Instant) -> Result<VoteResponse> {
        tracing::trace!(
            from = %request.candidate_id,
            term = request.term,
            last_index = request.last_log_index,
            last_term = request.last_log_term,
            "vote request"
        );

        if request.term > self.hard.current_term {
            self.step_down(request.term, now)?;
        }

        let up_to_date = request.last_log_term > self.log.last_term()
            || (request.last_log_term == self.log.last_term()
                && request.last_log_index >= self.log.last_index());
        let may_vote = self.hard.voted_for.is_none()
            || self.hard.voted_for.as_deref() == Some(request.candidate_id.as_str());

        if request.term == self.hard.current_term && may_vote && up_to_date {
            self.step_down(request.term, now)?;
            self.hard.voted_for = Some(request.candidate_id.clone());
            self.persist_hard_state()?;
            tracing::debug!(
                term = self.hard.current_term,
                candidate = %request.candidate_id,
                "vote granted"
            );
        }

        Ok(VoteResponse {
            term: self.hard.current_term,
            vote_granted: request.term == self.hard.current_term
                && self.hard.voted_for.as_deref() == Some(request.candidate_id.as_str()),
        })
    }

    // Election

    fn start_election(&mut self, now: Instant) -> Result<()> {
        tracing::debug!(term = self.hard.current_term + 1, "starting election");

        self.step_down(self.hard.current_term + 1, now)?;
        self.role = Role::Candidate;
        self.hard.voted_for = Some(self.id.clone());
        self.persist_hard_state()?;

        self.election_epoch += 1;
        self.election = Some(ElectionState::new(self.election_epoch));

        let request = VoteRequest {
            term: self.hard.current_term,
            candidate_id: self.id.clone(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
        };
        for peer in &self.peers {
            self.outbound.push(Outbound::Vote {
                to: peer.id.clone(),
                request: request.clone(),
                epoch: self.election_epoch,
            });
        }

        // A single-node cluster wins on its own vote
        if has_majority(1, self.peers.len()) {
            if let Some(election) = &mut self.election {
                election.disable();
            }
            self.switch_to_leader(now)?;
        }
        Ok(())
    }

    fn handle_vote_reply(
        &mut self,
        epoch: u64,
        from: NodeId,
        reply: Option<VoteResponse>,
        now: Instant,
    ) -> Result<()> {
        let peer_count = self.peers.len();
        let mut become_leader = false;
        let mut newer_term = None;

        match &mut self.election {
            Some(election) if election.is_active() && election.epoch() == epoch => {
                let Some(response) = reply else {
                    tracing::trace!(peer = %from, "vote request failed");
                    return Ok(());
                };
                tracing::trace!(
                    peer = %from,
                    term = response.term,
                    granted = response.vote_granted,
                    "vote reply"
                );
                if response.vote_granted {
                    if has_majority(election.record_grant(), peer_count) {
                        election.disable();
                        become_leader = true;
                    }
                } else if response.term > self.hard.current_term {
                    election.disable();
                    newer_term = Some(response.term);
                }
            }
            _ => {}
        }

        if become_leader {
            self.switch_to_leader(now)?;
        }
        if let Some(term) = newer_term {
            self.step_down(term, now)?;
        }
        Ok(())
    }

    // Leadership

    fn switch_to_leader(&mut self, now: Instant) -> Result<()> {
        tracing::info!(term = self.hard.current_term, "leadership begun");

        self.election_deadline = None;
        self.election = None;
        self.role = Role::Leader;
        self.leader_hint = Some(self.id.clone());

        // The commit rule only counts entries of the current term; the
        // no-op gives the new term an entry of its own so older inherited
        // entries can be pulled through.
        self.append_local(LogEntry::noop(self.hard.current_term), None)?;

        let last_index = self.log.last_index();
        for peer in &mut self.peers {
            peer.begin_leadership(last_index, now);
        }
        self.kick_replication(now);
        if self.peers.is_empty() {
            self.update_commit_index()?;
        }
        Ok(())
    }

    fn append_local(&mut self, entry: LogEntry, completion: Option<Completion>) -> Result<LogIndex> {
        self.storage.append_entries(std::slice::from_ref(&entry))?;
        Ok(self.log.append(entry, completion))
    }

    fn propose(
        &mut self,
        command: Bytes,
        now: Instant,
    ) -> Result<tokio::sync::oneshot::Receiver<Option<LogIndex>>> {
        if self.role != Role::Leader {
            return Err(RaftError::NotLeader {
                leader_hint: self.leader_hint.clone(),
            });
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let index = self.append_local(
            LogEntry::command(self.hard.current_term, command),
            Some(tx),
        )?;
        tracing::debug!(index, term = self.hard.current_term, "proposal appended");

        self.kick_replication(now);
        if self.peers.is_empty() {
            self.update_commit_index()?;
        }
        Ok(rx)
    }

    // Replication

    fn heartbeat_pass(&mut self, now: Instant) {
        for i in 0..self.peers.len() {
            if !self.peers[i].heartbeat_due(now) {
                continue;
            }
            if self.peers[i].is_in_flight() {
                self.peers[i].defer_heartbeat(now + self.options.heartbeat_timeout);
            } else {
                self.replicate_peer(i, now);
            }
        }
    }

    fn kick_replication(&mut self, now: Instant) {
        for i in 0..self.peers.len() {
            self.replicate_peer(i, now);
        }
    }

    fn replicate_peer(&mut self, i: usize, now: Instant) {
        let dispatch = self.peers[i].replicate(
            &self.log,
            self.hard.current_term,
            self.hard.commit_index,
            &self.id,
            &self.options,
            now,
        );
        match dispatch {
            Some(PeerDispatch::Append { request, sent }) => {
                self.outbound.push(Outbound::Append {
                    to: self.peers[i].id.clone(),
                    request,
                    sent,
                });
            }
            Some(PeerDispatch::Snapshot { request }) => {
                self.outbound.push(Outbound::Snapshot {
                    to: self.peers[i].id.clone(),
                    request,
                });
            }
            None => {}
        }
    }

    fn handle_append_ack(
        &mut self,
        peer_id: NodeId,
        term: Term,
        prev_log_index: LogIndex,
        sent: u64,
        reply: Option<AppendEntriesResponse>,
        now: Instant,
    ) -> Result<()> {
        let Some(i) = self.peers.iter().position(|peer| peer.id == peer_id) else {
            return Ok(());
        };
        self.peers[i].clear_in_flight();

        let Some(response) = reply else {
            tracing::trace!(peer = %peer_id, "append dispatch failed; retrying on heartbeat");
            return Ok(());
        };

        if response.term > self.hard.current_term {
            self.step_down(response.term, now)?;
            return Ok(());
        }
        if self.role != Role::Leader || term != self.hard.current_term {
            // Ack from an earlier leadership of ours
            return Ok(());
        }

        if response.success {
            self.peers[i].note_success(prev_log_index + sent);
            self.update_commit_index()?;
            if self.peers[i].behind(self.log.last_index()) {
                self.replicate_peer(i, now);
            }
        } else {
            self.peers[i].note_rejection();
            self.replicate_peer(i, now);
        }
        Ok(())
    }

    fn handle_snapshot_ack(
        &mut self,
        peer_id: NodeId,
        term: Term,
        index: LogIndex,
        reply: Option<InstallSnapshotResponse>,
        now: Instant,
    ) -> Result<()> {
        let Some(i) = self.peers.iter().position(|peer| peer.id == peer_id) else {
            return Ok(());
        };
        self.peers[i].clear_in_flight();

        let Some(response) = reply else {
            tracing::trace!(peer = %peer_id, "snapshot dispatch failed; retrying on heartbeat");
            return Ok(());
        };

        if response.term > self.hard.current_term {
            self.step_down(response.term, now)?;
            return Ok(());
        }
        if self.role != Role::Leader || term != self.hard.current_term {
            return Ok(());
        }

        if response.success {
            self.peers[i].note_snapshot_ack(index);
            self.update_commit_index()?;
            if self.peers[i].behind(self.log.last_index()) {
                self.replicate_peer(i, now);
            }
        }
        Ok(())
    }

    // Commit and apply

    fn update_commit_index(&mut self) -> Result<()> {
        let frontier = if self.peers.is_empty() {
            self.log.last_index()
        } else {
            let mut matches: Vec<LogIndex> =
                self.peers.iter().map(|peer| peer.match_index()).collect();
            matches.sort_unstable();
            let pivot = ((self.peers.len() + 1) / 2).min(self.peers.len() - 1);
            matches[pivot]
        };

        // Entries of prior terms are never committed by count alone
        if frontier > self.hard.commit_index
            && self.log.term_at(frontier) == Some(self.hard.current_term)
        {
            self.set_commit_index(frontier)?;
        }
        Ok(())
    }

    fn set_commit_index(&mut self, index: LogIndex) -> Result<()> {
        let old = self.hard.commit_index;
        let new = old.max(index.min(self.log.last_index()));

        if new != old {
            self.hard.commit_index = new;
            self.persist_hard_state()?;
            tracing::debug!(commit_index = new, "commit index advanced");

            if new > self.log.snapshot_index() {
                for committed in old.max(self.log.snapshot_index()) + 1..=new {
                    if let Some(tx) = self.log.take_completion(committed) {
                        let _ = tx.send(Some(committed));
                    }
                }
            }
        }

        self.rotate_pending_snapshot()?;

        if self.hard.last_applied < self.hard.commit_index && !self.applier_armed {
            self.applier_armed = true;
        }
        Ok(())
    }

    /// One cooperative applier tick: at most `message_size` entries
    pub fn apply_batch(&mut self) -> Result<()> {
        let ceiling = self.hard.commit_index.min(self.log.last_index());
        let to_apply = (self.hard.last_applied + self.options.message_size).min(ceiling);
        if to_apply <= self.hard.last_applied {
            tracing::trace!(last_applied = self.hard.last_applied, "applier caught up");
            self.applier_armed = false;
            return Ok(());
        }

        // A snapshot covering unapplied entries replaces them wholesale
        if self.log.snapshot_index() > self.hard.last_applied {
            match self.machine.consume(&self.log.snapshot().data) {
                Ok(()) => {
                    self.hard.last_applied = self.log.snapshot_index();
                    self.persist_hard_state()?;
                    tracing::debug!(last_applied = self.hard.last_applied, "snapshot consumed");
                }
                Err(error) => {
                    tracing::warn!(error = %error, "snapshot consume failed; retrying next tick");
                }
            }
            return Ok(());
        }

        for index in self.hard.last_applied + 1..=to_apply {
            let payload = match self.log.entry(index) {
                Some(entry) => entry.payload.clone(),
                None => EntryPayload::Noop,
            };
            if let EntryPayload::Command(data) = payload {
                if let Err(error) = self.machine.invoke(&data) {
                    match self.options.apply_error_policy {
                        ApplyErrorPolicy::Retry => {
                            tracing::warn!(index, error = %error, "command rejected; retrying next tick");
                            return Ok(());
                        }
                        ApplyErrorPolicy::Skip => {
                            tracing::error!(index, error = %error, "command rejected; skipping entry");
                        }
                        ApplyErrorPolicy::Halt => {
                            tracing::error!(index, error = %error, "command rejected; halting applier");
                            self.applier_armed = false;
                            return Ok(());
                        }
                    }
                }
            }

            self.hard.last_applied += 1;
            self.persist_hard_state()?;
            self.rotate_pending_snapshot()?;

            if self.hard.last_applied == self.log.snapshot_index() + self.options.snapshot_threshold
            {
                let term = self
                    .log
                    .term_at(self.hard.last_applied)
                    .unwrap_or(self.log.snapshot_term());
                self.pending_snapshot = Some(PendingSnapshot {
                    index: self.hard.last_applied,
                    term,
                    data: self.machine.snapshot(),
                });
                tracing::debug!(index = self.hard.last_applied, "pending snapshot captured");
            }
        }
        Ok(())
    }

    /// Install the held-back snapshot once the commit frontier has moved
    /// far enough past it to leave the log a serviceable committed tail
    fn rotate_pending_snapshot(&mut self) -> Result<()> {
        let due = self
            .pending_snapshot
            .as_ref()
            .map(|pending| {
                self.hard.commit_index > pending.index + self.options.snapshot_threshold / 2
            })
            .unwrap_or(false);
        if !due {
            return Ok(());
        }
        if let Some(pending) = self.pending_snapshot.take() {
            tracing::debug!(index = pending.index, "compacting log into pending snapshot");
            self.install_snapshot_into_log(pending.index, pending.term, pending.data)?;
        }
        Ok(())
    }

    fn install_snapshot_into_log(
        &mut self,
        index: LogIndex,
        term: Term,
        data: Bytes,
    ) -> Result<()> {
        let tail = self.log.entries_from(index + 1, u64::MAX);
        let snapshot = Snapshot { index, term, data };
        self.storage.save_snapshot(&snapshot, &tail)?;
        self.log.set_snapshot(index, term, snapshot.data);
        Ok(())
    }
}

/// The tokio driver: owns the core, the command channel and the outbound
/// dispatch. `run` consumes the actor; drop every [`RaftHandle`] or send
/// an explicit shutdown to stop it.
pub struct RaftActor<M, S, T> {
    core: RaftCore<M, S>,
    transport: Arc<T>,
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl<M, S, T> RaftActor<M, S, T>
where
    M: StateMachine,
    S: Storage,
    T: RaftTransport,
{
    /// Build an actor and its handle. The log is seeded on first boot and
    /// recovered from `storage` otherwise.
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        machine: M,
        storage: S,
        transport: T,
        options: RaftOptions,
    ) -> Result<(RaftHandle, Self)> {
        let core = RaftCore::new(id, peers, machine, storage, options)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RaftHandle::new(tx.clone());
        Ok((
            handle,
            Self {
                core,
                transport: Arc::new(transport),
                tx,
                rx,
            },
        ))
    }

    /// Drive the actor until shutdown. Commands outrank timers, and the
    /// applier only runs when the loop is otherwise idle.
    pub async fn run(mut self) {
        if let Err(error) = self.core.start(Instant::now()) {
            tracing::error!(error = %error, "failed to start consensus actor");
            self.core.shutdown();
            return;
        }

        loop {
            for outbound in self.core.take_outbound() {
                self.dispatch(outbound);
            }

            let deadline = self.core.next_deadline();
            let outcome = tokio::select! {
                biased;
                command = self.rx.recv() => match command {
                    Some(command) => self.core.handle_command(command, Instant::now()),
                    None => Ok(false),
                },
                _ = sleep_until_deadline(deadline) => {
                    self.core.handle_timer(Instant::now()).map(|_| true)
                }
                _ = tokio::task::yield_now(), if self.core.applier_armed() => {
                    self.core.apply_batch().map(|_| true)
                }
            };

            match outcome {
                Ok(true) => {}
                Ok(false) => break,
                Err(error) => {
                    tracing::error!(error = %error, "fatal storage failure; stopping consensus actor");
                    break;
                }
            }
        }

        self.core.shutdown();
    }

    fn dispatch(&self, outbound: Outbound) {
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        match outbound {
            Outbound::Append { to, request, sent } => {
                let term = request.term;
                let prev_log_index = request.prev_log_index;
                tokio::spawn(async move {
                    let reply = transport.append_entries(&to, request).await;
                    let _ = tx.send(Command::AppendAck {
                        peer: to,
                        term,
                        prev_log_index,
                        sent,
                        reply,
                    });
                });
            }
            Outbound::Snapshot { to, request } => {
                let term = request.term;
                let index = request.last_included_index;
                tokio::spawn(async move {
                    let reply = transport.install_snapshot(&to, request).await;
                    let _ = tx.send(Command::SnapshotAck {
                        peer: to,
                        term,
                        index,
                        reply,
                    });
                });
            }
            Outbound::Vote { to, request, epoch } => {
                tokio::spawn(async move {
                    let reply = transport.request_vote(&to, request).await;
                    let _ = tx.send(Command::VoteReply {
                        epoch,
                        from: to,
                        reply,
                    });
                });
            }
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}
