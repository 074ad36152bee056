//! Consensus log (component C): a Raft-style replicated log providing
//! linearizable writes and the commit index the FSM (component E) applies
//! from. Grounded in the teacher's `networking::membership::raft` module and
//! `clustering::raft`, generalized from a single-DC cluster manager to the
//! per-datacenter server Raft group described in spec §3.2 and §4.2.

mod election;
mod log;
mod replication;

pub use election::{ElectionManager, ElectionTimeoutConfig, VoteRequest, VoteResponse};
pub use log::{LogEntry, LogIndex, RaftLog, Snapshot, Term};
pub use replication::{
    apply_append_entries, build_append_entries, build_install_snapshot, AppendEntriesRequest,
    AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, ReplicationTracker,
};

use crate::common::NodeId;
use crate::error::{AgentError, Result};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// Mutable consensus state for a single server-Raft-group member. Read
/// replicas (spec §3.1: "a read replica... never votes and is never counted
/// toward quorum") never transition out of `Follower`.
pub struct RaftStateData {
    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub members: Vec<NodeId>,
    pub read_replica: bool,
    /// Set once the leader has committed a no-op entry in its own term;
    /// reads are only safe to serve locally after this (spec §4.2).
    pub leader_readable: bool,
}

impl RaftStateData {
    pub fn new(members: Vec<NodeId>, read_replica: bool) -> Self {
        Self {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            members,
            read_replica,
            leader_readable: false,
        }
    }
}

/// Orchestrates log, election, and replication for one server Raft group
/// (one per datacenter, per spec §3.2: "each datacenter runs an independent
/// Raft group").
pub struct RaftConsensus {
    node_id: NodeId,
    state: Arc<RwLock<RaftStateData>>,
    log: Arc<RwLock<RaftLog>>,
    election: ElectionManager,
    replication: Arc<RwLock<ReplicationTracker>>,
    bootstrap_expect: usize,
}

impl RaftConsensus {
    pub fn new(
        node_id: NodeId,
        members: Vec<NodeId>,
        read_replica: bool,
        bootstrap_expect: usize,
        raft_multiplier: u32,
    ) -> Self {
        let log = Arc::new(RwLock::new(RaftLog::new()));
        let election = ElectionManager::new(
            node_id.clone(),
            ElectionTimeoutConfig::scaled(raft_multiplier),
            log.clone(),
        );
        Self {
            node_id,
            state: Arc::new(RwLock::new(RaftStateData::new(members, read_replica))),
            log,
            election,
            replication: Arc::new(RwLock::new(ReplicationTracker::new())),
            bootstrap_expect,
        }
    }

    /// `bootstrap_expect == 1` makes a lone server its own single-node
    /// cluster immediately (spec §9 open question, resolved: single-node
    /// clusters self-bootstrap rather than waiting for peers that will
    /// never arrive).
    pub async fn maybe_self_bootstrap(&self) {
        if self.bootstrap_expect != 1 {
            return;
        }
        let mut state = self.state.write().await;
        if state.members.len() <= 1 && state.role == RaftRole::Follower {
            info!(node = %self.node_id, "bootstrap_expect=1, self-electing as leader");
            state.role = RaftRole::Leader;
            state.current_term += 1;
            state.leader_id = Some(self.node_id.clone());
            let last_index = self.log.read().await.last_index();
            drop(state);
            self.replication
                .write()
                .await
                .initialize_for_term(&[], last_index);
            self.commit_leadership_noop().await;
        }
    }

    /// Transition to candidate and request votes is driven by the caller
    /// (the transport/RPC layer owns the actual network fan-out); this
    /// method only updates local state for the start of an election, per
    /// the teacher's separation of `ElectionManager` (timing/decision) from
    /// the owning membership module (network I/O).
    pub async fn begin_election(&self) -> (Term, VoteRequest) {
        let mut state = self.state.write().await;
        if state.read_replica {
            panic!("read replicas must never begin an election");
        }
        state.role = RaftRole::Candidate;
        state.current_term += 1;
        state.voted_for = Some(self.node_id.clone());
        state.leader_id = None;
        let term = state.current_term;
        drop(state);

        self.election.reset_timeout().await;
        let log = self.log.read().await;
        (
            term,
            VoteRequest {
                term,
                candidate_id: self.node_id.clone(),
                last_log_index: log.last_index(),
                last_log_term: log.last_term(),
            },
        )
    }

    /// Tally a vote response; returns `true` once a majority has been won
    /// and the node has transitioned to `Leader`.
    pub async fn record_vote(&self, election_term: Term, granted: bool, votes_so_far: usize) -> bool {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Candidate || state.current_term != election_term || !granted {
            return false;
        }
        let majority = state.members.len() / 2 + 1;
        if votes_so_far < majority {
            return false;
        }
        state.role = RaftRole::Leader;
        state.leader_id = Some(self.node_id.clone());
        info!(node = %self.node_id, term = election_term, "won election, became leader");
        let members = state.members.clone();
        let last_index = {
            drop(state);
            self.log.read().await.last_index()
        };
        self.replication
            .write()
            .await
            .initialize_for_term(&members, last_index);
        self.commit_leadership_noop().await;
        true
    }

    /// Append a no-op entry in the new leader's term and mark the node
    /// readable for local reads only once it commits (spec §4.2: "a new
    /// leader may serve reads only after it has committed a no-op entry in
    /// its own term").
    async fn commit_leadership_noop(&self) {
        let mut state = self.state.write().await;
        let term = state.current_term;
        state.leader_readable = false;
        drop(state);

        let mut log = self.log.write().await;
        let index = log.last_index() + 1;
        if log.append(LogEntry::new(term, index, Vec::new())).is_err() {
            warn!("failed to append leadership no-op entry");
        }
    }

    /// Called once the no-op entry (or any entry in the current term) has
    /// been confirmed committed by a majority.
    pub async fn mark_leader_readable_if_current_term_committed(&self) {
        let log = self.log.read().await;
        let state = self.state.read().await;
        if state.role != RaftRole::Leader {
            return;
        }
        let committed_in_term = log
            .get(state.commit_index)
            .map(|e| e.term == state.current_term)
            .unwrap_or(false);
        if committed_in_term {
            drop(state);
            self.state.write().await.leader_readable = true;
        }
    }

    /// Advance the commit index to the highest log index replicated to a
    /// majority, as tracked by [`ReplicationTracker`] (only meaningful on
    /// the leader).
    pub async fn advance_commit_index(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader {
            return Ok(());
        }
        let members = state.members.clone();
        let last_index = {
            drop(state);
            let log = self.log.read().await;
            let index = log.last_index();
            state = self.state.write().await;
            index
        };
        let majority = self
            .replication
            .read()
            .await
            .majority_match_index(&members, last_index);
        if majority > state.commit_index {
            debug!(new_commit = majority, "advancing commit index");
            state.commit_index = majority;
        }
        Ok(())
    }

    pub async fn step_down(&self, new_term: Term) {
        let mut state = self.state.write().await;
        if new_term > state.current_term {
            state.current_term = new_term;
            state.voted_for = None;
        }
        state.role = RaftRole::Follower;
        state.leader_readable = false;
        self.election.reset_timeout().await;
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.role == RaftRole::Leader
    }

    pub async fn can_serve_local_reads(&self) -> bool {
        let state = self.state.read().await;
        state.role == RaftRole::Leader && state.leader_readable
    }

    /// Record the leader a follower learned of from an `AppendEntries`
    /// heartbeat's `leader_id` field, so reads of [`current_leader`] and
    /// writes routed through it stay current without the follower ever
    /// contending for the role itself.
    pub async fn note_leader(&self, term: Term, leader_id: NodeId) {
        let mut state = self.state.write().await;
        if state.role != RaftRole::Leader && term >= state.current_term {
            state.current_term = term;
            state.leader_id = Some(leader_id);
        }
    }

    pub async fn current_leader(&self) -> Option<NodeId> {
        self.state.read().await.leader_id.clone()
    }

    pub async fn commit_index(&self) -> LogIndex {
        self.state.read().await.commit_index
    }

    pub async fn current_term(&self) -> Term {
        self.state.read().await.current_term
    }

    pub fn log(&self) -> Arc<RwLock<RaftLog>> {
        self.log.clone()
    }

    pub async fn assert_not_no_leader(&self) -> Result<()> {
        if self.state.read().await.leader_id.is_none() {
            return Err(AgentError::NoLeader);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[tokio::test]
    async fn single_node_self_bootstraps_when_expect_is_one() {
        let consensus = RaftConsensus::new(node("n1"), vec![node("n1")], false, 1, 1);
        consensus.maybe_self_bootstrap().await;
        assert!(consensus.is_leader().await);
    }

    #[tokio::test]
    async fn election_requires_majority_to_win() {
        let members = vec![node("n1"), node("n2"), node("n3")];
        let consensus = RaftConsensus::new(node("n1"), members, false, 3, 1);
        let (term, _request) = consensus.begin_election().await;
        assert!(!consensus.record_vote(term, true, 1).await);
        assert!(consensus.record_vote(term, true, 2).await);
        assert!(consensus.is_leader().await);
    }

    #[tokio::test]
    async fn step_down_on_higher_term_clears_leadership() {
        let consensus = RaftConsensus::new(node("n1"), vec![node("n1")], false, 1, 1);
        consensus.maybe_self_bootstrap().await;
        consensus.step_down(5).await;
        assert!(!consensus.is_leader().await);
        assert_eq!(consensus.current_term().await, 5);
    }

    #[tokio::test]
    async fn no_leader_reported_before_any_election() {
        let consensus = RaftConsensus::new(node("n1"), vec![node("n1"), node("n2")], false, 2, 1);
        assert!(consensus.assert_not_no_leader().await.is_err());
    }

    #[tokio::test]
    async fn follower_learns_leader_from_heartbeat() {
        let consensus = RaftConsensus::new(node("n2"), vec![node("n1"), node("n2")], false, 2, 1);
        consensus.note_leader(1, node("n1")).await;
        assert_eq!(consensus.current_leader().await, Some(node("n1")));
        assert!(!consensus.is_leader().await);
    }
}
