//! Leader election: randomized timeouts scaled by `performance.raft_multiplier`.
//! Adapted from the teacher's `networking::membership::raft::election` module.

use super::log::{RaftLog, Term};
use crate::common::NodeId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ElectionTimeoutConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_timeout: Duration,
    pub leader_lease_timeout: Duration,
}

impl ElectionTimeoutConfig {
    /// Scale the base timeouts by `performance.raft_multiplier in [1,10]`
    /// (spec §4.2), preserving the invariant
    /// `leader_lease_timeout < heartbeat_timeout < election_timeout`.
    pub fn scaled(multiplier: u32) -> Self {
        let multiplier = multiplier.clamp(1, 10) as f64;
        Self {
            election_timeout_min: Duration::from_millis((1000.0 * multiplier) as u64),
            election_timeout_max: Duration::from_millis((2000.0 * multiplier) as u64),
            heartbeat_timeout: Duration::from_millis((500.0 * multiplier) as u64),
            leader_lease_timeout: Duration::from_millis((100.0 * multiplier) as u64),
        }
    }
}

pub struct ElectionManager {
    node_id: NodeId,
    config: ElectionTimeoutConfig,
    log: Arc<RwLock<RaftLog>>,
    election_timeout: Arc<RwLock<Duration>>,
    last_activity: Arc<RwLock<SystemTime>>,
}

impl ElectionManager {
    pub fn new(node_id: NodeId, config: ElectionTimeoutConfig, log: Arc<RwLock<RaftLog>>) -> Self {
        let timeout = Self::random_timeout(&config);
        Self {
            node_id,
            config,
            log,
            election_timeout: Arc::new(RwLock::new(timeout)),
            last_activity: Arc::new(RwLock::new(SystemTime::now())),
        }
    }

    fn random_timeout(config: &ElectionTimeoutConfig) -> Duration {
        let min = config.election_timeout_min.as_millis() as u64;
        let max = config.election_timeout_max.as_millis() as u64;
        let ms = rand::rng().random_range(min..=max.max(min + 1));
        Duration::from_millis(ms)
    }

    pub async fn reset_timeout(&self) {
        *self.election_timeout.write().await = Self::random_timeout(&self.config);
        *self.last_activity.write().await = SystemTime::now();
    }

    pub async fn has_timed_out(&self) -> bool {
        let last = *self.last_activity.read().await;
        let timeout = *self.election_timeout.read().await;
        SystemTime::now()
            .duration_since(last)
            .map(|elapsed| elapsed >= timeout)
            .unwrap_or(false)
    }

    /// Decide a vote response given a candidate's request, the node's
    /// current term and who (if anyone) it has already voted for this term.
    pub async fn decide_vote(
        &self,
        request: &VoteRequest,
        current_term: Term,
        voted_for: &Option<NodeId>,
    ) -> VoteResponse {
        if request.term < current_term {
            return VoteResponse {
                term: current_term,
                vote_granted: false,
                reason: Some("stale term".to_string()),
            };
        }

        let already_voted = matches!(voted_for, Some(v) if v != &request.candidate_id)
            && request.term == current_term;
        if already_voted {
            return VoteResponse {
                term: current_term,
                vote_granted: false,
                reason: Some("already voted this term".to_string()),
            };
        }

        let log = self.log.read().await;
        let candidate_up_to_date = request.last_log_term > log.last_term()
            || (request.last_log_term == log.last_term() && request.last_log_index >= log.last_index());

        if !candidate_up_to_date {
            return VoteResponse {
                term: request.term.max(current_term),
                vote_granted: false,
                reason: Some("candidate log is behind".to_string()),
            };
        }

        self.reset_timeout().await;
        VoteResponse {
            term: request.term,
            vote_granted: true,
            reason: None,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.config.heartbeat_timeout
    }

    pub fn leader_lease_timeout(&self) -> Duration {
        self.config.leader_lease_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_ordering_invariant_holds() {
        for m in 1..=10 {
            let cfg = ElectionTimeoutConfig::scaled(m);
            assert!(cfg.leader_lease_timeout < cfg.heartbeat_timeout);
            assert!(cfg.heartbeat_timeout < cfg.election_timeout_min);
        }
    }

    #[tokio::test]
    async fn rejects_vote_for_stale_term() {
        let em = ElectionManager::new(
            NodeId::new("n1"),
            ElectionTimeoutConfig::scaled(1),
            Arc::new(RwLock::new(RaftLog::new())),
        );
        let req = VoteRequest {
            term: 0,
            candidate_id: NodeId::new("n2"),
            last_log_index: 0,
            last_log_term: 0,
        };
        let resp = em.decide_vote(&req, 5, &None).await;
        assert!(!resp.vote_granted);
    }

    #[tokio::test]
    async fn grants_vote_when_log_up_to_date_and_unvoted() {
        let em = ElectionManager::new(
            NodeId::new("n1"),
            ElectionTimeoutConfig::scaled(1),
            Arc::new(RwLock::new(RaftLog::new())),
        );
        let req = VoteRequest {
            term: 1,
            candidate_id: NodeId::new("n2"),
            last_log_index: 0,
            last_log_term: 0,
        };
        let resp = em.decide_vote(&req, 1, &None).await;
        assert!(resp.vote_granted);
    }
}
