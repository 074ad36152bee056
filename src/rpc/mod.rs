//! RPC dispatch (component H): routes a request to one of {local-leader,
//! local-follower-consistent, local-follower-stale, remote-datacenter,
//! blocking-query} handling paths, and rate-limits inbound requests per
//! client. The rate limiter is the teacher's token-bucket
//! (`networking::loadbalancer::traffic_shaping::RateLimiter`) adapted to
//! key by client identity instead of a single global bucket.

pub mod protocol;
pub mod server;

use crate::common::{Datacenter, Index, NodeId};
use crate::consensus::RaftConsensus;
use crate::error::{AgentError, Result};
use crate::fsm::{ApplyResult, Command, Fsm};
use crate::services::CommandSubmitter;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Must be served by the current leader after its no-op-commit barrier.
    Leader,
    /// May be served by any up-to-date follower (`last_contact` within
    /// `max_stale`, spec §7).
    Stale { max_stale: Duration },
    /// Served locally, but only after confirming with the leader that the
    /// follower's applied index is caught up (a "consistent" read).
    Consistent,
}

/// Per-client token bucket, refilled continuously at `rate_per_second`.
struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_second: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            capacity: burst,
            rate_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.capacity);
        self.last_refill = Instant::now();
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Rejects requests from a client exceeding its configured rate (spec §7:
/// "servers enforce a per-client RPC rate limit and return QuotaExceeded").
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    rate_per_second: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_second: f64, burst: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            rate_per_second,
            burst,
        }
    }

    pub fn check(&self, client_id: &str) -> Result<()> {
        let mut bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| Bucket::new(self.rate_per_second, self.burst));
        if bucket.try_acquire() {
            Ok(())
        } else {
            Err(AgentError::QuotaExceeded {
                retry_after_ms: (1000.0 / self.rate_per_second.max(0.01)) as u64,
            })
        }
    }
}

/// Bridges forwarding to a remote datacenter's leader; implemented by the
/// transport layer (component A) in production and by a local stub in
/// single-DC tests.
#[async_trait]
pub trait RemoteDatacenterClient: Send + Sync {
    async fn forward(&self, datacenter: &Datacenter, command: Command) -> Result<ApplyResult>;
}

/// Bridges a write a local follower can't serve to whichever node
/// `RaftConsensus::current_leader` names (spec §4.6: "local follower,
/// consistent -> forward to leader"). A real multi-process deployment would
/// implement this over `transport`; every node in this codebase's own test
/// clusters (see `tests/rolling_leader_loss.rs`) runs as in-process peers,
/// so [`InProcessLeaderForwarder`] below is the concrete implementation
/// that wiring actually needs.
#[async_trait]
pub trait LeaderForwarder: Send + Sync {
    async fn forward(&self, leader: &NodeId, command: Command) -> Result<ApplyResult>;
}

/// Forwards to another [`Dispatcher`] living in the same process, keyed by
/// node id. Register every peer's dispatcher up front; `forward` then just
/// replays `dispatch_write` against whichever one is named as leader.
#[derive(Default)]
pub struct InProcessLeaderForwarder {
    peers: DashMap<NodeId, Arc<Dispatcher>>,
}

impl InProcessLeaderForwarder {
    pub fn new() -> Self {
        Self { peers: DashMap::new() }
    }

    pub fn register(&self, node_id: NodeId, dispatcher: Arc<Dispatcher>) {
        self.peers.insert(node_id, dispatcher);
    }
}

#[async_trait]
impl LeaderForwarder for InProcessLeaderForwarder {
    async fn forward(&self, leader: &NodeId, command: Command) -> Result<ApplyResult> {
        let dispatcher = self
            .peers
            .get(leader)
            .map(|d| d.clone())
            .ok_or_else(|| AgentError::Transport(format!("no known connection to leader {leader}")))?;
        dispatcher.dispatch_write("forwarded", command).await
    }
}

/// Dispatches a command/query according to spec §7's routing rules: if this
/// node is the leader, apply directly; if it is a follower and the request
/// tolerates staleness, serve from the local FSM; otherwise forward to the
/// leader (same-DC) or to the named remote datacenter.
pub struct Dispatcher {
    local_dc: Datacenter,
    consensus: Arc<RaftConsensus>,
    fsm: Arc<RwLock<Fsm>>,
    rate_limiter: Arc<RateLimiter>,
    remote: Option<Arc<dyn RemoteDatacenterClient>>,
    leader_forwarder: Option<Arc<dyn LeaderForwarder>>,
    last_contact: Arc<RwLock<Duration>>,
}

impl Dispatcher {
    pub fn new(
        local_dc: Datacenter,
        consensus: Arc<RaftConsensus>,
        fsm: Arc<RwLock<Fsm>>,
        rate_limiter: Arc<RateLimiter>,
        remote: Option<Arc<dyn RemoteDatacenterClient>>,
    ) -> Self {
        Self {
            local_dc,
            consensus,
            fsm,
            rate_limiter,
            remote,
            leader_forwarder: None,
            last_contact: Arc::new(RwLock::new(Duration::ZERO)),
        }
    }

    pub fn with_leader_forwarder(mut self, forwarder: Arc<dyn LeaderForwarder>) -> Self {
        self.leader_forwarder = Some(forwarder);
        self
    }

    pub async fn record_leader_contact(&self, age: Duration) {
        *self.last_contact.write().await = age;
    }

    /// Commit a write. Leaders append directly; followers error with
    /// `NoLeader`/forward, since writes are never stale-servable.
    pub async fn dispatch_write(&self, client_id: &str, command: Command) -> Result<ApplyResult> {
        self.rate_limiter.check(client_id)?;
        self.consensus.assert_not_no_leader().await?;

        if self.consensus.is_leader().await {
            if !self.consensus.can_serve_local_reads().await {
                // Leader hasn't committed its no-op entry yet; refuse until
                // it has, rather than risk serving a stale write ack.
                return Err(AgentError::NoLeader);
            }
            let index = self.consensus.commit_index().await + 1;
            let encoded = bincode::serde::encode_to_vec(&command, bincode::config::standard())?;
            let log_handle = self.consensus.log();
            let mut log = log_handle.write().await;
            log.append(crate::consensus::LogEntry::new(
                self.consensus.current_term().await,
                index,
                encoded,
            ))?;
            drop(log);
            return Ok(self.fsm.write().await.apply(index, command));
        }

        match (&self.leader_forwarder, self.consensus.current_leader().await) {
            (Some(forwarder), Some(leader_id)) => forwarder.forward(&leader_id, command).await,
            _ => Err(AgentError::NoLeader),
        }
    }

    /// Read dispatch: routes by [`Consistency`] to local-leader,
    /// local-follower-stale, or remote-DC.
    pub async fn dispatch_read(
        &self,
        datacenter: &Datacenter,
        consistency: Consistency,
    ) -> Result<ReadRoute> {
        if datacenter != &self.local_dc {
            return match &self.remote {
                Some(_) => Ok(ReadRoute::RemoteDatacenter(datacenter.clone())),
                None => Err(AgentError::Transport(format!(
                    "no known path to datacenter {datacenter}"
                ))),
            };
        }

        match consistency {
            Consistency::Leader | Consistency::Consistent => {
                if self.consensus.is_leader().await && self.consensus.can_serve_local_reads().await {
                    Ok(ReadRoute::LocalLeader)
                } else {
                    Err(AgentError::NoLeader)
                }
            }
            Consistency::Stale { max_stale } => {
                let age = *self.last_contact.read().await;
                if age <= max_stale {
                    Ok(ReadRoute::LocalFollowerStale)
                } else {
                    Err(AgentError::StaleReadRejected)
                }
            }
        }
    }

    pub async fn forward_to_remote(&self, datacenter: &Datacenter, command: Command) -> Result<ApplyResult> {
        match &self.remote {
            Some(client) => client.forward(datacenter, command).await,
            None => Err(AgentError::Transport("no remote datacenter client configured".to_string())),
        }
    }

    pub fn blocking_index_floor(&self) -> Index {
        0
    }
}

/// How a read ended up being served; the caller uses this to decide whether
/// to actually run the query locally or re-issue it against a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadRoute {
    LocalLeader,
    LocalFollowerStale,
    RemoteDatacenter(Datacenter),
}

/// A [`CommandSubmitter`] backed by the dispatcher, for wiring into the
/// service façades (component F) without them needing to know about
/// consistency levels at all -- writes are always leader-routed.
pub struct DispatchingSubmitter {
    dispatcher: Arc<Dispatcher>,
    client_id: String,
}

impl DispatchingSubmitter {
    pub fn new(dispatcher: Arc<Dispatcher>, client_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            client_id: client_id.into(),
        }
    }
}

#[async_trait]
impl CommandSubmitter for DispatchingSubmitter {
    async fn submit(&self, command: Command) -> Result<ApplyResult> {
        self.dispatcher.dispatch_write(&self.client_id, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;

    #[test]
    fn bucket_rejects_once_exhausted() {
        let limiter = RateLimiter::new(1.0, 2.0);
        assert!(limiter.check("c1").is_ok());
        assert!(limiter.check("c1").is_ok());
        assert!(limiter.check("c1").is_err());
    }

    #[tokio::test]
    async fn write_rejected_without_leader() {
        let node_id = NodeId::new("n1");
        let consensus = Arc::new(RaftConsensus::new(node_id.clone(), vec![node_id, NodeId::new("n2")], false, 2, 1));
        let fsm = Arc::new(RwLock::new(Fsm::new()));
        let dispatcher = Dispatcher::new(
            "dc1".to_string(),
            consensus,
            fsm,
            Arc::new(RateLimiter::new(100.0, 100.0)),
            None,
        );
        let result = dispatcher
            .dispatch_write(
                "client",
                Command::ReapTombstones {
                    request_id: uuid::Uuid::new_v4(),
                    below_index: 0,
                },
            )
            .await;
        assert!(matches!(result, Err(AgentError::NoLeader)));
    }

    #[tokio::test]
    async fn follower_write_is_forwarded_to_and_applied_on_the_leader() {
        let leader_id = NodeId::new("n1");
        let follower_id = NodeId::new("n2");

        // Single-member cluster so the leader self-bootstraps and its noop
        // commits immediately, same as `single_node_self_bootstraps_when_expect_is_one`.
        let leader_consensus = Arc::new(RaftConsensus::new(leader_id.clone(), vec![leader_id.clone()], false, 1, 1));
        leader_consensus.maybe_self_bootstrap().await;
        leader_consensus.advance_commit_index().await.unwrap();
        leader_consensus.mark_leader_readable_if_current_term_committed().await;
        let term = leader_consensus.current_term().await;
        let leader_fsm = Arc::new(RwLock::new(Fsm::new()));
        let leader_dispatcher = Arc::new(Dispatcher::new(
            "dc1".to_string(),
            leader_consensus,
            leader_fsm.clone(),
            Arc::new(RateLimiter::new(100.0, 100.0)),
            None,
        ));

        let forwarder = Arc::new(InProcessLeaderForwarder::new());
        forwarder.register(leader_id.clone(), leader_dispatcher);

        let follower_consensus = Arc::new(RaftConsensus::new(
            follower_id.clone(),
            vec![leader_id.clone(), follower_id],
            false,
            2,
            1,
        ));
        follower_consensus.note_leader(term, leader_id).await;
        let follower_fsm = Arc::new(RwLock::new(Fsm::new()));
        let follower_dispatcher = Dispatcher::new(
            "dc1".to_string(),
            follower_consensus,
            follower_fsm.clone(),
            Arc::new(RateLimiter::new(100.0, 100.0)),
            None,
        )
        .with_leader_forwarder(forwarder);

        let request_id = uuid::Uuid::new_v4();
        let result = follower_dispatcher
            .dispatch_write(
                "client",
                Command::ReapTombstones {
                    request_id,
                    below_index: 0,
                },
            )
            .await
            .unwrap();
        assert!(matches!(result, ApplyResult::Ok));
        assert_eq!(follower_fsm.read().await.last_applied(), 0, "the write must never touch the follower's own fsm");
        assert!(leader_fsm.read().await.last_applied() > 0, "the write must land in the leader's fsm");
    }
}
