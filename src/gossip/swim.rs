//! SWIM protocol core: direct/indirect probing, suspicion, and push/pull
//! state sync. Adapted from the teacher's `networking::membership::swim`
//! module and generalized to serve both the LAN and WAN pools (spec §4.1).

use super::{DropReason, GossipMessage, MembershipEvent, MembershipUpdate, PoolKind};
use crate::common::{MembershipState, NodeId};
use crate::error::{AgentError, Result};
use rand::seq::{IndexedRandom, SliceRandom};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, RwLock};
use tokio::time;

/// Tunables from spec §4.1's table.
#[derive(Debug, Clone)]
pub struct GossipPoolConfig {
    pub cluster_name: String,
    pub protocol_version: u8,
    pub gossip_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub suspicion_mult: u32,
    pub retransmit_mult: u32,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub allowed_cidrs: Vec<ipnet_lite::Cidr>,
}

/// A tiny inline CIDR matcher so the crate does not need a dedicated
/// `ipnet` dependency solely for this one allow-list check.
pub mod ipnet_lite {
    use std::net::IpAddr;

    #[derive(Debug, Clone)]
    pub struct Cidr {
        pub network: IpAddr,
        pub prefix_len: u8,
    }

    impl Cidr {
        pub fn contains(&self, addr: &IpAddr) -> bool {
            match (self.network, addr) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = if self.prefix_len == 0 {
                        0
                    } else {
                        u32::MAX << (32 - self.prefix_len)
                    };
                    (u32::from(net) & mask) == (u32::from(*ip) & mask)
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = if self.prefix_len == 0 {
                        0
                    } else {
                        u128::MAX << (128 - self.prefix_len)
                    };
                    (u128::from(net) & mask) == (u128::from(*ip) & mask)
                }
                _ => false,
            }
        }
    }
}

impl Default for GossipPoolConfig {
    fn default() -> Self {
        Self {
            cluster_name: "default".to_string(),
            protocol_version: 2,
            gossip_interval: Duration::from_millis(200),
            probe_interval: Duration::from_millis(1000),
            probe_timeout: Duration::from_millis(500),
            suspicion_mult: 4,
            retransmit_mult: 4,
            gossip_nodes: 3,
            push_pull_interval: Duration::from_secs(30),
            allowed_cidrs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub node_id: NodeId,
    pub addr: IpAddr,
    pub state: MembershipState,
    pub incarnation: u64,
    pub last_seen: SystemTime,
    pub suspected_at: Option<SystemTime>,
}

impl MemberInfo {
    fn new(node_id: NodeId, addr: IpAddr) -> Self {
        Self {
            node_id,
            addr,
            state: MembershipState::Alive,
            incarnation: 0,
            last_seen: SystemTime::now(),
            suspected_at: None,
        }
    }

    /// Higher-incarnation updates always win; equal-incarnation updates only
    /// move a member toward failure, never resurrect it (suspicion
    /// refutation is expressed as the refuting node bumping its own
    /// incarnation and re-announcing `Alive`).
    fn apply_update(&mut self, state: MembershipState, incarnation: u64) -> bool {
        if incarnation < self.incarnation {
            return false;
        }
        if incarnation == self.incarnation && Self::state_rank(state) <= Self::state_rank(self.state)
        {
            return false;
        }
        self.state = state;
        self.incarnation = incarnation;
        self.last_seen = SystemTime::now();
        self.suspected_at = if state == MembershipState::Suspect {
            Some(SystemTime::now())
        } else {
            None
        };
        true
    }

    fn state_rank(state: MembershipState) -> u8 {
        match state {
            MembershipState::Alive => 0,
            MembershipState::Suspect => 1,
            MembershipState::Failed => 2,
            MembershipState::Left => 3,
        }
    }
}

pub struct PendingProbe {
    pub target: NodeId,
    pub sequence: u64,
    pub sent_at: SystemTime,
    pub indirect: bool,
}

/// One SWIM pool instance -- either the LAN pool (optionally scoped to a
/// segment) or the server-only WAN pool.
pub struct GossipPool {
    pub kind: PoolKind,
    local: NodeId,
    config: GossipPoolConfig,
    members: Arc<RwLock<HashMap<NodeId, MemberInfo>>>,
    pending: Arc<RwLock<HashMap<u64, PendingProbe>>>,
    sequence: Arc<RwLock<u64>>,
    event_tx: mpsc::Sender<MembershipEvent>,
    dropped_packets: Arc<RwLock<HashMap<DropReason, u64>>>,
}

impl GossipPool {
    pub fn new(
        kind: PoolKind,
        local: NodeId,
        config: GossipPoolConfig,
    ) -> (Self, mpsc::Receiver<MembershipEvent>) {
        let (event_tx, event_rx) = mpsc::channel(1024);
        let pool = Self {
            kind,
            local,
            config,
            members: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(RwLock::new(HashMap::new())),
            sequence: Arc::new(RwLock::new(0)),
            event_tx,
            dropped_packets: Arc::new(RwLock::new(HashMap::new())),
        };
        (pool, event_rx)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Suspicion window: `suspicion_mult * log(N)` scaled by the probe
    /// interval, per spec §4.1.
    pub async fn suspicion_timeout(&self) -> Duration {
        let n = self.member_count().await.max(1) as f64;
        let scale = (self.config.suspicion_mult as f64) * n.ln().max(1.0);
        self.config.probe_interval.mul_f64(scale)
    }

    /// Broadcast retransmit budget: `retransmit_mult * log(N)`, per spec §4.1.
    pub async fn retransmit_limit(&self) -> u32 {
        let n = self.member_count().await.max(1) as f64;
        ((self.config.retransmit_mult as f64) * n.ln().max(1.0)).ceil() as u32
    }

    pub async fn join(&self, node_id: NodeId, addr: IpAddr) {
        let mut members = self.members.write().await;
        members
            .entry(node_id.clone())
            .or_insert_with(|| MemberInfo::new(node_id.clone(), addr));
        drop(members);
        let _ = self.event_tx.send(MembershipEvent::Joined(node_id)).await;
    }

    /// Accept an inbound ingress packet; validates cluster name, protocol
    /// version, and source CIDR before any further processing (spec §4.1
    /// failure model).
    pub fn admit(&self, cluster_name: &str, protocol_version: u8, source: IpAddr) -> Result<()> {
        if cluster_name != self.config.cluster_name {
            return self.reject(DropReason::WrongClusterName);
        }
        if protocol_version != self.config.protocol_version {
            return self.reject(DropReason::BadProtocolVersion);
        }
        if !self.config.allowed_cidrs.is_empty()
            && !self
                .config
                .allowed_cidrs
                .iter()
                .any(|cidr| cidr.contains(&source))
        {
            return self.reject(DropReason::DisallowedCidr);
        }
        Ok(())
    }

    fn reject(&self, reason: DropReason) -> Result<()> {
        // Counter increment happens synchronously on the blocking map; a
        // background task periodically drains it into metrics.
        let dropped = self.dropped_packets.clone();
        tokio::spawn(async move {
            let mut guard = dropped.write().await;
            *guard.entry(reason).or_insert(0) += 1;
        });
        Err(AgentError::Gossip(format!("dropped packet: {reason:?}")))
    }

    async fn next_sequence(&self) -> u64 {
        let mut seq = self.sequence.write().await;
        *seq += 1;
        *seq
    }

    /// One SWIM protocol period: probe a random peer directly, falling back
    /// to `k` indirect probers on timeout.
    pub async fn protocol_tick(&self) -> Result<()> {
        let target = {
            let members = self.members.read().await;
            members
                .values()
                .filter(|m| m.node_id != self.local && m.state != MembershipState::Left)
                .collect::<Vec<_>>()
                .choose(&mut rand::rng())
                .map(|m| m.node_id.clone())
        };

        let Some(target) = target else {
            return Ok(());
        };

        let sequence = self.next_sequence().await;
        self.pending.write().await.insert(
            sequence,
            PendingProbe {
                target: target.clone(),
                sequence,
                sent_at: SystemTime::now(),
                indirect: false,
            },
        );

        // Direct probe send is delegated to the transport layer by the
        // caller (Agent Supervisor); this method owns only protocol state.
        time::sleep(self.config.probe_timeout).await;

        let timed_out = self.pending.write().await.remove(&sequence).is_some();
        if timed_out {
            self.begin_indirect_probe(target, sequence).await?;
        }
        Ok(())
    }

    async fn begin_indirect_probe(&self, target: NodeId, sequence: u64) -> Result<()> {
        let helpers: Vec<NodeId> = {
            let members = self.members.read().await;
            let mut candidates: Vec<NodeId> = members
                .values()
                .filter(|m| m.node_id != self.local && m.node_id != target)
                .map(|m| m.node_id.clone())
                .collect();
            candidates.shuffle(&mut rand::rng());
            candidates.truncate(self.config.gossip_nodes);
            candidates
        };

        if helpers.is_empty() {
            self.mark_suspect(target, 0).await;
            return Ok(());
        }

        self.pending.write().await.insert(
            sequence,
            PendingProbe {
                target: target.clone(),
                sequence,
                sent_at: SystemTime::now(),
                indirect: true,
            },
        );
        // Indirect probe requests are dispatched by the caller to `helpers`.
        let suspicion_timeout = self.suspicion_timeout().await;
        time::sleep(suspicion_timeout).await;

        if self.pending.write().await.remove(&sequence).is_some() {
            self.mark_suspect(target, 0).await;
        }
        Ok(())
    }

    pub async fn mark_suspect(&self, node_id: NodeId, incarnation: u64) {
        let changed = {
            let mut members = self.members.write().await;
            members
                .get_mut(&node_id)
                .map(|m| m.apply_update(MembershipState::Suspect, incarnation))
                .unwrap_or(false)
        };
        if changed {
            let _ = self
                .event_tx
                .send(MembershipEvent::Updated(
                    node_id.clone(),
                    MembershipState::Suspect,
                ))
                .await;
            self.schedule_suspicion_expiry(node_id).await;
        }
    }

    async fn schedule_suspicion_expiry(&self, node_id: NodeId) {
        let timeout = self.suspicion_timeout().await;
        let members = self.members.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            time::sleep(timeout).await;
            let still_suspect = {
                let guard = members.read().await;
                guard
                    .get(&node_id)
                    .map(|m| m.state == MembershipState::Suspect)
                    .unwrap_or(false)
            };
            if still_suspect {
                let mut guard = members.write().await;
                if let Some(m) = guard.get_mut(&node_id) {
                    m.state = MembershipState::Failed;
                }
                drop(guard);
                let _ = event_tx.send(MembershipEvent::Failed(node_id)).await;
            }
        });
    }

    pub async fn handle_ack(&self, sequence: u64) {
        self.pending.write().await.remove(&sequence);
    }

    /// Apply a full push/pull state exchange, which is how suspicion gets
    /// refuted (a higher incarnation `Alive` update overrides the local
    /// `Suspect` state).
    pub async fn apply_push_pull(&self, updates: Vec<MembershipUpdate>) {
        let mut members = self.members.write().await;
        for update in updates {
            let entry = members
                .entry(update.node_id.clone())
                .or_insert_with(|| MemberInfo::new(update.node_id.clone(), "0.0.0.0".parse().unwrap()));
            entry.apply_update(update.state, update.incarnation);
        }
    }

    pub async fn snapshot(&self) -> Vec<MembershipUpdate> {
        self.members
            .read()
            .await
            .values()
            .map(|m| MembershipUpdate {
                node_id: m.node_id.clone(),
                state: m.state,
                incarnation: m.incarnation,
                timestamp: m.last_seen,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name)
    }

    #[tokio::test]
    async fn join_emits_joined_event() {
        let (pool, mut rx) = GossipPool::new(
            PoolKind::Lan { segment: None },
            node("local"),
            GossipPoolConfig::default(),
        );
        pool.join(node("peer"), "127.0.0.1".parse().unwrap()).await;
        match rx.recv().await {
            Some(MembershipEvent::Joined(n)) => assert_eq!(n.name, "peer"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn suspicion_escalates_to_failed_after_timeout() {
        let mut config = GossipPoolConfig::default();
        config.probe_interval = Duration::from_millis(1);
        config.suspicion_mult = 1;
        let (pool, mut rx) = GossipPool::new(PoolKind::Lan { segment: None }, node("local"), config);
        pool.join(node("peer"), "127.0.0.1".parse().unwrap()).await;
        let _ = rx.recv().await; // Joined
        pool.mark_suspect(node("peer"), 0).await;
        let _ = rx.recv().await; // Updated(Suspect)
        let event = rx.recv().await;
        assert!(matches!(event, Some(MembershipEvent::Failed(_))));
    }

    #[tokio::test]
    async fn higher_incarnation_refutes_suspicion() {
        let (pool, mut rx) = GossipPool::new(
            PoolKind::Lan { segment: None },
            node("local"),
            GossipPoolConfig::default(),
        );
        pool.join(node("peer"), "127.0.0.1".parse().unwrap()).await;
        let _ = rx.recv().await;
        pool.mark_suspect(node("peer"), 0).await;
        let _ = rx.recv().await;

        pool.apply_push_pull(vec![MembershipUpdate {
            node_id: node("peer"),
            state: MembershipState::Alive,
            incarnation: 1,
            timestamp: SystemTime::now(),
        }])
        .await;

        let snapshot = pool.snapshot().await;
        let peer = snapshot.iter().find(|m| m.node_id.name == "peer").unwrap();
        assert_eq!(peer.state, MembershipState::Alive);
    }

    #[test]
    fn cidr_matches_prefix() {
        let cidr = ipnet_lite::Cidr {
            network: "10.0.0.0".parse().unwrap(),
            prefix_len: 8,
        };
        assert!(cidr.contains(&"10.1.2.3".parse().unwrap()));
        assert!(!cidr.contains(&"11.0.0.1".parse().unwrap()));
    }
}
