//! Gossip pool (component B): SWIM-style failure detection plus piggybacked
//! broadcasts over UDP+TCP. Two independent pools exist at runtime -- LAN
//! (per-datacenter, optionally sub-divided into segments) and WAN
//! (server-only, cross-datacenter) -- both built from the same [`GossipPool`]
//! primitive, the way the teacher's `networking::membership::swim` module is
//! reused by both `clustering::membership` and `networking::autodiscovery`.

mod broadcast;
mod swim;

pub use broadcast::{Broadcast, BroadcastQueue};
pub use swim::{GossipPool, GossipPoolConfig, MemberInfo, PendingProbe};

use crate::common::{MembershipState, NodeId, Segment};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Event stream exposed by a gossip pool: `{joined, failed, left, updated}`.
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    Joined(NodeId),
    Updated(NodeId, MembershipState),
    Failed(NodeId),
    Left(NodeId),
}

/// Kind of pool a [`GossipPool`] instance backs. LAN pools may additionally
/// be scoped to a [`Segment`]; WAN pools never are (spec §3.1: "servers are
/// present in all segments", and the WAN pool is server-only by definition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolKind {
    Lan { segment: Option<Segment> },
    Wan,
}

/// Gossip message envelope exchanged between probe/ack/indirect-probe and
/// the full push/pull state exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        sequence: u64,
    },
    Ack {
        from: NodeId,
        sequence: u64,
    },
    PingReq {
        from: NodeId,
        target: NodeId,
        sequence: u64,
    },
    Gossip {
        updates: Vec<MembershipUpdate>,
        broadcasts: Vec<Broadcast>,
    },
    PushPull {
        members: Vec<MembershipUpdate>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipUpdate {
    pub node_id: NodeId,
    pub state: MembershipState,
    pub incarnation: u64,
    pub timestamp: SystemTime,
}

/// Packets dropped at ingress and the reason, for the failure-model counters
/// spec §4.1 requires ("Bogus packets... are dropped and counted").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    BadChecksum,
    WrongClusterName,
    BadProtocolVersion,
    DisallowedCidr,
}
