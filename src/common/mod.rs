//! Shared types and traits used across every agent module.
//!
//! Serves the same role as the teacher's `common` module: a foundation of
//! identifiers, small value types, and lifecycle traits that the rest of the
//! crate builds on, so that components interact through well-defined
//! contracts instead of ad hoc structs passed around.

pub mod bounded_map;

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

pub use bounded_map::BoundedHashMap;

// ============================================================================
// Bounds from spec §3.1 (node meta) and §4.5 (check output)
// ============================================================================

/// Maximum number of keys in a node's tagged metadata map.
pub const MAX_NODE_META_KEYS: usize = 64;
/// Maximum byte length of a node meta key.
pub const MAX_NODE_META_KEY_LEN: usize = 128;
/// Maximum byte length of a node meta value.
pub const MAX_NODE_META_VALUE_LEN: usize = 512;
/// Default cap on a health check's output buffer.
pub const DEFAULT_CHECK_OUTPUT_MAX_SIZE: usize = 4096;

// ============================================================================
// Identifiers
// ============================================================================

/// Stable identifier for a cluster node: a UUID paired with a human name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub id: Uuid,
    pub name: String,
}

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }

    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Cluster-wide monotonically increasing sequence number assigned by the FSM
/// when applying a log entry (spec §3.2).
pub type Index = u64;

/// Datacenter name, validated against `^[a-z0-9_-]+$` (spec §6).
pub type Datacenter = String;

/// Named partition of the LAN gossip pool (spec §3.1). Every node belongs to
/// exactly one LAN segment; servers are present in all segments.
pub type Segment = String;

pub type ServiceId = String;
pub type CheckId = String;
pub type SessionId = Uuid;

// ============================================================================
// Node role & membership (spec §3.1)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Client,
    Server,
    ReadReplica,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipState {
    Alive,
    Suspect,
    Failed,
    Left,
}

/// Bounded tagged-address and meta maps, enforcing the limits above.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaggedAddresses {
    pub wan: Option<String>,
    pub lan_ipv4: Option<String>,
    pub lan_ipv6: Option<String>,
    pub lan: Option<String>,
}

impl TaggedAddresses {
    /// Fixed lookup order from spec §4.4: `{wan, lan_ipv4, lan_ipv6, lan, ...}`.
    pub fn resolve(&self, key: Option<&str>) -> Option<&str> {
        if let Some(key) = key {
            return match key {
                "wan" => self.wan.as_deref(),
                "lan_ipv4" => self.lan_ipv4.as_deref(),
                "lan_ipv6" => self.lan_ipv6.as_deref(),
                "lan" => self.lan.as_deref(),
                _ => None,
            };
        }
        self.wan
            .as_deref()
            .or(self.lan_ipv4.as_deref())
            .or(self.lan_ipv6.as_deref())
            .or(self.lan.as_deref())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeMeta(HashMap<String, String>);

impl NodeMeta {
    pub fn insert(&mut self, key: String, value: String) -> Result<()> {
        if !self.0.contains_key(&key) && self.0.len() >= MAX_NODE_META_KEYS {
            return Err(crate::AgentError::InvalidArgument(format!(
                "node_meta exceeds {MAX_NODE_META_KEYS} keys"
            )));
        }
        if key.len() > MAX_NODE_META_KEY_LEN {
            return Err(crate::AgentError::InvalidArgument(format!(
                "node_meta key exceeds {MAX_NODE_META_KEY_LEN} bytes"
            )));
        }
        if value.len() > MAX_NODE_META_VALUE_LEN {
            return Err(crate::AgentError::InvalidArgument(format!(
                "node_meta value exceeds {MAX_NODE_META_VALUE_LEN} bytes"
            )));
        }
        self.0.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

// ============================================================================
// Lifecycle trait (grounded in the teacher's `Component` trait)
// ============================================================================

/// Standard lifecycle interface implemented by every major component (A-J).
/// The Agent Supervisor (component J) drives all components through this
/// trait in dependency order.
pub trait Component: Send + Sync {
    fn name(&self) -> &'static str;

    fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

// ============================================================================
// Catalog health-check status (spec §3.2): distinct from `HealthStatus`
// above, which is the internal liveness signal a `Component` reports about
// itself. This is the four-state status a registered health check carries
// in the catalog.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckStatus {
    Passing,
    Warning,
    Critical,
    Maintenance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_meta_rejects_too_many_keys() {
        let mut meta = NodeMeta::default();
        for i in 0..MAX_NODE_META_KEYS {
            meta.insert(format!("k{i}"), "v".to_string()).unwrap();
        }
        let err = meta.insert("overflow".to_string(), "v".to_string());
        assert!(err.is_err());
    }

    #[test]
    fn node_meta_rejects_oversized_value() {
        let mut meta = NodeMeta::default();
        let huge = "x".repeat(MAX_NODE_META_VALUE_LEN + 1);
        assert!(meta.insert("k".to_string(), huge).is_err());
    }

    #[test]
    fn tagged_address_lookup_order() {
        let addrs = TaggedAddresses {
            wan: None,
            lan_ipv4: Some("10.0.0.1".into()),
            lan_ipv6: None,
            lan: Some("192.168.0.1".into()),
        };
        assert_eq!(addrs.resolve(None), Some("10.0.0.1"));
    }
}
