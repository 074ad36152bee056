//! Error taxonomy for the agent.
//!
//! Mirrors the six kinds from the coordination-platform specification:
//! `ConfigError`, `TransientNetworkError`, `NoLeader`, `ConsistencyViolation`,
//! `QuotaExceeded`, and `Fatal`. Retry policy is documented behavior on
//! callers (retry kinds 2-3 only, never 4, panic-after-drain for 6) rather
//! than encoded in the enum itself.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    // -- ConfigError: validation failure during load; fatal before supervisor start.
    #[error("configuration error: {0}")]
    Config(String),

    // -- TransientNetworkError: connection reset, timeout, DNS failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("gossip error: {0}")]
    Gossip(String),

    #[error("no servers reachable in datacenter {0}")]
    NoServersReachable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    // -- NoLeader: cluster has no leader or server is too stale.
    #[error("no leader available")]
    NoLeader,

    #[error("stale read rejected: last contact exceeds max_stale")]
    StaleReadRejected,

    // -- ConsistencyViolation: CAS mismatch, missing session, ACL denial, bad log entry.
    #[error("raft error: {0}")]
    Raft(String),

    #[error("cas index mismatch: expected {expected}, found {found}")]
    CasMismatch { expected: u64, found: u64 },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("lock held by another session")]
    LockHeld,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid log entry: {0}")]
    InvalidLogEntry(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("kv error: {0}")]
    Kv(String),

    #[error("discovery chain error: {0}")]
    DiscoveryChain(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    // -- QuotaExceeded: rate or connection limit.
    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    QuotaExceeded { retry_after_ms: u64 },

    #[error("too many connections for client")]
    ConnectionLimitExceeded,

    // -- Fatal: data-dir corruption, duplicate node id, key mismatch, FSM apply error.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl AgentError {
    /// True for kinds that may be retried locally without surfacing to the caller
    /// (spec §7: "retry locally only for kinds 2-3").
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Io(_)
                | AgentError::Transport(_)
                | AgentError::Gossip(_)
                | AgentError::NoServersReachable(_)
                | AgentError::Timeout(_)
                | AgentError::NoLeader
                | AgentError::StaleReadRejected
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for AgentError {
    fn from(e: bincode::error::EncodeError) -> Self {
        AgentError::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for AgentError {
    fn from(e: bincode::error::DecodeError) -> Self {
        AgentError::Serialization(e.to_string())
    }
}
