//! Catalog/health/KV/session/ACL façades (component F): the public service
//! layer the RPC dispatcher (component H) and CLI surface call into. Reads
//! go straight to the FSM's tables; writes are handed to whatever commits
//! them to the replicated log, via the [`CommandSubmitter`] seam -- mirrors
//! the teacher's pattern of a `ClusterManager` facade (`clustering::mod`)
//! sitting in front of the lower-level Raft/gossip machinery.

pub mod acl;
pub mod catalog;
pub mod health;
pub mod kv;
pub mod session;

use crate::error::Result;
use crate::fsm::{ApplyResult, Command};
use async_trait::async_trait;

/// Abstracts "commit this command and tell me what happened" so the
/// service façades don't need to know whether they're running on the
/// leader, forwarding to it, or (in tests) applying directly to a local
/// FSM.
#[async_trait]
pub trait CommandSubmitter: Send + Sync {
    async fn submit(&self, command: Command) -> Result<ApplyResult>;
}

pub use acl::AclService;
pub use catalog::CatalogService;
pub use health::HealthService;
pub use kv::KvService;
pub use session::SessionService;
