//! Anti-entropy reconciliation (component G): periodically diffs an agent's
//! local service/check registry against the replicated catalog and
//! re-asserts anything missing, the way the teacher's
//! `networking::autodiscovery::anti_entropy` periodically reconciles
//! membership snapshots. We trade the teacher's full Merkle tree for a
//! flat per-entry digest comparison (`sha2`) since a single agent's local
//! registry is small -- at most a few hundred services -- and a tree's
//! sublinear diff cost isn't worth the complexity at that scale.

use crate::common::{CheckId, CheckStatus, NodeId, NodeMeta, ServiceId};
use crate::services::CatalogService;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalServiceDef {
    pub service_id: ServiceId,
    pub name: String,
    pub tags: Vec<String>,
    pub port: u16,
    pub meta: Vec<(String, String)>,
}

impl LocalServiceDef {
    fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.service_id.as_bytes());
        hasher.update(self.name.as_bytes());
        for tag in &self.tags {
            hasher.update(tag.as_bytes());
        }
        hasher.update(self.port.to_le_bytes());
        for (k, v) in &self.meta {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.finalize().into()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalCheckDef {
    pub check_id: CheckId,
    pub service_id: Option<ServiceId>,
    pub status: Option<CheckStatus>,
}

/// The agent's source-of-truth registry, populated by config files and the
/// HTTP registration API (spec §4.3: "the agent keeps its own local
/// registry independent of catalog state, reconciled periodically").
#[derive(Default)]
pub struct LocalRegistry {
    services: RwLock<HashMap<ServiceId, LocalServiceDef>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, service: LocalServiceDef) {
        self.services.write().await.insert(service.service_id.clone(), service);
    }

    pub async fn remove(&self, service_id: &str) {
        self.services.write().await.remove(service_id);
    }

    pub async fn snapshot(&self) -> Vec<LocalServiceDef> {
        self.services.read().await.values().cloned().collect()
    }
}

/// Drives one reconciliation pass, comparing the local registry against
/// whatever the replicated catalog currently knows for this node.
pub struct Reconciler {
    node_id: NodeId,
    registry: Arc<LocalRegistry>,
    catalog: Arc<CatalogService>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub registered: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl Reconciler {
    pub fn new(node_id: NodeId, registry: Arc<LocalRegistry>, catalog: Arc<CatalogService>) -> Self {
        Self {
            node_id,
            registry,
            catalog,
        }
    }

    pub async fn reconcile_once(&self) -> crate::error::Result<ReconcileReport> {
        let local = self.registry.snapshot().await;
        let local_digests: HashMap<ServiceId, [u8; 32]> =
            local.iter().map(|s| (s.service_id.clone(), s.digest())).collect();

        let remote = self.catalog.services_by_name_for_node(&self.node_id).await;

        let mut report = ReconcileReport::default();

        for def in &local {
            let remote_matches = remote
                .iter()
                .find(|r| r.service_id == def.service_id)
                .map(|r| r.name == def.name && r.tags == def.tags && r.port == def.port)
                .unwrap_or(false);
            if remote_matches {
                report.unchanged += 1;
                continue;
            }
            let mut meta = NodeMeta::default();
            for (k, v) in &def.meta {
                meta.insert(k.clone(), v.clone())?;
            }
            self.catalog
                .register_service(
                    self.node_id.clone(),
                    def.service_id.clone(),
                    def.name.clone(),
                    def.tags.clone(),
                    def.port,
                    meta,
                )
                .await?;
            report.registered += 1;
            debug!(service = %def.service_id, "reconciled local service into catalog");
        }

        for remote_service in &remote {
            if !local_digests.contains_key(&remote_service.service_id) {
                self.catalog
                    .deregister_service(self.node_id.clone(), remote_service.service_id.clone())
                    .await?;
                report.removed += 1;
                warn!(service = %remote_service.service_id, "removed catalog entry with no local definition");
            }
        }

        Ok(report)
    }

    /// Run [`reconcile_once`] on a fixed interval until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.reconcile_once().await {
                Ok(report) if report.registered > 0 || report.removed > 0 => {
                    info!(?report, "anti-entropy reconciliation changed catalog state");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "anti-entropy reconciliation failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_changes_when_tags_change() {
        let a = LocalServiceDef {
            service_id: "web1".into(),
            name: "web".into(),
            tags: vec!["v1".into()],
            port: 80,
            meta: vec![],
        };
        let mut b = a.clone();
        b.tags = vec!["v2".into()];
        assert_ne!(a.digest(), b.digest());
    }

    #[tokio::test]
    async fn local_registry_put_remove_round_trip() {
        let registry = LocalRegistry::new();
        registry
            .put(LocalServiceDef {
                service_id: "web1".into(),
                name: "web".into(),
                tags: vec![],
                port: 80,
                meta: vec![],
            })
            .await;
        assert_eq!(registry.snapshot().await.len(), 1);
        registry.remove("web1").await;
        assert!(registry.snapshot().await.is_empty());
    }
}
