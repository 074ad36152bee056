//! Node and service registration/query (spec §3.1, §4.3). Grounded in the
//! teacher's `clustering::node` (NodeInfo shape) and
//! `networking::discovery::consul` (the register/deregister/list vocabulary
//! this mirrors for drop-in Consul-style clients).

use super::CommandSubmitter;
use crate::common::{CheckId, CheckStatus, Index, NodeId, NodeMeta, NodeRole, ServiceId, TaggedAddresses};
use crate::error::{AgentError, Result};
use crate::fsm::{ApplyResult, CatalogNode, CatalogService as CatalogServiceEntry, CheckEntry, Command, Fsm};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct CatalogService {
    fsm: Arc<RwLock<Fsm>>,
    submitter: Arc<dyn CommandSubmitter>,
}

impl CatalogService {
    pub fn new(fsm: Arc<RwLock<Fsm>>, submitter: Arc<dyn CommandSubmitter>) -> Self {
        Self { fsm, submitter }
    }

    pub async fn register_node(
        &self,
        node_id: NodeId,
        role: NodeRole,
        address: String,
        datacenter: String,
        segment: String,
        tagged_addresses: TaggedAddresses,
        meta: NodeMeta,
    ) -> Result<()> {
        let node = CatalogNode {
            node_id,
            role,
            address,
            datacenter,
            segment,
            tagged_addresses,
            meta,
        };
        self.submit(Command::RegisterNode {
            request_id: Uuid::new_v4(),
            node,
        })
        .await
    }

    pub async fn deregister_node(&self, node_id: NodeId) -> Result<()> {
        self.submit(Command::DeregisterNode {
            request_id: Uuid::new_v4(),
            node_id,
            index: 0,
        })
        .await
    }

    pub async fn register_service(
        &self,
        node_id: NodeId,
        service_id: ServiceId,
        name: String,
        tags: Vec<String>,
        port: u16,
        meta: NodeMeta,
    ) -> Result<()> {
        let service = CatalogServiceEntry {
            service_id,
            node_id,
            name,
            tags,
            port,
            meta,
        };
        self.submit(Command::RegisterService {
            request_id: Uuid::new_v4(),
            service,
        })
        .await
    }

    pub async fn deregister_service(&self, node_id: NodeId, service_id: ServiceId) -> Result<()> {
        self.submit(Command::DeregisterService {
            request_id: Uuid::new_v4(),
            node_id,
            service_id,
            index: 0,
        })
        .await
    }

    pub async fn update_check(
        &self,
        node_id: NodeId,
        check_id: CheckId,
        service_id: Option<ServiceId>,
        status: CheckStatus,
        output: String,
    ) -> Result<()> {
        self.submit(Command::UpdateCheck {
            request_id: Uuid::new_v4(),
            check: CheckEntry {
                check_id,
                node_id,
                service_id,
                status,
                output,
            },
        })
        .await
    }

    pub async fn nodes(&self) -> Vec<CatalogNode> {
        self.fsm
            .read()
            .await
            .nodes
            .iter_values()
            .into_iter()
            .map(|(_, v)| v.value)
            .collect()
    }

    /// Services currently registered in the catalog for a given node, used
    /// by anti-entropy (component G) to diff against the agent's local
    /// registry.
    pub async fn services_by_name_for_node(&self, node_id: &NodeId) -> Vec<CatalogServiceEntry> {
        self.fsm
            .read()
            .await
            .services
            .iter_values()
            .into_iter()
            .filter(|(k, _)| &k.0 == node_id)
            .map(|(_, v)| v.value)
            .collect()
    }

    /// List service instances by name, filtered to nodes passing health
    /// status requirements the caller supplies (spec §4.3: "health-filtered
    /// service lookups are the common read path").
    pub async fn services_by_name(&self, name: &str, only_passing: bool) -> Vec<(CatalogServiceEntry, Vec<CheckEntry>)> {
        let fsm = self.fsm.read().await;
        let mut out = Vec::new();
        for (_, versioned) in fsm.services.iter_values() {
            let service = versioned.value;
            if service.name != name {
                continue;
            }
            let checks: Vec<CheckEntry> = fsm
                .checks
                .iter_values()
                .into_iter()
                .filter(|(k, _)| k.0 == service.node_id)
                .map(|(_, v)| v.value)
                .collect();
            if only_passing && checks.iter().any(|c| c.status != CheckStatus::Passing) {
                continue;
            }
            out.push((service, checks));
        }
        out
    }

    pub async fn index(&self) -> Index {
        self.fsm.read().await.services.last_index()
    }

    async fn submit(&self, command: Command) -> Result<()> {
        match self.submitter.submit(command).await? {
            ApplyResult::Ok => Ok(()),
            ApplyResult::NotFound => Err(AgentError::NotFound("catalog entry".to_string())),
            ApplyResult::Duplicate => Ok(()),
            ApplyResult::CasFailed => Err(AgentError::Catalog("unexpected cas outcome".to_string())),
            ApplyResult::InvalidReference => {
                Err(AgentError::Catalog("service references a node that isn't registered".to_string()))
            }
        }
    }
}
