//! Health aggregation (spec §4.5): a node or service's effective status is
//! the worst status among its checks. Grounded in the teacher's
//! `networking::health::aggregator`, which reduces several check results to
//! one canonical status the same way.
//!
//! Also owns `deregister_critical_service_after` (spec §4.4): a service
//! whose check has sat `Critical` longer than the configured threshold is
//! deregistered. Wall-clock critical-since tracking lives here, out-of-band
//! from the FSM, the same way `SessionService` tracks TTL deadlines outside
//! replicated state -- the FSM stays a pure function of the log, and only
//! whichever server notices the threshold elapsing submits the repair.

use crate::common::{CheckId, CheckStatus, NodeId};
use crate::fsm::{CheckEntry, Command, Fsm};
use crate::services::CommandSubmitter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct HealthService {
    fsm: Arc<RwLock<Fsm>>,
    submitter: Arc<dyn CommandSubmitter>,
    deregister_critical_service_after: Option<Duration>,
    /// When each (node, check) pair most recently transitioned into
    /// `Critical`; cleared the moment it leaves that state.
    critical_since: RwLock<HashMap<(NodeId, CheckId), SystemTime>>,
}

impl HealthService {
    pub fn new(fsm: Arc<RwLock<Fsm>>, submitter: Arc<dyn CommandSubmitter>, deregister_critical_service_after: Option<Duration>) -> Self {
        Self {
            fsm,
            submitter,
            deregister_critical_service_after,
            critical_since: RwLock::new(HashMap::new()),
        }
    }

    /// Worst-of-N reduction. `Critical` is worst, then `Maintenance` (a
    /// check deliberately pulled from rotation), then `Warning`, then
    /// `Passing`; a node with zero checks is considered `Passing`.
    fn worst(statuses: impl Iterator<Item = CheckStatus>) -> CheckStatus {
        statuses
            .max_by_key(|s| match s {
                CheckStatus::Passing => 0,
                CheckStatus::Warning => 1,
                CheckStatus::Maintenance => 2,
                CheckStatus::Critical => 3,
            })
            .unwrap_or(CheckStatus::Passing)
    }

    pub async fn node_checks(&self, node_id: &NodeId) -> Vec<CheckEntry> {
        self.fsm
            .read()
            .await
            .checks
            .iter_values()
            .into_iter()
            .filter(|(k, _)| &k.0 == node_id)
            .map(|(_, v)| v.value)
            .collect()
    }

    pub async fn node_status(&self, node_id: &NodeId) -> CheckStatus {
        let checks = self.node_checks(node_id).await;
        Self::worst(checks.into_iter().map(|c| c.status))
    }

    pub async fn service_status(&self, node_id: &NodeId, service_id: &str) -> CheckStatus {
        let fsm = self.fsm.read().await;
        let statuses = fsm
            .checks
            .iter_values()
            .into_iter()
            .filter(|(k, v)| &k.0 == node_id && v.value.service_id.as_deref() == Some(service_id))
            .map(|(_, v)| v.value.status);
        Self::worst(statuses)
    }

    pub async fn check(&self, node_id: &NodeId, check_id: &CheckId) -> Option<CheckEntry> {
        self.fsm
            .read()
            .await
            .checks
            .get(&(node_id.clone(), check_id.clone()))
            .map(|v| v.value)
    }

    /// Node/service pairs whose worst check is `Critical`, the set the
    /// anti-entropy and autopilot loops poll for cleanup candidates.
    pub async fn unhealthy_nodes(&self) -> Vec<NodeId> {
        let fsm = self.fsm.read().await;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for (key, versioned) in fsm.checks.iter_values() {
            if versioned.value.status == CheckStatus::Critical && seen.insert(key.0.clone()) {
                out.push(key.0);
            }
        }
        out
    }

    /// Update `critical_since` tracking against the current set of checks,
    /// then deregister any service whose check has been `Critical` longer
    /// than `deregister_critical_service_after` (spec §4.4). A no-op when
    /// that threshold is unconfigured.
    pub async fn sweep(&self) -> Vec<(NodeId, crate::common::ServiceId)> {
        let Some(threshold) = self.deregister_critical_service_after else {
            return Vec::new();
        };
        let now = SystemTime::now();
        let checks = self.fsm.read().await.checks.iter_values();

        let mut still_critical = std::collections::HashSet::new();
        let mut to_deregister: Vec<((NodeId, CheckId), crate::common::ServiceId)> = Vec::new();
        {
            let mut critical_since = self.critical_since.write().await;
            for (key, versioned) in &checks {
                if versioned.value.status != CheckStatus::Critical {
                    continue;
                }
                still_critical.insert(key.clone());
                let since = *critical_since.entry(key.clone()).or_insert(now);
                if let Some(service_id) = &versioned.value.service_id {
                    if now.duration_since(since).unwrap_or(Duration::ZERO) >= threshold {
                        to_deregister.push((key.clone(), service_id.clone()));
                    }
                }
            }
            critical_since.retain(|key, _| still_critical.contains(key));
        }

        let mut deregistered = Vec::new();
        for ((node_id, check_id), service_id) in to_deregister {
            let result = self
                .submitter
                .submit(Command::DeregisterService {
                    request_id: Uuid::new_v4(),
                    node_id: node_id.clone(),
                    service_id: service_id.clone(),
                    index: 0,
                })
                .await;
            if result.is_ok() {
                self.critical_since.write().await.remove(&(node_id.clone(), check_id));
                deregistered.push((node_id, service_id));
            }
        }
        deregistered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct LocalSubmitter {
        fsm: Arc<RwLock<Fsm>>,
        next_index: std::sync::atomic::AtomicU64,
    }

    #[async_trait]
    impl CommandSubmitter for LocalSubmitter {
        async fn submit(&self, command: Command) -> crate::error::Result<crate::fsm::ApplyResult> {
            let index = self
                .next_index
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            Ok(self.fsm.write().await.apply(index, command))
        }
    }

    fn make_service(fsm: Arc<RwLock<Fsm>>, threshold: Option<Duration>) -> HealthService {
        let submitter = Arc::new(LocalSubmitter {
            fsm: fsm.clone(),
            next_index: std::sync::atomic::AtomicU64::new(0),
        });
        HealthService::new(fsm, submitter, threshold)
    }

    #[tokio::test]
    async fn node_status_is_worst_of_its_checks() {
        let fsm = Arc::new(RwLock::new(Fsm::new()));
        let node_id = NodeId::new("n1");
        {
            let mut f = fsm.write().await;
            f.apply(
                1,
                Command::UpdateCheck {
                    request_id: Uuid::new_v4(),
                    check: CheckEntry {
                        check_id: "c1".into(),
                        node_id: node_id.clone(),
                        service_id: None,
                        status: CheckStatus::Passing,
                        output: "ok".into(),
                    },
                },
            );
            f.apply(
                2,
                Command::UpdateCheck {
                    request_id: Uuid::new_v4(),
                    check: CheckEntry {
                        check_id: "c2".into(),
                        node_id: node_id.clone(),
                        service_id: None,
                        status: CheckStatus::Critical,
                        output: "timeout".into(),
                    },
                },
            );
        }
        let health = make_service(fsm, Some(Duration::from_secs(30)));
        assert_eq!(health.node_status(&node_id).await, CheckStatus::Critical);
    }

    #[tokio::test]
    async fn maintenance_outranks_warning_but_not_critical() {
        let fsm = Arc::new(RwLock::new(Fsm::new()));
        let node_id = NodeId::new("n1");
        fsm.write().await.apply(
            1,
            Command::UpdateCheck {
                request_id: Uuid::new_v4(),
                check: CheckEntry {
                    check_id: "c1".into(),
                    node_id: node_id.clone(),
                    service_id: None,
                    status: CheckStatus::Warning,
                    output: String::new(),
                },
            },
        );
        fsm.write().await.apply(
            2,
            Command::UpdateCheck {
                request_id: Uuid::new_v4(),
                check: CheckEntry {
                    check_id: "c2".into(),
                    node_id: node_id.clone(),
                    service_id: None,
                    status: CheckStatus::Maintenance,
                    output: String::new(),
                },
            },
        );
        let health = make_service(fsm, Some(Duration::from_secs(30)));
        assert_eq!(health.node_status(&node_id).await, CheckStatus::Maintenance);
    }

    #[tokio::test]
    async fn sweep_deregisters_a_service_once_its_check_has_been_critical_past_the_threshold() {
        let fsm = Arc::new(RwLock::new(Fsm::new()));
        let node_id = NodeId::new("n1");
        {
            let mut f = fsm.write().await;
            f.apply(
                1,
                Command::RegisterNode {
                    request_id: Uuid::new_v4(),
                    node: crate::fsm::CatalogNode {
                        node_id: node_id.clone(),
                        role: crate::common::NodeRole::Client,
                        address: "10.0.0.1".into(),
                        datacenter: "dc1".into(),
                        segment: String::new(),
                        tagged_addresses: Default::default(),
                        meta: Default::default(),
                    },
                },
            );
            f.apply(
                2,
                Command::RegisterService {
                    request_id: Uuid::new_v4(),
                    service: crate::fsm::CatalogService {
                        service_id: "web1".into(),
                        node_id: node_id.clone(),
                        name: "web".into(),
                        tags: vec![],
                        port: 8080,
                        meta: Default::default(),
                    },
                },
            );
            f.apply(
                3,
                Command::UpdateCheck {
                    request_id: Uuid::new_v4(),
                    check: CheckEntry {
                        check_id: "c1".into(),
                        node_id: node_id.clone(),
                        service_id: Some("web1".into()),
                        status: CheckStatus::Critical,
                        output: "down".into(),
                    },
                },
            );
        }
        let health = make_service(fsm.clone(), Some(Duration::ZERO));
        let deregistered = health.sweep().await;
        assert_eq!(deregistered, vec![(node_id.clone(), "web1".to_string())]);
        assert!(fsm.read().await.services.get(&(node_id, "web1".to_string())).is_none());
    }
}
