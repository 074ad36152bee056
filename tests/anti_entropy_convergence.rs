//! Scenario 5: anti-entropy convergence. A service registered only in the
//! local registry (as if the network to the servers had been down) is
//! picked up by a single reconciliation pass and appears in the catalog
//! exactly once; running the pass again makes no further changes.

mod common;

use agent::anti_entropy::{LocalRegistry, LocalServiceDef, Reconciler};
use agent::common::{NodeId, NodeMeta, NodeRole, TaggedAddresses};
use agent::fsm::Fsm;
use agent::services::CatalogService;
use std::sync::Arc;
use tokio::sync::RwLock;

#[tokio::test]
async fn local_registration_survives_one_partition_and_converges_in_one_pass() {
    let node_id = NodeId::new("n1");
    let fsm = Arc::new(RwLock::new(Fsm::new()));
    let submitter = common::ImmediateSubmitter::new(fsm.clone());
    let catalog = Arc::new(CatalogService::new(fsm, submitter));
    catalog
        .register_node(node_id.clone(), NodeRole::Server, "10.0.0.1".to_string(), "dc1".to_string(), String::new(), TaggedAddresses::default(), NodeMeta::default())
        .await
        .unwrap();

    let registry = Arc::new(LocalRegistry::new());
    registry
        .put(LocalServiceDef {
            service_id: "web-1".to_string(),
            name: "web".to_string(),
            tags: vec!["v1".to_string()],
            port: 80,
            meta: vec![],
        })
        .await;

    let reconciler = Reconciler::new(node_id.clone(), registry, catalog.clone());

    let first = reconciler.reconcile_once().await.unwrap();
    assert_eq!(first.registered, 1);
    assert_eq!(first.removed, 0);

    let (service, _) = catalog.services_by_name("web", false).await.into_iter().next().unwrap();
    assert_eq!(service.node_id, node_id);

    let second = reconciler.reconcile_once().await.unwrap();
    assert_eq!(second.registered, 0, "a converged catalog must not re-register on the next pass");
    assert_eq!(second.unchanged, 1);
}
