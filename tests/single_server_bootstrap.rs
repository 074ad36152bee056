//! Scenario 1: single-server bootstrap. A lone `bootstrap_expect=1` server
//! self-elects immediately, a register call succeeds, and a listing query
//! reflects it right away (the in-process stand-in for a blocking query
//! with `min_index=0`, since there is no transport layer in this harness).

mod common;

use agent::common::{NodeId, NodeMeta, NodeRole, TaggedAddresses};
use agent::consensus::RaftConsensus;
use agent::fsm::Fsm;
use agent::services::CatalogService;
use std::sync::Arc;
use tokio::sync::RwLock;

#[tokio::test]
async fn single_server_bootstrap_then_register_is_immediately_visible() {
    let node_id = NodeId::new("n1");
    let consensus = RaftConsensus::new(node_id.clone(), vec![node_id.clone()], false, 1, 1);
    consensus.maybe_self_bootstrap().await;
    assert!(consensus.is_leader().await, "bootstrap_expect=1 must self-elect");

    let fsm = Arc::new(RwLock::new(Fsm::new()));
    let submitter = common::ImmediateSubmitter::new(fsm.clone());
    let catalog = CatalogService::new(fsm, submitter);

    catalog
        .register_node(
            node_id.clone(),
            NodeRole::Server,
            "10.0.0.1".to_string(),
            "dc1".to_string(),
            String::new(),
            TaggedAddresses::default(),
            NodeMeta::default(),
        )
        .await
        .unwrap();
    catalog
        .register_service(node_id.clone(), "web-1".to_string(), "web".to_string(), vec![], 80, NodeMeta::default())
        .await
        .unwrap();

    let (service, _checks) = catalog
        .services_by_name("web", false)
        .await
        .into_iter()
        .next()
        .expect("web service must be visible immediately after registration");
    assert_eq!(service.port, 80);
    assert_eq!(service.node_id, node_id);
}
