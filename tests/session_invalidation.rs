//! Scenario 6: session invalidation. A `release`-behavior session holds a
//! lock; destroying the session (standing in for TTL expiry, which
//! `SessionService::sweep` drives through the same `destroy` path) releases
//! the lock without touching the key's value. With no lock-delay configured
//! the lock is immediately reacquirable by a different session; with a
//! lock-delay configured, reacquisition is refused until it elapses.

mod common;

use agent::common::NodeId;
use agent::fsm::{Fsm, SessionBehavior};
use agent::services::{KvService, SessionService};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[tokio::test]
async fn destroying_a_release_session_frees_its_lock_and_leaves_the_value_untouched() {
    let fsm = Arc::new(RwLock::new(Fsm::new()));
    let submitter = common::ImmediateSubmitter::new(fsm.clone());
    let kv = Arc::new(KvService::new(fsm.clone(), submitter.clone()));
    let sessions = SessionService::new(fsm.clone(), submitter.clone(), kv.clone());

    let node_id = NodeId::new("n1");
    let session = sessions.create(node_id, SessionBehavior::Release, 10, 0, vec![]).await.unwrap();

    kv.put("k".to_string(), b"v1".to_vec()).await.unwrap();
    assert!(kv.acquire_lock("k".to_string(), session).await.unwrap());

    sessions.destroy(session).await.unwrap();
    assert!(sessions.get(session).await.is_none());

    let value = kv.get("k").await.unwrap();
    assert_eq!(value.value, b"v1");
    assert_eq!(value.session, None, "release behavior must clear the lock holder, not the value");

    let other_session = sessions.create(NodeId::new("n2"), SessionBehavior::Release, 10, 0, vec![]).await.unwrap();
    assert!(kv.acquire_lock("k".to_string(), other_session).await.unwrap(), "the lock must be reacquirable once freed");
}

#[tokio::test]
async fn lock_delay_on_the_session_defers_reacquisition_after_invalidation() {
    let fsm = Arc::new(RwLock::new(Fsm::new()));
    let submitter = common::ImmediateSubmitter::new(fsm.clone());
    let kv = Arc::new(KvService::new(fsm.clone(), submitter.clone()));
    let sessions = SessionService::new(fsm.clone(), submitter.clone(), kv.clone());

    // A 1-second lock-delay is as short as whole-second TTL/lock-delay
    // fields allow; the sleep below just needs to clear it.
    let node_id = NodeId::new("n1");
    let session = sessions.create(node_id, SessionBehavior::Release, 10, 1, vec![]).await.unwrap();
    kv.put("k".to_string(), b"v1".to_vec()).await.unwrap();
    assert!(kv.acquire_lock("k".to_string(), session).await.unwrap());

    sessions.destroy(session).await.unwrap();

    let other_session = sessions.create(NodeId::new("n2"), SessionBehavior::Release, 10, 0, vec![]).await.unwrap();
    assert!(
        !kv.acquire_lock("k".to_string(), other_session).await.unwrap(),
        "lock-delay must block reacquisition before it elapses"
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(kv.acquire_lock("k".to_string(), other_session).await.unwrap());
}
