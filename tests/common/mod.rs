//! Shared in-process test harness: an immediate-apply [`CommandSubmitter`]
//! used by every end-to-end scenario test so none of them need a running
//! Raft group or a real socket to exercise the FSM and service façades.

use agent::fsm::{ApplyResult, Command, Fsm};
use agent::services::CommandSubmitter;
use agent::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct ImmediateSubmitter {
    pub fsm: Arc<RwLock<Fsm>>,
    next_index: AtomicU64,
}

impl ImmediateSubmitter {
    pub fn new(fsm: Arc<RwLock<Fsm>>) -> Arc<Self> {
        Arc::new(Self {
            fsm,
            next_index: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl CommandSubmitter for ImmediateSubmitter {
    async fn submit(&self, command: Command) -> Result<ApplyResult> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(self.fsm.write().await.apply(index, command))
    }
}
