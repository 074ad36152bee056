//! Session lifecycle (spec §5): sessions tie a TTL and an optional set of
//! health checks to a node; when the session is invalidated (TTL expiry,
//! explicit destroy, or an associated check going critical) any KV keys it
//! holds are released or deleted per its configured behavior. The
//! expiry-sweep loop follows the teacher's periodic-tick pattern in
//! `networking::membership::swim::protocol_tick`.

use super::{CommandSubmitter, KvService};
use crate::common::{CheckId, CheckStatus, NodeId, SessionId};
use crate::error::Result;
use crate::fsm::{Fsm, SessionBehavior, SessionEntry};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::fsm::Command;

pub struct SessionService {
    fsm: Arc<RwLock<Fsm>>,
    submitter: Arc<dyn CommandSubmitter>,
    kv: Arc<KvService>,
    /// Wall-clock deadlines tracked out-of-band from the FSM, since TTL
    /// expiry is driven by local time on whichever server notices it, not
    /// something that can live in replicated state directly.
    deadlines: RwLock<std::collections::HashMap<SessionId, SystemTime>>,
}

impl SessionService {
    pub fn new(fsm: Arc<RwLock<Fsm>>, submitter: Arc<dyn CommandSubmitter>, kv: Arc<KvService>) -> Self {
        Self {
            fsm,
            submitter,
            kv,
            deadlines: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub async fn create(
        &self,
        node_id: NodeId,
        behavior: SessionBehavior,
        ttl_seconds: u64,
        lock_delay_seconds: u64,
        checks: Vec<CheckId>,
    ) -> Result<SessionId> {
        let id = Uuid::new_v4();
        self.submitter
            .submit(Command::SessionCreate {
                request_id: Uuid::new_v4(),
                session: SessionEntry {
                    id,
                    node_id,
                    behavior,
                    ttl_seconds,
                    lock_delay_seconds,
                    checks,
                },
            })
            .await?;
        self.deadlines
            .write()
            .await
            .insert(id, SystemTime::now() + Duration::from_secs(ttl_seconds.max(10)));
        Ok(id)
    }

    /// Reset a session's TTL deadline (spec §5: "renew extends the TTL
    /// window; a session with no renewal within 2x TTL is destroyed").
    pub async fn renew(&self, id: SessionId) -> Result<()> {
        let fsm = self.fsm.read().await;
        let session = fsm.sessions.get(&id);
        drop(fsm);
        if let Some(session) = session {
            self.deadlines.write().await.insert(
                id,
                SystemTime::now() + Duration::from_secs(session.value.ttl_seconds.max(10)),
            );
        }
        Ok(())
    }

    /// Invalidate a session: the FSM releases or deletes the keys it holds
    /// per its `behavior` in the same log entry, then -- for any key it held
    /// the lock on -- this arms that key's lock-delay window so a different
    /// session can't immediately grab it out from under a holder that may
    /// just be partitioned rather than actually gone (spec §5).
    pub async fn destroy(&self, id: SessionId) -> Result<()> {
        let session = self.fsm.read().await.sessions.get(&id).map(|v| v.value);
        let held_keys: Vec<String> = if let Some(session) = &session {
            if session.lock_delay_seconds > 0 {
                self.fsm
                    .read()
                    .await
                    .kv
                    .iter_values()
                    .into_iter()
                    .filter(|(_, v)| v.value.session == Some(id))
                    .map(|(k, _)| k)
                    .collect()
            } else {
                Vec::new()
            }
        } else {
            Vec::new()
        };

        self.submitter
            .submit(Command::SessionDestroy {
                request_id: Uuid::new_v4(),
                session_id: id,
                index: 0,
            })
            .await?;
        self.deadlines.write().await.remove(&id);

        if let Some(session) = session {
            let delay = Duration::from_secs(session.lock_delay_seconds);
            for key in held_keys {
                self.kv.note_lock_delay(key, delay).await;
            }
        }
        Ok(())
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionEntry> {
        self.fsm.read().await.sessions.get(&id).map(|v| v.value)
    }

    /// Sweep sessions past 2x TTL without renewal, and sessions whose
    /// associated checks have gone `Critical` (spec §5: "a failed health
    /// check tied to a session invalidates it immediately").
    pub async fn sweep(&self) -> Vec<SessionId> {
        let now = SystemTime::now();
        let expired_by_ttl: Vec<SessionId> = self
            .deadlines
            .read()
            .await
            .iter()
            .filter(|(_, deadline)| now.duration_since(**deadline).map(|d| d > Duration::ZERO).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();

        let expired_by_check = self.sessions_with_failed_checks().await;

        let mut destroyed = Vec::new();
        for id in expired_by_ttl.into_iter().chain(expired_by_check) {
            if self.destroy(id).await.is_ok() {
                destroyed.push(id);
            }
        }
        destroyed
    }

    async fn sessions_with_failed_checks(&self) -> Vec<SessionId> {
        let fsm = self.fsm.read().await;
        let mut out = Vec::new();
        for (_, versioned) in fsm.sessions.iter_values() {
            let session = versioned.value;
            if session.checks.is_empty() {
                continue;
            }
            let failed = session.checks.iter().any(|check_id| {
                fsm.checks
                    .get(&(session.node_id.clone(), check_id.clone()))
                    .map(|c| c.value.status == CheckStatus::Critical)
                    .unwrap_or(true)
            });
            if failed {
                out.push(session.id);
            }
        }
        out
    }
}
