//! Key/value store and distributed locking (spec §5). The lock primitive is
//! plain KV plus a session reference: acquiring a lock is a CAS that only
//! succeeds when the key is absent or already held by the caller's session,
//! the same encoding the teacher's `clustering::coordinator` uses for
//! leader-election-by-KV before it grew a dedicated Raft module.

use super::CommandSubmitter;
use crate::common::{Index, SessionId};
use crate::error::{AgentError, Result};
use crate::fsm::{ApplyResult, Command, Fsm, KvEntry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;
use uuid::Uuid;

pub struct KvService {
    fsm: Arc<RwLock<Fsm>>,
    submitter: Arc<dyn CommandSubmitter>,
    /// Per-key deadline before which `acquire_lock` refuses to hand the lock
    /// back out, set when a session holding it is invalidated (spec §5:
    /// "lock-delay prevents immediate re-acquisition").
    lock_delay_until: RwLock<HashMap<String, SystemTime>>,
}

#[derive(Debug, Clone)]
pub struct KvValue {
    pub value: Vec<u8>,
    pub session: Option<SessionId>,
    pub modify_index: Index,
}

impl KvService {
    pub fn new(fsm: Arc<RwLock<Fsm>>, submitter: Arc<dyn CommandSubmitter>) -> Self {
        Self {
            fsm,
            submitter,
            lock_delay_until: RwLock::new(HashMap::new()),
        }
    }

    /// Called when a session holding `key`'s lock is invalidated, so a
    /// subsequent `acquire_lock` is refused until `delay` elapses. A zero
    /// delay is a no-op.
    pub async fn note_lock_delay(&self, key: String, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.lock_delay_until.write().await.insert(key, SystemTime::now() + delay);
    }

    pub async fn get(&self, key: &str) -> Option<KvValue> {
        self.fsm.read().await.kv.get(&key.to_string()).map(|v| KvValue {
            value: v.value.value,
            session: v.value.session,
            modify_index: v.modify_index,
        })
    }

    pub async fn list_prefix(&self, prefix: &str) -> Vec<(String, KvValue)> {
        self.fsm
            .read()
            .await
            .kv
            .iter_values()
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| {
                (
                    k,
                    KvValue {
                        value: v.value.value,
                        session: v.value.session,
                        modify_index: v.modify_index,
                    },
                )
            })
            .collect()
    }

    pub async fn put(&self, key: String, value: Vec<u8>) -> Result<()> {
        self.submit(Command::KvPut {
            request_id: Uuid::new_v4(),
            key,
            entry: KvEntry { value, session: None },
        })
        .await
    }

    pub async fn cas(&self, key: String, value: Vec<u8>, expected_index: Index) -> Result<bool> {
        let result = self
            .submitter
            .submit(Command::KvCas {
                request_id: Uuid::new_v4(),
                key,
                entry: KvEntry { value, session: None },
                expected_index,
            })
            .await?;
        Ok(matches!(result, ApplyResult::Ok))
    }

    pub async fn delete(&self, key: String) -> Result<()> {
        self.submit(Command::KvDelete {
            request_id: Uuid::new_v4(),
            key,
            index: 0,
        })
        .await
    }

    /// Acquire a lock: CAS the key to reference `session`, only succeeding
    /// if unheld or already held by that session (idempotent re-acquire).
    /// Refused outright while the key is still under its lock-delay window.
    pub async fn acquire_lock(&self, key: String, session: SessionId) -> Result<bool> {
        {
            let mut delays = self.lock_delay_until.write().await;
            if let Some(deadline) = delays.get(&key) {
                if SystemTime::now() < *deadline {
                    return Ok(false);
                }
                delays.remove(&key);
            }
        }
        let existing = self.fsm.read().await.kv.get(&key);
        if let Some(existing) = &existing {
            if let Some(holder) = existing.value.session {
                return Ok(holder == session);
            }
        }
        let expected_index = existing.as_ref().map(|e| e.modify_index).unwrap_or(0);
        let payload = existing.map(|e| e.value.value).unwrap_or_default();
        let result = self
            .submitter
            .submit(Command::KvCas {
                request_id: Uuid::new_v4(),
                key,
                entry: KvEntry {
                    value: payload,
                    session: Some(session),
                },
                expected_index,
            })
            .await?;
        Ok(matches!(result, ApplyResult::Ok))
    }

    pub async fn release_lock(&self, key: String, session: SessionId) -> Result<bool> {
        let existing = self.fsm.read().await.kv.get(&key.clone());
        let Some(existing) = existing else {
            return Ok(false);
        };
        if existing.value.session != Some(session) {
            return Ok(false);
        }
        let result = self
            .submitter
            .submit(Command::KvCas {
                request_id: Uuid::new_v4(),
                key,
                entry: KvEntry {
                    value: existing.value.value,
                    session: None,
                },
                expected_index: existing.modify_index,
            })
            .await?;
        Ok(matches!(result, ApplyResult::Ok))
    }

    /// Block until the table index advances past `since` or `timeout`
    /// elapses, then return the current value (spec §5 blocking queries).
    pub async fn blocking_get(&self, key: &str, since: Index, timeout: Duration) -> Option<KvValue> {
        self.fsm.read().await.kv.block_until_after(since, timeout).await;
        self.get(key).await
    }

    async fn submit(&self, command: Command) -> Result<()> {
        match self.submitter.submit(command).await? {
            ApplyResult::Ok => Ok(()),
            ApplyResult::NotFound => Err(AgentError::Kv("key not found".to_string())),
            ApplyResult::Duplicate => Ok(()),
            ApplyResult::CasFailed => Err(AgentError::CasMismatch { expected: 0, found: 0 }),
            ApplyResult::InvalidReference => Err(AgentError::Kv("invalid reference".to_string())),
        }
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
        async fn submit(&self, command: Command) -> Result<ApplyResult> {
            let index = self
                .next_index
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                + 1;
            Ok(self.fsm.write().await.apply(index, command))
        }
    }

    fn make_service() -> KvService {
        let fsm = Arc::new(RwLock::new(Fsm::new()));
        let submitter = Arc::new(LocalSubmitter {
            fsm: fsm.clone(),
            next_index: std::sync::atomic::AtomicU64::new(0),
        });
        KvService::new(fsm, submitter)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let kv = make_service();
        kv.put("a".into(), b"1".to_vec()).await.unwrap();
        assert_eq!(kv.get("a").await.unwrap().value, b"1".to_vec());
    }

    #[tokio::test]
    async fn cas_with_wrong_index_fails() {
        let kv = make_service();
        kv.put("a".into(), b"1".to_vec()).await.unwrap();
        let ok = kv.cas("a".into(), b"2".to_vec(), 999).await.unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn lock_acquire_and_release() {
        let kv = make_service();
        let session = Uuid::new_v4();
        assert!(kv.acquire_lock("lock/x".into(), session).await.unwrap());
        // Re-acquiring the same session succeeds (idempotent).
        assert!(kv.acquire_lock("lock/x".into(), session).await.unwrap());
        assert!(kv.release_lock("lock/x".into(), session).await.unwrap());
    }

    #[tokio::test]
    async fn lock_delay_blocks_reacquisition_until_it_elapses() {
        let kv = make_service();
        let session = Uuid::new_v4();
        assert!(kv.acquire_lock("lock/x".into(), session).await.unwrap());
        assert!(kv.release_lock("lock/x".into(), session).await.unwrap());
        kv.note_lock_delay("lock/x".into(), Duration::from_millis(50)).await;

        let other = Uuid::new_v4();
        assert!(!kv.acquire_lock("lock/x".into(), other).await.unwrap());

        tokio::time::sleep(Duration::from_millis(75)).await;
        assert!(kv.acquire_lock("lock/x".into(), other).await.unwrap());
    }
}
