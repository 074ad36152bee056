//! MVCC-ish state store (component D): tables of versioned rows keyed by
//! `(create_index, modify_index)`, with per-table watch-sets so blocking
//! queries can wait for a table's index to advance past a given value.
//!
//! The concurrent map itself follows the teacher's DashMap migration
//! pattern (`common::concurrent_map`); the watch mechanism generalizes the
//! listener-channel idiom in `networking::membership::view` into a simple
//! `Notify`-per-table scheme, since blocking queries need "wake on any
//! change above index N" rather than a fan-out event stream.

use crate::common::Index;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// A single versioned row. `create_index` is fixed at insert; `modify_index`
/// is bumped on every write, including tombstone writes (spec §3.2: "deletes
/// are recorded as tombstones with a modify_index, reaped after the
/// retention window").
#[derive(Debug, Clone)]
pub struct Versioned<V> {
    pub value: V,
    pub create_index: Index,
    pub modify_index: Index,
    pub deleted: bool,
}

/// One logical table (catalog nodes, catalog services, kv entries, sessions,
/// acl tokens, ...). Each table tracks its own high-water index so blocking
/// queries can be scoped per-table rather than globally.
pub struct Table<K, V> {
    rows: DashMap<K, Versioned<V>>,
    last_index: AtomicU64,
    notify: Notify,
}

impl<K, V> Table<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
            last_index: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn last_index(&self) -> Index {
        self.last_index.load(Ordering::Acquire)
    }

    fn bump_index(&self, index: Index) {
        // The FSM hands out indices in strictly increasing order (spec §3.2),
        // so a plain store suffices; fetch_max guards against any
        // out-of-order apply during a replay.
        self.last_index.fetch_max(index, Ordering::AcqRel);
        self.notify.notify_waiters();
    }

    pub fn put(&self, key: K, value: V, index: Index) {
        let create_index = self
            .rows
            .get(&key)
            .map(|v| v.create_index)
            .unwrap_or(index);
        self.rows.insert(
            key,
            Versioned {
                value,
                create_index,
                modify_index: index,
                deleted: false,
            },
        );
        self.bump_index(index);
    }

    /// Compare-and-swap on `modify_index`: succeeds only if the existing
    /// row's modify_index equals `expected` (spec §5: KV CAS semantics;
    /// `expected == 0` means "only if absent").
    pub fn cas(&self, key: K, value: V, expected: Index, index: Index) -> bool {
        match self.rows.get(&key).map(|v| v.modify_index) {
            Some(actual) if actual == expected => {}
            None if expected == 0 => {}
            _ => return false,
        }
        self.put(key, value, index);
        true
    }

    pub fn delete(&self, key: &K, index: Index) -> bool {
        if let Some(mut row) = self.rows.get_mut(key) {
            row.deleted = true;
            row.modify_index = index;
            self.bump_index(index);
            true
        } else {
            false
        }
    }

    /// Permanently remove tombstones with `modify_index` at or below
    /// `below_index` (spec §3.2 tombstone reaping).
    pub fn reap_tombstones(&self, below_index: Index) -> usize {
        let mut reaped = 0;
        self.rows.retain(|_, row| {
            let keep = !(row.deleted && row.modify_index <= below_index);
            if !keep {
                reaped += 1;
            }
            keep
        });
        reaped
    }

    pub fn get(&self, key: &K) -> Option<Versioned<V>> {
        self.rows
            .get(key)
            .filter(|row| !row.deleted)
            .map(|row| row.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.rows.get(key).map(|r| !r.deleted).unwrap_or(false)
    }

    pub fn iter_values(&self) -> Vec<(K, Versioned<V>)> {
        self.rows
            .iter()
            .filter(|e| !e.deleted)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until `last_index()` exceeds `since`, or `timeout` elapses.
    /// Mirrors spec §5's blocking-query semantics: "a request carrying
    /// `index=N` blocks until the table's index exceeds N or wait_time
    /// elapses, then returns the current value regardless".
    pub async fn block_until_after(&self, since: Index, timeout: Duration) {
        if self.last_index() > since {
            return;
        }
        let notified = self.notify.notified();
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
    }
}

impl<K, V> Default for Table<K, V>
where
    K: std::hash::Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Handle shared across services (component F) for a single table, cheaply
/// cloneable since the table itself is internally synchronized.
pub type SharedTable<K, V> = Arc<Table<K, V>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_rejects_stale_expected_index() {
        let table: Table<String, i32> = Table::new();
        table.put("k".to_string(), 1, 1);
        assert!(!table.cas("k".to_string(), 2, 0, 2));
        assert!(table.cas("k".to_string(), 2, 1, 2));
        assert_eq!(table.get(&"k".to_string()).unwrap().value, 2);
    }

    #[test]
    fn delete_marks_tombstone_until_reaped() {
        let table: Table<String, i32> = Table::new();
        table.put("k".to_string(), 1, 1);
        table.delete(&"k".to_string(), 2);
        assert!(table.get(&"k".to_string()).is_none());
        assert_eq!(table.reap_tombstones(1), 0);
        assert_eq!(table.reap_tombstones(2), 1);
    }

    #[tokio::test]
    async fn block_until_after_returns_once_index_advances() {
        let table: Arc<Table<String, i32>> = Arc::new(Table::new());
        table.put("k".to_string(), 1, 5);

        let waiter_table = table.clone();
        let waiter = tokio::spawn(async move {
            waiter_table
                .block_until_after(5, Duration::from_secs(5))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        table.put("k".to_string(), 2, 6);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn block_until_after_times_out_without_a_write() {
        let table: Table<String, i32> = Table::new();
        let start = std::time::Instant::now();
        table.block_until_after(0, Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
