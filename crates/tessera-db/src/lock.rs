//! Soft Locks - advisory, time-bounded per-resource locks.
//!
//! A soft lock only signals "someone else is probably editing this". It
//! never blocks a write:
//! - `acquire` unconditionally overwrites the lock record (last writer wins)
//! - expiry is computed at read time from `acquired_at`; nothing sweeps
//! - a lock never blocks its own holder
//!
//! Two clients acquiring inside the same poll window will both believe they
//! hold the lock until the next lock poll shows the later write. That race
//! is inherent to the store (no compare-and-swap) and is left as is.

use crate::clock::SharedClock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tessera_store::{DocumentKey, RemoteStore, StoreError};

/// Locks older than this are ignored (5 minutes).
pub const LOCK_TTL_MS: u64 = 5 * 60 * 1000;

/// Collection holding one lock document per shared tree.
pub const LOCKS_COLLECTION: &str = "locks";

/// A lock record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub resource_id: String,
    pub holder: String,
    /// Milliseconds since the Unix epoch.
    pub acquired_at: u64,
}

impl Lock {
    pub fn new(resource_id: impl Into<String>, holder: impl Into<String>, acquired_at: u64) -> Self {
        Self {
            resource_id: resource_id.into(),
            holder: holder.into(),
            acquired_at,
        }
    }

    /// A lock is expired once strictly more than `ttl_ms` has elapsed.
    pub fn is_expired_at(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.acquired_at) > ttl_ms
    }

    /// Check whether this lock should warn `actor` away at `now`.
    pub fn blocks(&self, actor: &str, now: u64, ttl_ms: u64) -> bool {
        self.holder != actor && !self.is_expired_at(now, ttl_ms)
    }
}

/// The decoded lock document: resource id to lock.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LockTable {
    locks: HashMap<String, Lock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a lock document. Malformed entries are skipped.
    pub fn from_document(document: &Value) -> Self {
        let mut table = Self::new();
        let Some(fields) = document.as_object() else {
            return table;
        };
        for (resource_id, raw) in fields {
            match serde_json::from_value::<Lock>(raw.clone()) {
                Ok(lock) => {
                    table.locks.insert(resource_id.clone(), lock);
                }
                Err(err) => {
                    tracing::warn!(resource_id, error = %err, "skipping malformed lock record");
                }
            }
        }
        table
    }

    /// Encode the whole table as a lock document.
    pub fn to_document(&self) -> Result<Value, StoreError> {
        let mut fields = Map::new();
        for (resource_id, lock) in &self.locks {
            fields.insert(resource_id.clone(), serde_json::to_value(lock)?);
        }
        Ok(Value::Object(fields))
    }

    pub fn insert(&mut self, lock: Lock) {
        self.locks.insert(lock.resource_id.clone(), lock);
    }

    pub fn remove(&mut self, resource_id: &str) -> Option<Lock> {
        self.locks.remove(resource_id)
    }

    pub fn get(&self, resource_id: &str) -> Option<&Lock> {
        self.locks.get(resource_id)
    }

    /// True iff a non-expired lock exists whose holder differs from `me`.
    pub fn is_locked(&self, resource_id: &str, me: &str, now: u64, ttl_ms: u64) -> bool {
        self.locks
            .get(resource_id)
            .map(|lock| lock.blocks(me, now, ttl_ms))
            .unwrap_or(false)
    }

    /// Holder of a non-expired lock, whoever it is.
    pub fn locked_by(&self, resource_id: &str, now: u64, ttl_ms: u64) -> Option<&str> {
        self.locks
            .get(resource_id)
            .filter(|lock| !lock.is_expired_at(now, ttl_ms))
            .map(|lock| lock.holder.as_str())
    }

    /// All non-expired locks, sorted by resource id.
    pub fn active(&self, now: u64, ttl_ms: u64) -> Vec<&Lock> {
        let mut active: Vec<_> = self
            .locks
            .values()
            .filter(|lock| !lock.is_expired_at(now, ttl_ms))
            .collect();
        active.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        active
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Advisory lock manager for one shared tree.
///
/// Writes go straight to the lock document; reads are answered from the
/// client's lock view, which is refreshed by polling (`apply_remote`) and
/// updated optimistically after each successful local acquire/release.
pub struct SoftLockManager<S: RemoteStore> {
    store: Arc<S>,
    document: DocumentKey,
    clock: SharedClock,
    ttl_ms: u64,
    view: RwLock<LockTable>,
}

impl<S: RemoteStore> SoftLockManager<S> {
    /// Create a lock manager for the lock document `locks/<document_id>`.
    pub fn new(store: Arc<S>, document_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            store,
            document: DocumentKey::new(LOCKS_COLLECTION, document_id),
            clock,
            ttl_ms: LOCK_TTL_MS,
            view: RwLock::new(LockTable::new()),
        }
    }

    /// Override the expiry window.
    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn document_key(&self) -> &DocumentKey {
        &self.document
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Write (or overwrite) the lock record for `resource_id`.
    pub async fn acquire(
        &self,
        resource_id: &str,
        holder: &str,
    ) -> Result<Lock, StoreError> {
        let lock = Lock::new(resource_id, holder, self.clock.now_millis());
        let mut patch = Map::new();
        patch.insert(resource_id.to_string(), serde_json::to_value(&lock)?);

        self.store
            .write(
                &self.document.collection,
                &self.document.id,
                Value::Object(patch),
                true,
            )
            .await?;

        tracing::debug!(resource_id, holder, "soft lock acquired");
        self.view.write().insert(lock.clone());
        Ok(lock)
    }

    /// Delete the lock record for `resource_id`, whoever holds it.
    pub async fn release(&self, resource_id: &str) -> Result<(), StoreError> {
        let mut patch = Map::new();
        patch.insert(resource_id.to_string(), Value::Null);

        self.store
            .write(
                &self.document.collection,
                &self.document.id,
                Value::Object(patch),
                true,
            )
            .await?;

        tracing::debug!(resource_id, "soft lock released");
        self.view.write().remove(resource_id);
        Ok(())
    }

    /// Release every lock in the view held by `holder`, in one merge write.
    pub async fn release_all(&self, holder: &str) -> Result<usize, StoreError> {
        let held: Vec<String> = self
            .view
            .read()
            .locks
            .values()
            .filter(|lock| lock.holder == holder)
            .map(|lock| lock.resource_id.clone())
            .collect();
        if held.is_empty() {
            return Ok(0);
        }

        let patch: Map<String, Value> = held.iter().map(|id| (id.clone(), Value::Null)).collect();
        self.store
            .write(
                &self.document.collection,
                &self.document.id,
                Value::Object(patch),
                true,
            )
            .await?;

        let mut view = self.view.write();
        for id in &held {
            view.remove(id);
        }
        Ok(held.len())
    }

    /// True iff a non-expired lock on `resource_id` is held by someone other than `me`.
    pub fn is_locked(&self, resource_id: &str, me: &str) -> bool {
        self.view
            .read()
            .is_locked(resource_id, me, self.clock.now_millis(), self.ttl_ms)
    }

    /// Holder of a non-expired lock on `resource_id`.
    pub fn locked_by(&self, resource_id: &str) -> Option<String> {
        self.view
            .read()
            .locked_by(resource_id, self.clock.now_millis(), self.ttl_ms)
            .map(str::to_string)
    }

    /// All non-expired locks in the view.
    pub fn active_locks(&self) -> Vec<Lock> {
        self.view
            .read()
            .active(self.clock.now_millis(), self.ttl_ms)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Non-expired locks held by `holder`.
    pub fn held_by(&self, holder: &str) -> Vec<Lock> {
        self.active_locks()
            .into_iter()
            .filter(|lock| lock.holder == holder)
            .collect()
    }

    /// Replace the view with a polled lock document.
    pub fn apply_remote(&self, document: &Value) {
        *self.view.write() = LockTable::from_document(document);
    }

    /// Read the lock document and replace the view.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let document = self
            .store
            .read(&self.document.collection, &self.document.id)
            .await?
            .unwrap_or(Value::Object(Map::new()));
        self.apply_remote(&document);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;
    use tessera_store::MemoryStore;

    fn manager(clock: &ManualClock) -> (Arc<MemoryStore>, SoftLockManager<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let locks = SoftLockManager::new(store.clone(), "tree-2024", Arc::new(clock.clone()));
        (store, locks)
    }

    #[test]
    fn test_expiry_boundary() {
        let lock = Lock::new("LO-1", "alice", 1_000);
        assert!(!lock.is_expired_at(1_000 + LOCK_TTL_MS, LOCK_TTL_MS));
        assert!(lock.is_expired_at(1_001 + LOCK_TTL_MS, LOCK_TTL_MS));
    }

    #[test]
    fn test_self_lock_never_blocks() {
        let lock = Lock::new("LO-1", "alice", 0);
        assert!(!lock.blocks("alice", 10, LOCK_TTL_MS));
        assert!(lock.blocks("bob", 10, LOCK_TTL_MS));
    }

    #[test]
    fn test_lock_table_skips_malformed() {
        let doc = json!({
            "LO-1": { "resourceId": "LO-1", "holder": "alice", "acquiredAt": 5 },
            "LO-2": { "holder": 7 },
        });
        let table = LockTable::from_document(&doc);
        assert_eq!(table.len(), 1);
        assert_eq!(table.locked_by("LO-1", 10, LOCK_TTL_MS), Some("alice"));
    }

    #[tokio::test]
    async fn test_acquire_and_query() {
        let clock = ManualClock::new(1_000_000);
        let (store, locks) = manager(&clock);

        locks.acquire("LO-1", "alice").await.unwrap();
        clock.advance(60_000);

        assert!(locks.is_locked("LO-1", "bob"));
        assert!(!locks.is_locked("LO-1", "alice"));
        assert_eq!(locks.locked_by("LO-1").as_deref(), Some("alice"));

        let remote = store.read(LOCKS_COLLECTION, "tree-2024").await.unwrap().unwrap();
        assert_eq!(remote["LO-1"]["holder"], "alice");
        assert_eq!(remote["LO-1"]["acquiredAt"], 1_000_000);
    }

    #[tokio::test]
    async fn test_abandoned_lock_self_heals() {
        let clock = ManualClock::new(0);
        let (_store, locks) = manager(&clock);

        locks.acquire("LO-1", "alice").await.unwrap();
        clock.advance(LOCK_TTL_MS + 1);

        assert!(!locks.is_locked("LO-1", "bob"));
        assert_eq!(locks.locked_by("LO-1"), None);
        assert!(locks.active_locks().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_overwrites_other_holder() {
        let clock = ManualClock::new(0);
        let (_store, locks) = manager(&clock);

        locks.acquire("LO-1", "alice").await.unwrap();
        locks.acquire("LO-1", "bob").await.unwrap();

        assert_eq!(locks.locked_by("LO-1").as_deref(), Some("bob"));
        assert!(locks.is_locked("LO-1", "alice"));
    }

    #[tokio::test]
    async fn test_release_and_release_all() {
        let clock = ManualClock::new(0);
        let (store, locks) = manager(&clock);

        locks.acquire("LO-1", "alice").await.unwrap();
        locks.acquire("LO-2", "alice").await.unwrap();
        locks.acquire("LO-3", "bob").await.unwrap();

        locks.release("LO-3").await.unwrap();
        assert_eq!(locks.locked_by("LO-3"), None);

        assert_eq!(locks.release_all("alice").await.unwrap(), 2);
        assert!(locks.active_locks().is_empty());

        let remote = store.read(LOCKS_COLLECTION, "tree-2024").await.unwrap().unwrap();
        assert!(remote.as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_acquire_leaves_view_untouched() {
        let clock = ManualClock::new(0);
        let (store, locks) = manager(&clock);

        store.fail_next(1);
        assert!(locks.acquire("LO-1", "alice").await.is_err());
        assert_eq!(locks.locked_by("LO-1"), None);
    }

    #[tokio::test]
    async fn test_refresh_sees_other_clients() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryStore::new());
        let alice = SoftLockManager::new(store.clone(), "t", Arc::new(clock.clone()));
        let bob = SoftLockManager::new(store.clone(), "t", Arc::new(clock.clone()));

        alice.acquire("LO-9", "alice").await.unwrap();
        assert!(!bob.is_locked("LO-9", "bob"));

        bob.refresh().await.unwrap();
        assert!(bob.is_locked("LO-9", "bob"));
        assert_eq!(bob.held_by("alice").len(), 1);
    }
}
