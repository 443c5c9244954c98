//! In-memory remote store for tests, simulation and local-only hosts.

use crate::error::{Result, StoreError};
use crate::gateway::{Query, RemoteStore, StoredDocument};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use ulid::Ulid;

/// Operation counters, used to observe the read budget.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub queries: u64,
    pub writes: u64,
    pub appends: u64,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    queries: AtomicU64,
    writes: AtomicU64,
    appends: AtomicU64,
}

type Collections = HashMap<String, BTreeMap<String, Value>>;
type Watchers = Vec<(Query, mpsc::UnboundedSender<Vec<StoredDocument>>)>;

/// Thread-safe in-memory document store.
///
/// Cloning is cheap; clones share the same underlying data, which is how
/// several simulated clients end up talking to "the same" remote store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
    watchers: Arc<RwLock<Watchers>>,
    counters: Arc<Counters>,
    fail_next: Arc<AtomicU32>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current operation counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.counters.reads.load(Ordering::SeqCst),
            queries: self.counters.queries.load(Ordering::SeqCst),
            writes: self.counters.writes.load(Ordering::SeqCst),
            appends: self.counters.appends.load(Ordering::SeqCst),
        }
    }

    /// Make the next `count` operations fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Toggle a persistent outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    /// Check whether a collection is empty or missing.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn collection_documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.collections
            .read()
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| StoredDocument {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn notify(&self, collection: &str) {
        let mut watchers = self.watchers.write();
        if watchers.iter().all(|(q, _)| q.collection != collection) {
            return;
        }
        let documents = self.collection_documents(collection);
        watchers.retain(|(query, tx)| {
            if query.collection != collection {
                return !tx.is_closed();
            }
            tx.send(query.apply(documents.clone())).is_ok()
        });
    }
}

/// Merge `patch` into `target`; `null` fields delete.
fn merge_into(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (field, value) in patch {
        if value.is_null() {
            target.remove(&field);
        } else {
            target.insert(field, value);
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        self.check_available()?;
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn write(
        &self,
        collection: &str,
        id: &str,
        document: Value,
        merge: bool,
    ) -> Result<()> {
        self.check_available()?;

        {
            let mut collections = self.collections.write();
            let docs = collections.entry(collection.to_string()).or_default();

            if merge {
                let Value::Object(patch) = document else {
                    return Err(StoreError::InvalidDocument {
                        collection: collection.to_string(),
                        id: id.to_string(),
                        reason: "merge writes require an object".to_string(),
                    });
                };
                match docs.get_mut(id) {
                    Some(Value::Object(existing)) => merge_into(existing, patch),
                    _ => {
                        let mut fresh = Map::new();
                        merge_into(&mut fresh, patch);
                        docs.insert(id.to_string(), Value::Object(fresh));
                    }
                }
            } else {
                docs.insert(id.to_string(), document);
            }
        }

        self.counters.writes.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(collection, id, merge, "memory store write");
        self.notify(collection);
        Ok(())
    }

    async fn append(&self, collection: &str, document: Value) -> Result<String> {
        self.check_available()?;
        let id = Ulid::new().to_string();
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), document);
        self.counters.appends.fetch_add(1, Ordering::SeqCst);
        self.notify(collection);
        Ok(id)
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>> {
        self.check_available()?;
        self.counters.queries.fetch_add(1, Ordering::SeqCst);
        Ok(query.apply(self.collection_documents(&query.collection)))
    }

    fn watch(&self, query: Query) -> mpsc::UnboundedReceiver<Vec<StoredDocument>> {
        let (tx, rx) = mpsc::unbounded_channel();
        // Deliver the current state immediately, like a fresh subscription.
        let _ = tx.send(query.apply(self.collection_documents(&query.collection)));
        self.watchers.write().push((query, tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SortOrder;
    use serde_json::json;

    #[tokio::test]
    async fn test_read_write_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.read("trees", "t1").await.unwrap(), None);

        store
            .write("trees", "t1", json!({ "domains": [1, 2] }), false)
            .await
            .unwrap();
        let doc = store.read("trees", "t1").await.unwrap().unwrap();
        assert_eq!(doc["domains"], json!([1, 2]));

        let stats = store.stats();
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.writes, 1);
    }

    #[tokio::test]
    async fn test_merge_write_deletes_null_fields() {
        let store = MemoryStore::new();
        store
            .write("locks", "doc", json!({ "LO-1": { "holder": "alice" } }), true)
            .await
            .unwrap();
        store
            .write("locks", "doc", json!({ "LO-2": { "holder": "bob" } }), true)
            .await
            .unwrap();

        let doc = store.read("locks", "doc").await.unwrap().unwrap();
        assert_eq!(doc.as_object().unwrap().len(), 2);

        store
            .write("locks", "doc", json!({ "LO-1": null }), true)
            .await
            .unwrap();
        let doc = store.read("locks", "doc").await.unwrap().unwrap();
        assert!(doc.get("LO-1").is_none());
        assert_eq!(doc["LO-2"]["holder"], "bob");
    }

    #[tokio::test]
    async fn test_merge_requires_object() {
        let store = MemoryStore::new();
        let err = store.write("locks", "doc", json!(42), true).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidDocument { .. }));
    }

    #[tokio::test]
    async fn test_append_and_query() {
        let store = MemoryStore::new();
        for ts in [5, 1, 9] {
            store.append("audit", json!({ "timestamp": ts })).await.unwrap();
        }
        assert_eq!(store.len("audit"), 3);

        let query = Query::collection("audit").order_by("timestamp", SortOrder::Descending);
        let docs = store.query(&query).await.unwrap();
        let stamps: Vec<_> = docs.iter().map(|d| d.data["timestamp"].clone()).collect();
        assert_eq!(stamps, vec![json!(9), json!(5), json!(1)]);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next(2);
        assert!(store.read("a", "b").await.is_err());
        assert!(store.write("a", "b", json!({}), false).await.is_err());
        assert!(store.read("a", "b").await.is_ok());

        store.set_offline(true);
        assert!(matches!(
            store.append("a", json!({})).await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.append("a", json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_receives_updates() {
        let store = MemoryStore::new();
        let mut rx = store.watch(Query::collection("snapshots"));

        let initial = rx.recv().await.unwrap();
        assert!(initial.is_empty());

        store.append("snapshots", json!({ "name": "s1" })).await.unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.len(), 1);
        assert_eq!(update[0].data["name"], "s1");
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = MemoryStore::new();
        let b = a.clone();
        a.write("trees", "t", json!({ "v": 1 }), false).await.unwrap();
        assert_eq!(b.read("trees", "t").await.unwrap(), Some(json!({ "v": 1 })));
    }
}
