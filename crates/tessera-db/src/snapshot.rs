//! Full-tree snapshots for point-in-time restore.
//!
//! A snapshot is a deep copy of the entire shared tree, not a diff. Taking
//! one is O(tree size) and only happens on an explicit user action.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tessera_store::{Query, RemoteStore, SortOrder, StoreError, StoredDocument};

/// Default collection for snapshots.
pub const SNAPSHOTS_COLLECTION: &str = "snapshots";

/// A stored copy of the shared tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Store id, assigned on append. Not part of the stored document.
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub actor: String,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub data: Value,
}

impl Snapshot {
    fn decode(collection: &str, document: StoredDocument) -> Result<Self, StoreError> {
        let mut snapshot: Snapshot = serde_json::from_value(document.data).map_err(|err| {
            StoreError::InvalidDocument {
                collection: collection.to_string(),
                id: document.id.clone(),
                reason: err.to_string(),
            }
        })?;
        snapshot.id = document.id;
        Ok(snapshot)
    }
}

/// Handle to the snapshot collection.
pub struct SnapshotStore<S: RemoteStore> {
    store: Arc<S>,
    collection: String,
}

impl<S: RemoteStore> Clone for SnapshotStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection.clone(),
        }
    }
}

impl<S: RemoteStore> SnapshotStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_collection(store, SNAPSHOTS_COLLECTION)
    }

    pub fn with_collection(store: Arc<S>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Store a deep copy of `data` under `name`.
    pub async fn create(
        &self,
        name: impl Into<String>,
        actor: impl Into<String>,
        created_at: u64,
        data: &Value,
    ) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot {
            id: String::new(),
            name: name.into(),
            actor: actor.into(),
            created_at,
            data: data.clone(),
        };
        snapshot.id = self
            .store
            .append(&self.collection, serde_json::to_value(&snapshot)?)
            .await?;

        tracing::info!(id = %snapshot.id, name = %snapshot.name, "snapshot created");
        Ok(snapshot)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Snapshot>, StoreError> {
        match self.store.read(&self.collection, id).await? {
            Some(data) => Snapshot::decode(&self.collection, StoredDocument {
                id: id.to_string(),
                data,
            })
            .map(Some),
            None => Ok(None),
        }
    }

    /// All snapshots, newest first.
    pub async fn list(&self) -> Result<Vec<Snapshot>, StoreError> {
        let query = Query::collection(&self.collection).order_by("createdAt", SortOrder::Descending);
        let documents = self.store.query(&query).await?;

        let mut snapshots = Vec::with_capacity(documents.len());
        for document in documents {
            match Snapshot::decode(&self.collection, document) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(err) => tracing::warn!(error = %err, "skipping malformed snapshot"),
            }
        }
        Ok(snapshots)
    }
}
