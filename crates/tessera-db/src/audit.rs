//! Append-only audit log.
//!
//! Every discrete mutation of the shared tree is explained by exactly one
//! [`AuditLogEntry`]. Entries are appended, never updated or deleted.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tessera_store::{Query, RemoteStore, SortOrder, StoreError, StoredDocument};

/// Default collection for audit entries.
pub const AUDIT_COLLECTION: &str = "auditLog";

/// Kind of mutation an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StatusChange,
    ResourceAdd,
    ResourceRemove,
    DescriptionEdit,
    Link,
    AssignmentToggle,
    DeadlineSet,
    DeadlineRemove,
    SnapshotCreated,
    SnapshotRestored,
    Restore,
}

impl AuditAction {
    /// Only these kinds carry an old/new value pair that can be written back.
    pub fn is_reversible(self) -> bool {
        matches!(self, AuditAction::StatusChange | AuditAction::Link)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::StatusChange => "status_change",
            AuditAction::ResourceAdd => "resource_add",
            AuditAction::ResourceRemove => "resource_remove",
            AuditAction::DescriptionEdit => "description_edit",
            AuditAction::Link => "link",
            AuditAction::AssignmentToggle => "assignment_toggle",
            AuditAction::DeadlineSet => "deadline_set",
            AuditAction::DeadlineRemove => "deadline_remove",
            AuditAction::SnapshotCreated => "snapshot_created",
            AuditAction::SnapshotRestored => "snapshot_restored",
            AuditAction::Restore => "restore",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    /// Milliseconds since the Unix epoch. Advisory only.
    pub timestamp: u64,
    pub actor: String,
    pub action: AuditAction,
    pub target_id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
}

impl AuditLogEntry {
    pub fn new(
        timestamp: u64,
        actor: impl Into<String>,
        action: AuditAction,
        target_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            actor: actor.into(),
            action,
            target_id: target_id.into(),
            description: description.into(),
            year: None,
            old_value: None,
            new_value: None,
        }
    }

    pub fn with_year(mut self, year: impl Into<String>) -> Self {
        self.year = Some(year.into());
        self
    }

    pub fn with_old_value(mut self, value: impl Into<Value>) -> Self {
        self.old_value = Some(value.into());
        self
    }

    pub fn with_new_value(mut self, value: impl Into<Value>) -> Self {
        self.new_value = Some(value.into());
        self
    }

    /// True when this entry can be written back by a field-level restore.
    pub fn is_reversible(&self) -> bool {
        self.action.is_reversible()
    }
}

/// An audit entry together with its store id.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEntry {
    pub id: String,
    pub entry: AuditLogEntry,
}

impl StoredEntry {
    fn decode(document: StoredDocument) -> Option<Self> {
        match serde_json::from_value::<AuditLogEntry>(document.data) {
            Ok(entry) => Some(Self {
                id: document.id,
                entry,
            }),
            Err(err) => {
                tracing::warn!(id = %document.id, error = %err, "skipping malformed audit entry");
                None
            }
        }
    }
}

/// Handle to the audit collection.
pub struct AuditLog<S: RemoteStore> {
    store: Arc<S>,
    collection: String,
}

impl<S: RemoteStore> Clone for AuditLog<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            collection: self.collection.clone(),
        }
    }
}

impl<S: RemoteStore> AuditLog<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_collection(store, AUDIT_COLLECTION)
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

    /// Append one entry and return its id.
    pub async fn log_action(&self, entry: &AuditLogEntry) -> Result<String, StoreError> {
        let document = serde_json::to_value(entry)?;
        let id = self.store.append(&self.collection, document).await?;
        tracing::debug!(
            id = %id,
            action = %entry.action,
            target = %entry.target_id,
            actor = %entry.actor,
            "audit entry appended"
        );
        Ok(id)
    }

    /// Most recent entries first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<StoredEntry>, StoreError> {
        let query = Query::collection(&self.collection)
            .order_by("timestamp", SortOrder::Descending)
            .limit(limit);
        self.run(&query).await
    }

    /// Entries for one tree node, most recent first.
    pub async fn for_target(&self, target_id: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let query = Query::collection(&self.collection)
            .where_eq("targetId", target_id)
            .order_by("timestamp", SortOrder::Descending);
        self.run(&query).await
    }

    /// Entries tagged with `year`, most recent first.
    pub async fn for_year(&self, year: &str) -> Result<Vec<StoredEntry>, StoreError> {
        let query = Query::collection(&self.collection)
            .where_eq("year", year)
            .order_by("timestamp", SortOrder::Descending);
        self.run(&query).await
    }

    async fn run(&self, query: &Query) -> Result<Vec<StoredEntry>, StoreError> {
        let documents = self.store.query(query).await?;
        Ok(documents.into_iter().filter_map(StoredEntry::decode).collect())
    }
}
