//! One shared tree, as seen by one client.
//!
//! Every discrete mutation follows the same path:
//! 1. apply the edit to the local tree
//! 2. save the whole tree (one write) and prime the scheduler cache
//! 3. record the command on the session history (a no-op during undo/redo)
//! 4. append exactly one audit entry
//!
//! Mutations on one workspace are serialized: a second mutation waits
//! until the first has been saved and logged.

use crate::command::{Edit, TreeCommand, TreeTarget};
use crate::error::{Result, SdkError};
use crate::tree::{self, FIELD_ASSIGNED, FIELD_COURSE_LINK, FIELD_STATUS};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tessera_db::{
    AuditAction, AuditLog, AuditLogEntry, HistoryAction, HistoryStack, Lock, SharedClock,
    Snapshot, SnapshotStore, SoftLockManager, StoredEntry,
};
use tessera_store::{DocumentKey, RemoteStore, StoreError};
use tessera_sync::{PollHandle, SyncScheduler, STREAM_LOCKS, STREAM_TREE};
use tokio::sync::broadcast;

/// Collection holding the shared trees.
pub const TREES_COLLECTION: &str = "trees";

/// Events emitted by a workspace.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkspaceEvent {
    /// The local tree changed. `remote` is true when the change came from a poll.
    TreeUpdated { remote: bool },
    /// A polled lock document replaced the lock view.
    LocksUpdated,
    /// A snapshot replaced the whole tree.
    Restored { snapshot_id: String },
}

/// Construction parameters handed down by the client.
pub(crate) struct WorkspaceOptions {
    pub collection: String,
    pub history_capacity: usize,
    pub save_debounce: Duration,
    pub event_capacity: usize,
}

/// A shared tree with its locks, audit trail, snapshots and session history.
pub struct Workspace<S: RemoteStore> {
    key: DocumentKey,
    actor: String,
    store: Arc<S>,
    scheduler: SyncScheduler,
    clock: SharedClock,
    tree: RwLock<Value>,
    locks: SoftLockManager<S>,
    audit: AuditLog<S>,
    snapshots: SnapshotStore<S>,
    history: HistoryStack<TreeCommand>,
    handles: Mutex<Vec<PollHandle>>,
    events: broadcast::Sender<WorkspaceEvent>,
    save_debounce: Duration,
    /// Held across apply, save and log.
    write_lock: tokio::sync::Mutex<()>,
}

impl<S: RemoteStore> Workspace<S> {
    pub(crate) fn new(
        tree_id: &str,
        actor: &str,
        store: Arc<S>,
        scheduler: SyncScheduler,
        clock: SharedClock,
        options: WorkspaceOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Self {
            key: DocumentKey::new(options.collection, tree_id),
            actor: actor.to_string(),
            locks: SoftLockManager::new(store.clone(), tree_id, clock.clone()),
            audit: AuditLog::new(store.clone()),
            snapshots: SnapshotStore::new(store.clone()),
            history: HistoryStack::new(options.history_capacity),
            store,
            scheduler,
            clock,
            tree: RwLock::new(Value::Object(Map::new())),
            handles: Mutex::new(Vec::new()),
            events,
            save_debounce: options.save_debounce,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn document_key(&self) -> &DocumentKey {
        &self.key
    }

    /// A copy of the local tree.
    pub fn tree(&self) -> Value {
        self.tree.read().clone()
    }

    /// A copy of node `id`.
    pub fn node(&self, id: &str) -> Option<Value> {
        tree::find_node(&self.tree.read(), id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkspaceEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &HistoryStack<TreeCommand> {
        &self.history
    }

    pub fn locks(&self) -> &SoftLockManager<S> {
        &self.locks
    }

    /// Scheduler key of the tree channel.
    pub fn tree_stream_key(&self) -> String {
        format!("{STREAM_TREE}:{}", self.key.id)
    }

    /// Scheduler key of the lock channel.
    pub fn locks_stream_key(&self) -> String {
        format!("{STREAM_LOCKS}:{}", self.key.id)
    }

    fn emit(&self, event: WorkspaceEvent) {
        let _ = self.events.send(event);
    }

    // === Loading and saving ===

    /// Read the tree from the store. Returns `false` if it does not exist yet.
    pub async fn load(&self) -> Result<bool> {
        let Some(remote) = self.store.read(&self.key.collection, &self.key.id).await? else {
            tracing::debug!(tree = %self.key, "no remote tree yet");
            return Ok(false);
        };
        if !remote.is_object() {
            return Err(SdkError::InvalidTree(format!("{} is not an object", self.key)));
        }
        *self.tree.write() = remote.clone();
        self.scheduler.prime(&self.tree_stream_key(), remote);
        self.emit(WorkspaceEvent::TreeUpdated { remote: true });
        Ok(true)
    }

    /// Publish `tree` as the initial shared tree. Not audited.
    pub async fn seed(&self, tree: Value) -> Result<()> {
        if !tree.is_object() {
            return Err(SdkError::InvalidTree("tree must be a JSON object".into()));
        }
        let _write = self.write_lock.lock().await;
        self.persist(tree.clone()).await?;
        *self.tree.write() = tree;
        Ok(())
    }

    /// One whole-object write, then write-through into the scheduler cache.
    async fn persist(&self, tree: Value) -> std::result::Result<(), StoreError> {
        self.store
            .write(&self.key.collection, &self.key.id, tree.clone(), false)
            .await?;
        self.scheduler.prime(&self.tree_stream_key(), tree);
        tracing::debug!(tree = %self.key, actor = %self.actor, "tree saved");
        self.emit(WorkspaceEvent::TreeUpdated { remote: false });
        Ok(())
    }

    /// Save the current local tree now.
    pub async fn save(&self) -> Result<()> {
        let _write = self.write_lock.lock().await;
        let tree = self.tree();
        self.persist(tree).await?;
        Ok(())
    }

    /// Save the local tree after the configured quiet period. Repeated calls
    /// inside the window collapse into one write of the latest tree.
    pub fn save_debounced(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.scheduler.debounce_write(
            format!("save:{}", self.key),
            move || async move {
                match weak.upgrade() {
                    Some(workspace) => {
                        let _write = workspace.write_lock.lock().await;
                        let tree = workspace.tree();
                        workspace.persist(tree).await
                    }
                    None => Ok(()),
                }
            },
            self.save_debounce,
        );
    }

    /// Apply an edit to the local tree only: no save, no audit, no history.
    /// Pair with [`save_debounced`](Self::save_debounced) for keystroke-level edits.
    pub fn apply_local(&self, edit: &Edit) -> Result<TreeCommand> {
        let command = edit.apply(&mut self.tree.write())?;
        self.emit(WorkspaceEvent::TreeUpdated { remote: false });
        Ok(command)
    }

    fn apply_remote_tree(&self, remote: Value) {
        if !remote.is_object() {
            return;
        }
        let changed = {
            let mut tree = self.tree.write();
            if *tree == remote {
                false
            } else {
                *tree = remote;
                true
            }
        };
        if changed {
            self.emit(WorkspaceEvent::TreeUpdated { remote: true });
        }
    }

    fn entry(&self, action: AuditAction, target_id: &str, description: String) -> AuditLogEntry {
        AuditLogEntry::new(
            self.clock.now_millis(),
            &self.actor,
            action,
            target_id,
            description,
        )
        .with_year(self.key.id.clone())
    }

    /// Append the entry for a change that is already saved.
    async fn log_saved(&self, entry: &AuditLogEntry) -> Result<()> {
        match self.audit.log_action(entry).await {
            Ok(_) => Ok(()),
            Err(source) => {
                tracing::warn!(
                    tree = %self.key,
                    target = %entry.target_id,
                    action = %entry.action,
                    error = %source,
                    "change saved but not logged"
                );
                Err(SdkError::NotLogged {
                    target_id: entry.target_id.clone(),
                    source,
                })
            }
        }
    }

    /// Apply, save, record, log once. `restored_from` switches the audit
    /// entry to a `restore` record of that source entry.
    async fn commit(
        &self,
        edit: Edit,
        restored_from: Option<&AuditLogEntry>,
    ) -> Result<TreeCommand> {
        let _write = self.write_lock.lock().await;
        let (command, saved) = {
            let mut tree = self.tree.write();
            let command = edit.apply(&mut tree)?;
            (command, tree.clone())
        };

        if let Err(err) = self.persist(saved).await {
            tracing::warn!(tree = %self.key, error = %err, "save failed, reverting local edit");
            if let Err(revert) = command.inverse().apply(&mut self.tree.write()) {
                tracing::warn!(error = %revert, "local revert failed");
            }
            return Err(err.into());
        }

        let target_id = command.target_id();
        let mut entry = match restored_from {
            Some(source) => self.entry(
                AuditAction::Restore,
                target_id,
                format!(
                    "Restored {} of {target_id} to its value before {}'s change",
                    source.action, source.actor
                ),
            ),
            None => self.entry(command.audit_action(), target_id, command.describe()),
        };
        entry.old_value = command.old_value();
        entry.new_value = command.new_value();

        // The change is saved: it goes on the history even if logging fails.
        if command.is_undoable() {
            self.history.push_action(HistoryAction::new(
                command.audit_action().as_str(),
                command.describe(),
                entry.timestamp,
                command.clone(),
            ));
        }
        self.log_saved(&entry).await?;
        Ok(command)
    }

    // === Mutations ===

    pub async fn set_status(&self, target_id: &str, status: impl Into<String>) -> Result<TreeCommand> {
        self.commit(
            Edit::SetStatus {
                target_id: target_id.to_string(),
                status: Value::String(status.into()),
                developed: None,
            },
            None,
        )
        .await
    }

    /// Append a resource to the node's resource list.
    pub async fn add_resource(&self, target_id: &str, resource: Value) -> Result<TreeCommand> {
        self.commit(
            Edit::InsertResource {
                target_id: target_id.to_string(),
                index: None,
                resource,
            },
            None,
        )
        .await
    }

    pub async fn remove_resource(&self, target_id: &str, index: usize) -> Result<TreeCommand> {
        self.commit(
            Edit::RemoveResource {
                target_id: target_id.to_string(),
                index,
            },
            None,
        )
        .await
    }

    pub async fn set_description(&self, target_id: &str, text: impl Into<String>) -> Result<TreeCommand> {
        self.commit(
            Edit::SetDescription {
                target_id: target_id.to_string(),
                text: Value::String(text.into()),
            },
            None,
        )
        .await
    }

    /// Set the course link; `None` clears it.
    pub async fn set_course_link(&self, target_id: &str, link: Option<&str>) -> Result<TreeCommand> {
        self.commit(
            Edit::SetCourseLink {
                target_id: target_id.to_string(),
                link: link.map(Value::from).unwrap_or(Value::Null),
            },
            None,
        )
        .await
    }

    pub async fn toggle_assignment(&self, target_id: &str) -> Result<TreeCommand> {
        let assigned = tree::field(&self.tree.read(), target_id, FIELD_ASSIGNED)?
            .as_bool()
            .unwrap_or(false);
        self.commit(
            Edit::SetAssigned {
                target_id: target_id.to_string(),
                assigned: !assigned,
            },
            None,
        )
        .await
    }

    pub async fn set_deadline(&self, target_id: &str, deadline: impl Into<String>) -> Result<TreeCommand> {
        self.commit(
            Edit::SetDeadline {
                target_id: target_id.to_string(),
                deadline: Value::String(deadline.into()),
            },
            None,
        )
        .await
    }

    pub async fn remove_deadline(&self, target_id: &str) -> Result<TreeCommand> {
        self.commit(
            Edit::SetDeadline {
                target_id: target_id.to_string(),
                deadline: Value::Null,
            },
            None,
        )
        .await
    }

    // === Session undo/redo ===

    /// Revert this session's most recent undoable change.
    pub async fn undo(&self) -> Result<Option<Arc<HistoryAction<TreeCommand>>>> {
        self.history.undo(self).await
    }

    /// Reapply the most recently undone change.
    pub async fn redo(&self) -> Result<Option<Arc<HistoryAction<TreeCommand>>>> {
        self.history.redo(self).await
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn clear_history(&self) {
        self.history.clear_history();
    }

    // === Soft locks ===

    pub async fn acquire_lock(&self, resource_id: &str) -> Result<Lock> {
        Ok(self.locks.acquire(resource_id, &self.actor).await?)
    }

    pub async fn release_lock(&self, resource_id: &str) -> Result<()> {
        Ok(self.locks.release(resource_id).await?)
    }

    /// True when someone other than this client holds a live lock.
    pub fn is_locked(&self, resource_id: &str) -> bool {
        self.locks.is_locked(resource_id, &self.actor)
    }

    pub fn locked_by(&self, resource_id: &str) -> Option<String> {
        self.locks.locked_by(resource_id)
    }

    pub fn active_locks(&self) -> Vec<Lock> {
        self.locks.active_locks()
    }

    // === Audit and snapshots ===

    /// Most recent audit entries for this tree.
    pub async fn audit_trail(&self, limit: usize) -> Result<Vec<StoredEntry>> {
        let mut entries = self.audit.for_year(&self.key.id).await?;
        entries.truncate(limit);
        Ok(entries)
    }

    /// Audit entries for one node of this tree.
    pub async fn node_history(&self, target_id: &str) -> Result<Vec<StoredEntry>> {
        let entries = self.audit.for_target(target_id).await?;
        Ok(entries
            .into_iter()
            .filter(|stored| stored.entry.year.as_deref() == Some(self.key.id.as_str()))
            .collect())
    }

    /// Store a full copy of the current tree.
    pub async fn create_snapshot(&self, name: &str) -> Result<Snapshot> {
        let data = self.tree();
        let snapshot = self
            .snapshots
            .create(name, &self.actor, self.clock.now_millis(), &data)
            .await?;

        let entry = self.entry(
            AuditAction::SnapshotCreated,
            &snapshot.id,
            format!("Created snapshot \"{name}\""),
        );
        self.audit.log_action(&entry).await?;
        Ok(snapshot)
    }

    pub async fn snapshots(&self) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots.list().await?)
    }

    /// Replace the whole tree with a snapshot: one save, one audit entry.
    ///
    /// The session history is cleared, since its commands were recorded
    /// against the tree being replaced.
    pub async fn restore_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let snapshot = self
            .snapshots
            .get(snapshot_id)
            .await?
            .ok_or_else(|| SdkError::SnapshotNotFound(snapshot_id.to_string()))?;
        if !snapshot.data.is_object() {
            return Err(SdkError::InvalidTree(format!(
                "snapshot {snapshot_id} does not hold a tree"
            )));
        }

        let _write = self.write_lock.lock().await;
        let previous = std::mem::replace(&mut *self.tree.write(), snapshot.data.clone());
        if let Err(err) = self.persist(snapshot.data.clone()).await {
            *self.tree.write() = previous;
            return Err(err.into());
        }
        self.history.clear_history();

        tracing::info!(tree = %self.key, snapshot = %snapshot.id, "snapshot restored");
        self.emit(WorkspaceEvent::Restored {
            snapshot_id: snapshot.id.clone(),
        });

        let entry = self.entry(
            AuditAction::SnapshotRestored,
            &snapshot.id,
            format!("Restored snapshot \"{}\"", snapshot.name),
        );
        self.log_saved(&entry).await?;
        Ok(snapshot)
    }

    /// Write back the old value recorded by one audit entry.
    ///
    /// Only `status_change` and `link` entries carry a reversible value;
    /// any other kind is skipped and `Ok(false)` is returned. A missing old
    /// value means the field was absent and is removed again.
    pub async fn restore_state(&self, entry: &AuditLogEntry) -> Result<bool> {
        if !entry.action.is_reversible() {
            tracing::debug!(action = %entry.action, target = %entry.target_id, "restore skipped");
            return Ok(false);
        }
        let old_value = entry.old_value.clone().unwrap_or(Value::Null);

        let edit = match entry.action {
            AuditAction::StatusChange => Edit::SetStatus {
                target_id: entry.target_id.clone(),
                status: old_value,
                developed: None,
            },
            AuditAction::Link => Edit::SetCourseLink {
                target_id: entry.target_id.clone(),
                link: old_value,
            },
            _ => return Ok(false),
        };
        self.commit(edit, Some(entry)).await?;
        Ok(true)
    }

    /// Current value of a node's status, if any.
    pub fn status_of(&self, target_id: &str) -> Result<Value> {
        tree::field(&self.tree.read(), target_id, FIELD_STATUS)
    }

    /// Current value of a node's course link, if any.
    pub fn course_link_of(&self, target_id: &str) -> Result<Value> {
        tree::field(&self.tree.read(), target_id, FIELD_COURSE_LINK)
    }

    // === Polling ===

    /// Start the tree and lock channels on the client's scheduler.
    pub async fn start_sync(self: &Arc<Self>) {
        self.stop_sync();

        let store = self.store.clone();
        let key = self.key.clone();
        let weak = Arc::downgrade(self);
        let tree_handle = self
            .scheduler
            .start_polling(
                self.tree_stream_key(),
                move || {
                    let store = store.clone();
                    let key = key.clone();
                    async move {
                        store
                            .read(&key.collection, &key.id)
                            .await
                            .map(|doc| doc.unwrap_or(Value::Null))
                    }
                },
                move |value| {
                    if let Some(workspace) = weak.upgrade() {
                        workspace.apply_remote_tree(value);
                    }
                },
                None,
            )
            .await;

        let store = self.store.clone();
        let key = self.locks.document_key().clone();
        let weak = Arc::downgrade(self);
        let locks_handle = self
            .scheduler
            .start_polling(
                self.locks_stream_key(),
                move || {
                    let store = store.clone();
                    let key = key.clone();
                    async move {
                        store
                            .read(&key.collection, &key.id)
                            .await
                            .map(|doc| doc.unwrap_or_else(|| Value::Object(Map::new())))
                    }
                },
                move |value| {
                    if let Some(workspace) = weak.upgrade() {
                        workspace.locks.apply_remote(&value);
                        workspace.emit(WorkspaceEvent::LocksUpdated);
                    }
                },
                None,
            )
            .await;

        tracing::debug!(tree = %self.key, "sync started");
        self.handles.lock().extend([tree_handle, locks_handle]);
    }

    /// Cancel this workspace's channels.
    pub fn stop_sync(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.cancel();
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.handles.lock().iter().any(PollHandle::is_active)
    }
}

#[async_trait]
impl<S: RemoteStore> TreeTarget for Workspace<S> {
    async fn apply_edit(&self, edit: Edit) -> Result<TreeCommand> {
        self.commit(edit, None).await
    }
}
