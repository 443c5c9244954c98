//! Application-root context for the Tessera SDK.

use crate::error::Result;
use crate::workspace::{Workspace, WorkspaceOptions, TREES_COLLECTION};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_db::{SharedClock, SystemClock, DEFAULT_HISTORY_CAPACITY};
use tessera_store::{MemoryStore, RemoteStore};
use tessera_sync::{SyncConfig, SyncScheduler, Visibility};

/// Configuration for a Tessera client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name recorded as lock holder and audit actor.
    pub actor: String,
    /// Collection holding the shared trees.
    pub tree_collection: String,
    /// Session undo depth per workspace.
    pub history_capacity: usize,
    /// Quiet period for debounced saves.
    pub save_debounce_ms: u64,
    /// Capacity of each workspace's event channel.
    pub event_capacity: usize,
    /// Polling and cache settings.
    pub sync: SyncConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            actor: "anonymous".to_string(),
            tree_collection: TREES_COLLECTION.to_string(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            save_debounce_ms: 800,
            event_capacity: 64,
            sync: SyncConfig::default(),
        }
    }
}

/// Builder for client configuration.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.config.actor = actor.into();
        self
    }

    pub fn tree_collection(mut self, collection: impl Into<String>) -> Self {
        self.config.tree_collection = collection.into();
        self
    }

    pub fn history_capacity(mut self, capacity: usize) -> Self {
        self.config.history_capacity = capacity;
        self
    }

    pub fn save_debounce_ms(mut self, ms: u64) -> Self {
        self.config.save_debounce_ms = ms;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.config.sync = sync;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The application-root context.
///
/// A client owns one [`SyncScheduler`] and opens [`Workspace`]s on top of
/// it. Nothing is global: two clients in one process behave like two
/// browser tabs.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use tessera_sdk::{Client, ClientConfigBuilder};
/// use tessera_store::MemoryStore;
///
/// let store = Arc::new(MemoryStore::new());
/// let client = Client::new(store, ClientConfigBuilder::new().actor("alice").build());
///
/// let workspace = client.open_workspace("tree-2024").await?;
/// workspace.start_sync().await;
/// workspace.set_status("LO-17", "developed").await?;
/// ```
pub struct Client<S: RemoteStore> {
    config: ClientConfig,
    store: Arc<S>,
    scheduler: SyncScheduler,
    clock: SharedClock,
    workspaces: RwLock<HashMap<String, Arc<Workspace<S>>>>,
}

impl<S: RemoteStore> Client<S> {
    pub fn new(store: Arc<S>, config: ClientConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a client whose locks and audit timestamps use `clock`.
    pub fn with_clock(store: Arc<S>, config: ClientConfig, clock: SharedClock) -> Self {
        let scheduler = SyncScheduler::new(config.sync.clone());
        Self {
            config,
            store,
            scheduler,
            clock,
            workspaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn actor(&self) -> &str {
        &self.config.actor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Open (or reuse) the workspace for `tree_id` and load its tree.
    pub async fn open_workspace(&self, tree_id: &str) -> Result<Arc<Workspace<S>>> {
        if let Some(existing) = self.workspace(tree_id) {
            return Ok(existing);
        }

        let workspace = Arc::new(Workspace::new(
            tree_id,
            &self.config.actor,
            self.store.clone(),
            self.scheduler.clone(),
            self.clock.clone(),
            WorkspaceOptions {
                collection: self.config.tree_collection.clone(),
                history_capacity: self.config.history_capacity,
                save_debounce: Duration::from_millis(self.config.save_debounce_ms),
                event_capacity: self.config.event_capacity,
            },
        ));
        workspace.load().await?;

        // Another task may have opened the same tree while we were loading.
        let mut workspaces = self.workspaces.write();
        let workspace = workspaces
            .entry(tree_id.to_string())
            .or_insert(workspace)
            .clone();
        tracing::debug!(tree = tree_id, actor = %self.config.actor, "workspace opened");
        Ok(workspace)
    }

    pub fn workspace(&self, tree_id: &str) -> Option<Arc<Workspace<S>>> {
        self.workspaces.read().get(tree_id).cloned()
    }

    /// Stop a workspace's channels and forget it.
    pub fn close_workspace(&self, tree_id: &str) {
        if let Some(workspace) = self.workspaces.write().remove(tree_id) {
            workspace.stop_sync();
        }
    }

    pub fn workspace_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workspaces.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Forward a foreground/background change to the scheduler.
    pub async fn set_visibility(&self, visibility: Visibility) {
        self.scheduler.set_visibility(visibility).await;
    }

    /// Stop every workspace and flush pending writes.
    pub async fn shutdown(&self) {
        let workspaces: Vec<_> = self.workspaces.write().drain().map(|(_, ws)| ws).collect();
        for workspace in workspaces {
            workspace.stop_sync();
        }
        self.scheduler.shutdown().await;
        tracing::debug!(actor = %self.config.actor, "client shut down");
    }
}

/// Convenience functions for quickly wiring up several clients.
pub mod quick {
    use super::*;

    /// One client per actor, all sharing `store`, each with its own scheduler.
    pub fn collaborative_clients<S: RemoteStore>(
        store: Arc<S>,
        actors: &[&str],
        clock: SharedClock,
    ) -> Vec<Client<S>> {
        actors
            .iter()
            .map(|actor| {
                let config = ClientConfig {
                    actor: actor.to_string(),
                    ..Default::default()
                };
                Client::with_clock(store.clone(), config, clock.clone())
            })
            .collect()
    }

    /// Like [`collaborative_clients`] over a fresh in-memory store.
    pub fn memory_clients(actors: &[&str]) -> (Arc<MemoryStore>, Vec<Client<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let clients = collaborative_clients(store.clone(), actors, Arc::new(SystemClock));
        (store, clients)
    }
}
