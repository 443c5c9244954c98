//! Tessera SDK - collaborative editing of one large shared tree
//!
//! This SDK ties the sync core together behind a small API. A [`Client`]
//! is the application root; each [`Workspace`] is one shared tree with its
//! polling channels, soft locks, audit trail, snapshots and session
//! undo/redo.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serde_json::json;
//! use tessera_sdk::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let alice = Client::new(store.clone(), ClientConfigBuilder::new().actor("alice").build());
//!
//! let tree = alice.open_workspace("tree-2024").await?;
//! tree.seed(json!({ "id": "tree-2024", "outcomes": [{ "id": "LO-1" }] })).await?;
//! tree.start_sync().await;
//!
//! tree.acquire_lock("LO-1").await?;
//! tree.set_status("LO-1", "developed").await?;
//! tree.undo().await?;
//! ```
//!
//! # Architecture
//!
//! - [`client`] - Application-root context and configuration
//! - [`workspace`] - One shared tree and its mutation surface
//! - [`command`] - Tree edits and the reversible commands they produce
//! - [`tree`] - Addressing nodes inside the tree
//! - [`error`] - Error types

pub mod client;
pub mod command;
pub mod error;
pub mod tree;
pub mod workspace;

// Re-exports for convenience
pub use client::{quick, Client, ClientConfig, ClientConfigBuilder};
pub use command::{course_link, resource_add, resource_remove, status_change, Edit, TreeCommand, TreeTarget};
pub use error::{Result, SdkError};
pub use workspace::{Workspace, WorkspaceEvent, TREES_COLLECTION};
pub use tree::StatusFields;

/// Everything a host application usually needs.
pub mod prelude {
    pub use crate::client::{Client, ClientConfig, ClientConfigBuilder};
    pub use crate::command::{Edit, TreeCommand};
    pub use crate::error::{Result, SdkError};
    pub use crate::workspace::{Workspace, WorkspaceEvent};
    pub use tessera_db::{AuditAction, AuditLogEntry, Clock, Lock, ManualClock, Snapshot, SystemClock};
    pub use tessera_store::{MemoryStore, RemoteStore, StoreError};
    pub use tessera_sync::{SyncConfig, SyncConfigBuilder, SyncScheduler, Visibility};
}
