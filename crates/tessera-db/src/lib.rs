//! # tessera-db
//!
//! Core collaboration state for the Tessera sync core.
//!
//! This crate provides:
//! - Advisory soft locks with read-time expiry
//! - An append-only audit log of every tree mutation
//! - Full-tree snapshots for point-in-time restore
//! - A bounded, session-local undo/redo stack
//!
//! Everything that touches the remote side goes through a
//! [`RemoteStore`](tessera_store::RemoteStore); nothing here owns a timer.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tessera_db::{AuditAction, AuditLog, AuditLogEntry, SoftLockManager, SystemClock};
//! use tessera_store::MemoryStore;
//!
//! let store = Arc::new(MemoryStore::new());
//!
//! let locks = SoftLockManager::new(store.clone(), "tree-2024", Arc::new(SystemClock));
//! locks.acquire("LO-17", "alice").await?;
//! assert!(locks.is_locked("LO-17", "bob"));
//!
//! let audit = AuditLog::new(store.clone());
//! audit
//!     .log_action(&AuditLogEntry::new(0, "alice", AuditAction::StatusChange, "LO-17", "Planned -> Developed"))
//!     .await?;
//! ```

pub mod audit;
pub mod clock;
pub mod history;
pub mod lock;
pub mod snapshot;

// Clock exports
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

// Soft lock exports
pub use lock::{Lock, LockTable, SoftLockManager, LOCKS_COLLECTION, LOCK_TTL_MS};

// Audit exports
pub use audit::{AuditAction, AuditLog, AuditLogEntry, StoredEntry, AUDIT_COLLECTION};

// Snapshot exports
pub use snapshot::{Snapshot, SnapshotStore, SNAPSHOTS_COLLECTION};

// Undo/Redo exports
pub use history::{
    ActionId, HistoryAction, HistoryStack, Reversible, DEFAULT_HISTORY_CAPACITY,
};
