//! # tessera-store
//!
//! Remote store gateway for the Tessera collaborative sync core.
//!
//! The sync core never talks to a concrete database. Everything it needs
//! from the outside world is expressed by the [`RemoteStore`] trait:
//!
//! - `read` a single document
//! - `write` a document, either wholesale or as a partial merge
//! - `append` a document to a collection under a fresh id
//! - `query` / `watch` a collection
//!
//! The backing store is assumed to offer no transactions, no locking and
//! only eventually-consistent reads.
//!
//! [`MemoryStore`] is an in-process implementation used by tests, the
//! simulation binary and any host that wants a local-only workspace.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_store::{MemoryStore, RemoteStore};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! store.write("trees", "2024", json!({ "domains": [] }), false).await?;
//! let tree = store.read("trees", "2024").await?;
//! ```

pub mod error;
pub mod gateway;
pub mod memory;

pub use error::{Result, StoreError};
pub use gateway::{DocumentKey, Query, RemoteStore, SortOrder, StoredDocument};
pub use memory::{MemoryStore, StoreStats};
