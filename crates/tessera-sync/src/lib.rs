//! # tessera-sync
//!
//! Adaptive sync scheduler for the Tessera collaborative sync core.
//!
//! This crate provides:
//! - One polling channel per logical stream (tree, locks, audit, snapshots)
//! - A short-TTL response cache that bounds remote reads
//! - Foreground/background cadence with a single ordered transition handler
//! - Write debouncing and sliding-window write batching
//!
//! ## Example
//!
//! ```rust,ignore
//! use tessera_sync::{SyncScheduler, SyncConfig, Visibility};
//!
//! let scheduler = SyncScheduler::new(SyncConfig::default());
//! let handle = scheduler
//!     .start_polling("tree:2024", move || fetch_tree(store.clone()), |tree| render(tree), None)
//!     .await;
//!
//! // Host went to the background: every channel slows down.
//! scheduler.set_visibility(Visibility::Background).await;
//!
//! handle.cancel();
//! ```

pub mod cache;
pub mod config;
pub mod scheduler;
pub mod writes;

pub use cache::{CacheEntry, ResponseCache};
pub use config::{
    StreamConfig, SyncConfig, SyncConfigBuilder, STREAM_AUDIT, STREAM_LOCKS, STREAM_SNAPSHOTS,
    STREAM_TREE,
};
pub use scheduler::{
    FetchFn, FetchFuture, PollHandle, SchedulerStats, SyncChannel, SyncEvent, SyncScheduler,
    UpdateFn, Visibility,
};
pub use writes::WriteOp;
