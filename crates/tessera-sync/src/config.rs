//! Scheduler configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Stream name for the shared tree document.
pub const STREAM_TREE: &str = "tree";
/// Stream name for the lock document.
pub const STREAM_LOCKS: &str = "locks";
/// Stream name for the audit log.
pub const STREAM_AUDIT: &str = "audit";
/// Stream name for the snapshot list.
pub const STREAM_SNAPSHOTS: &str = "snapshots";

/// Polling cadence for one logical stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Nominal poll period while foregrounded (in milliseconds).
    pub base_interval_ms: u64,
    /// Interval multiplier applied while backgrounded.
    pub background_multiplier: u32,
}

impl StreamConfig {
    pub const fn new(base_interval_ms: u64, background_multiplier: u32) -> Self {
        Self {
            base_interval_ms,
            background_multiplier,
        }
    }

    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new(10_000, 2)
    }
}

/// Configuration for the sync scheduler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Per-stream cadence, keyed by stream name.
    pub streams: HashMap<String, StreamConfig>,
    /// Cadence for streams without an entry in `streams`.
    pub fallback: StreamConfig,
    /// Pause between refetches during a visibility transition (in milliseconds).
    pub transition_stagger_ms: u64,
    /// Only stagger when more than this many channels are active.
    pub stagger_threshold: usize,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let streams = [
            (STREAM_TREE, StreamConfig::new(5_000, 3)),
            (STREAM_LOCKS, StreamConfig::new(3_000, 2)),
            (STREAM_AUDIT, StreamConfig::new(15_000, 4)),
            (STREAM_SNAPSHOTS, StreamConfig::new(30_000, 4)),
        ]
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), cfg))
        .collect();

        Self {
            streams,
            fallback: StreamConfig::default(),
            transition_stagger_ms: 50,
            stagger_threshold: 4,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Resolve the cadence for a channel key.
    ///
    /// The stream name is the part of the key before the first `:`, so
    /// `tree:2024-2025` and `tree` share the `tree` cadence.
    pub fn stream_config(&self, key: &str) -> StreamConfig {
        let stream = key.split(':').next().unwrap_or(key);
        self.streams.get(stream).copied().unwrap_or(self.fallback)
    }
}

/// Builder for scheduler configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn stream(
        mut self,
        name: impl Into<String>,
        base_interval_ms: u64,
        background_multiplier: u32,
    ) -> Self {
        self.config.streams.insert(
            name.into(),
            StreamConfig::new(base_interval_ms, background_multiplier),
        );
        self
    }

    pub fn fallback(mut self, base_interval_ms: u64, background_multiplier: u32) -> Self {
        self.config.fallback = StreamConfig::new(base_interval_ms, background_multiplier);
        self
    }

    pub fn transition_stagger(mut self, ms: u64) -> Self {
        self.config.transition_stagger_ms = ms;
        self
    }

    pub fn stagger_threshold(mut self, channels: usize) -> Self {
        self.config.stagger_threshold = channels;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
