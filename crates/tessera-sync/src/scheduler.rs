//! Adaptive polling scheduler.
//!
//! One [`SyncChannel`] exists per logical stream key. Each channel owns a
//! repeating timer whose period is `base_interval × multiplier`, where the
//! multiplier is 1 in the foreground and the stream's background
//! multiplier otherwise. Every tick consults the response cache first and
//! only reads the remote store when the cached value is older than the
//! channel's TTL (half the base interval).

use crate::cache::{CacheEntry, ResponseCache};
use crate::config::SyncConfig;
use crate::writes::{PendingBatch, PendingWrite};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_store::StoreError;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Boxed future produced by a channel's fetch function.
pub type FetchFuture = BoxFuture<'static, Result<Value, StoreError>>;
/// Produces the latest value of a stream.
pub type FetchFn = Arc<dyn Fn() -> FetchFuture + Send + Sync>;
/// Receives every value delivered on a stream.
pub type UpdateFn = Arc<dyn Fn(Value) + Send + Sync>;

/// Host visibility, driving the polling multiplier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Foreground,
    Background,
}

/// Events emitted by the scheduler.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A value was delivered on a stream.
    Fetched { key: String, from_cache: bool },
    /// A live fetch failed; the previous value stays in place.
    FetchFailed { key: String, error: String },
    /// The host changed visibility and every channel was rearmed.
    VisibilityChanged(Visibility),
    /// A debounced write ran successfully.
    WriteFlushed { key: String },
    /// A debounced write failed.
    WriteFailed { key: String, error: String },
    /// A batch ran; `failures` of its `operations` returned an error.
    BatchFlushed {
        key: String,
        operations: usize,
        failures: usize,
    },
}

/// Read-budget counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Calls that reached the remote store.
    pub live_fetches: u64,
    /// Calls answered from the cache.
    pub cache_hits: u64,
    /// Live fetches that returned an error.
    pub fetch_errors: u64,
}

#[derive(Default)]
struct Counters {
    live_fetches: AtomicU64,
    cache_hits: AtomicU64,
    fetch_errors: AtomicU64,
}

/// One polling channel per logical stream.
pub struct SyncChannel {
    pub key: String,
    pub base_interval: Duration,
    pub background_multiplier: u32,
    /// Always half of `base_interval`.
    pub cache_ttl: Duration,
    fetch: FetchFn,
    on_update: UpdateFn,
}

impl SyncChannel {
    fn new(
        key: String,
        base_interval: Duration,
        background_multiplier: u32,
        fetch: FetchFn,
        on_update: UpdateFn,
    ) -> Self {
        Self {
            key,
            base_interval,
            background_multiplier,
            cache_ttl: base_interval / 2,
            fetch,
            on_update,
        }
    }

    /// Timer period under the given visibility.
    pub fn period(&self, visibility: Visibility) -> Duration {
        match visibility {
            Visibility::Foreground => self.base_interval,
            Visibility::Background => self.base_interval * self.background_multiplier.max(1),
        }
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("key", &self.key)
            .field("base_interval", &self.base_interval)
            .field("background_multiplier", &self.background_multiplier)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

struct ChannelSlot {
    generation: u64,
    channel: Arc<SyncChannel>,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) config: SyncConfig,
    cache: Mutex<ResponseCache>,
    channels: Mutex<HashMap<String, ChannelSlot>>,
    pub(crate) debounces: Mutex<HashMap<String, PendingWrite>>,
    pub(crate) batches: Mutex<HashMap<String, PendingBatch>>,
    visibility: RwLock<Visibility>,
    transition: tokio::sync::Mutex<()>,
    next_generation: AtomicU64,
    counters: Counters,
    pub(crate) event_tx: broadcast::Sender<SyncEvent>,
}

impl Shared {
    pub(crate) fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.channels
            .lock()
            .get(key)
            .map(|slot| slot.generation == generation)
            .unwrap_or(false)
    }

    /// Remove a channel, abort its timer and evict its cache entry.
    fn cancel_channel(&self, key: &str, generation: Option<u64>) -> bool {
        let removed = {
            let mut channels = self.channels.lock();
            match channels.get(key) {
                Some(slot) if generation.map_or(true, |g| g == slot.generation) => {
                    channels.remove(key)
                }
                _ => None,
            }
        };

        match removed {
            Some(slot) => {
                if let Some(timer) = slot.timer {
                    timer.abort();
                }
                self.cache.lock().evict(key);
                tracing::debug!(key, "polling channel cancelled");
                true
            }
            None => false,
        }
    }
}

/// Handle returned by [`SyncScheduler::start_polling`].
///
/// The channel keeps running until [`PollHandle::cancel`] is called or the
/// key is re-registered; dropping the handle does not stop it.
#[derive(Clone, Debug)]
pub struct PollHandle {
    key: String,
    generation: u64,
    shared: Weak<Shared>,
}

impl PollHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop the timer and evict the cache entry. Idempotent; a handle for a
    /// channel that has since been replaced under the same key is a no-op.
    pub fn cancel(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.cancel_channel(&self.key, Some(self.generation));
        }
    }

    /// Check whether this handle's channel is still registered.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_current(&self.key, self.generation))
            .unwrap_or(false)
    }
}

/// The adaptive sync scheduler.
///
/// This is an explicit context object: clones share the same cache and
/// channel maps, and independent schedulers never interfere.
#[derive(Clone)]
pub struct SyncScheduler {
    pub(crate) shared: Arc<Shared>,
}

impl SyncScheduler {
    /// Create a new scheduler.
    pub fn new(config: SyncConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                config,
                cache: Mutex::new(ResponseCache::new()),
                channels: Mutex::new(HashMap::new()),
                debounces: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                visibility: RwLock::new(Visibility::Foreground),
                transition: tokio::sync::Mutex::new(()),
                next_generation: AtomicU64::new(1),
                counters: Counters::default(),
                event_tx,
            }),
        }
    }

    /// Get the scheduler configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    /// Current host visibility.
    pub fn visibility(&self) -> Visibility {
        *self.shared.visibility.read()
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = &self.shared.counters;
        SchedulerStats {
            live_fetches: counters.live_fetches.load(Ordering::SeqCst),
            cache_hits: counters.cache_hits.load(Ordering::SeqCst),
            fetch_errors: counters.fetch_errors.load(Ordering::SeqCst),
        }
    }

    /// Keys of all active channels, sorted.
    pub fn active_channels(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.shared.channels.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Get the channel registered under a key.
    pub fn channel(&self, key: &str) -> Option<Arc<SyncChannel>> {
        self.shared
            .channels
            .lock()
            .get(key)
            .map(|slot| slot.channel.clone())
    }

    /// The cached entry for a key, fresh or not.
    pub fn cache_entry(&self, key: &str) -> Option<CacheEntry> {
        self.shared.cache.lock().get(key).cloned()
    }

    /// Start polling a stream.
    ///
    /// Cancels any previous channel registered under `key`, performs one
    /// immediate fetch-and-cache-check, then arms the repeating timer.
    /// `custom_interval` replaces the stream's base interval.
    pub async fn start_polling<F, Fut, U>(
        &self,
        key: impl Into<String>,
        fetch: F,
        on_update: U,
        custom_interval: Option<Duration>,
    ) -> PollHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StoreError>> + Send + 'static,
        U: Fn(Value) + Send + Sync + 'static,
    {
        let key = key.into();
        self.shared.cancel_channel(&key, None);

        let stream = self.shared.config.stream_config(&key);
        let base_interval = custom_interval.unwrap_or_else(|| stream.base_interval());
        let fetch: FetchFn = Arc::new(move || -> FetchFuture { Box::pin(fetch()) });
        let channel = Arc::new(SyncChannel::new(
            key.clone(),
            base_interval,
            stream.background_multiplier,
            fetch,
            Arc::new(on_update),
        ));

        let generation = self.shared.next_generation();
        self.shared.channels.lock().insert(
            key.clone(),
            ChannelSlot {
                generation,
                channel: channel.clone(),
                timer: None,
            },
        );
        tracing::debug!(key = %key, ?base_interval, "polling channel started");

        self.run_tick(&channel, generation, false).await;
        self.arm(&key, generation);

        PollHandle {
            key,
            generation,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Cancel whatever channel is registered under `key`.
    pub fn stop_polling(&self, key: &str) -> bool {
        self.shared.cancel_channel(key, None)
    }

    /// Return the cached value for `key` if it is younger than `ttl`,
    /// otherwise call `fetch`, cache the result under `ttl` and return it.
    pub async fn fetch_cached<F, Fut>(
        &self,
        key: &str,
        fetch: F,
        ttl: Duration,
    ) -> Result<Value, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, StoreError>>,
    {
        if let Some(value) = self.cached(key) {
            return Ok(value);
        }
        let value = self.fetch_live(key, fetch()).await?;
        self.store_cache(key, value.clone(), ttl);
        Ok(value)
    }

    /// Force a live fetch on an active channel and deliver the result.
    pub async fn refresh(&self, key: &str) -> bool {
        let slot = {
            let channels = self.shared.channels.lock();
            channels
                .get(key)
                .map(|slot| (slot.generation, slot.channel.clone()))
        };
        match slot {
            Some((generation, channel)) => {
                self.run_tick(&channel, generation, true).await;
                true
            }
            None => false,
        }
    }

    /// Write-through: cache a value the local client just saved so the next
    /// tick inside the TTL does not read it back from the store.
    pub fn prime(&self, key: &str, value: Value) {
        let ttl = self
            .channel(key)
            .map(|channel| channel.cache_ttl)
            .unwrap_or_else(|| self.shared.config.stream_config(key).base_interval() / 2);
        self.store_cache(key, value, ttl);
    }

    /// The single ordered visibility transition handler.
    ///
    /// Channels are refetched one at a time in key order (with an optional
    /// stagger when many are active) and each timer is rearmed with the new
    /// multiplier. Concurrent transitions are serialized.
    pub async fn set_visibility(&self, visibility: Visibility) {
        let _transition = self.shared.transition.lock().await;
        {
            let mut current = self.shared.visibility.write();
            if *current == visibility {
                return;
            }
            *current = visibility;
        }

        let mut active: Vec<(String, u64, Arc<SyncChannel>)> = {
            let mut channels = self.shared.channels.lock();
            channels
                .iter_mut()
                .map(|(key, slot)| {
                    if let Some(timer) = slot.timer.take() {
                        timer.abort();
                    }
                    (key.clone(), slot.generation, slot.channel.clone())
                })
                .collect()
        };
        active.sort_by(|a, b| a.0.cmp(&b.0));

        tracing::info!(?visibility, channels = active.len(), "visibility changed");
        self.shared.emit(SyncEvent::VisibilityChanged(visibility));

        let config = &self.shared.config;
        let stagger = (config.transition_stagger_ms > 0 && active.len() > config.stagger_threshold)
            .then(|| Duration::from_millis(config.transition_stagger_ms));

        for (index, (key, generation, channel)) in active.iter().enumerate() {
            if index > 0 {
                if let Some(delay) = stagger {
                    tokio::time::sleep(delay).await;
                }
            }
            self.run_tick(channel, *generation, true).await;
            self.arm(key, *generation);
        }
    }

    fn cached(&self, key: &str) -> Option<Value> {
        let value = self.shared.cache.lock().get_fresh(key, Instant::now());
        if value.is_some() {
            self.shared.counters.cache_hits.fetch_add(1, Ordering::SeqCst);
        }
        value
    }

    fn store_cache(&self, key: &str, value: Value, ttl: Duration) {
        self.shared
            .cache
            .lock()
            .insert(key, CacheEntry::new(value, Instant::now(), ttl));
    }

    async fn fetch_live(
        &self,
        key: &str,
        fetch: impl Future<Output = Result<Value, StoreError>>,
    ) -> Result<Value, StoreError> {
        self.shared
            .counters
            .live_fetches
            .fetch_add(1, Ordering::SeqCst);
        match fetch.await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.shared
                    .counters
                    .fetch_errors
                    .fetch_add(1, Ordering::SeqCst);
                tracing::warn!(key, error = %err, "fetch failed; keeping previous value");
                self.shared.emit(SyncEvent::FetchFailed {
                    key: key.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// One tick: cache check (unless forced), live fetch, cache, deliver.
    /// Results for a channel that was cancelled mid-fetch are discarded.
    async fn run_tick(&self, channel: &SyncChannel, generation: u64, force: bool) {
        let key = channel.key.as_str();

        if !force {
            if let Some(value) = self.cached(key) {
                self.shared.emit(SyncEvent::Fetched {
                    key: key.to_string(),
                    from_cache: true,
                });
                (channel.on_update)(value);
                return;
            }
        }

        let Ok(value) = self.fetch_live(key, (channel.fetch)()).await else {
            return;
        };
        if !self.shared.is_current(key, generation) {
            return;
        }

        self.store_cache(key, value.clone(), channel.cache_ttl);
        self.shared.emit(SyncEvent::Fetched {
            key: key.to_string(),
            from_cache: false,
        });
        (channel.on_update)(value);
    }

    /// (Re)arm the timer for a channel under the current visibility.
    fn arm(&self, key: &str, generation: u64) {
        let visibility = self.visibility();
        let mut channels = self.shared.channels.lock();
        let Some(slot) = channels.get_mut(key) else {
            return;
        };
        if slot.generation != generation {
            return;
        }
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }

        let period = slot.channel.period(visibility).max(Duration::from_millis(1));
        let channel = slot.channel.clone();
        let shared = Arc::downgrade(&self.shared);
        slot.timer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                SyncScheduler { shared }
                    .run_tick(&channel, generation, false)
                    .await;
            }
        }));
    }

    /// Cancel every channel and flush pending debounced and batched writes.
    pub async fn shutdown(&self) {
        let keys: Vec<_> = self.shared.channels.lock().keys().cloned().collect();
        for key in keys {
            self.shared.cancel_channel(&key, None);
        }
        self.flush_pending().await;
    }
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new(SyncConfig::default())
    }
}
