//! Timing tests for the adaptive sync scheduler.
//!
//! These tests run on tokio's paused clock, so every interval is exact:
//! - Cache coherence: no second remote read inside the TTL, always one after
//! - Background cadence: ticks slow down by the stream multiplier
//! - Foreground return: an immediate refetch of every channel
//! - Cancellation: no ticks and no cache entry after `cancel()`
//! - Sliding batch window

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_store::{MemoryStore, RemoteStore, StoreError};
use tessera_sync::{SyncConfigBuilder, SyncEvent, SyncScheduler, Visibility};
use tokio::time::{advance, sleep, Instant};

fn counter_fetch(
    counter: &Arc<AtomicUsize>,
) -> impl Fn() -> futures::future::Ready<Result<Value, StoreError>> + Send + Sync + 'static {
    let counter = counter.clone();
    move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        futures::future::ready(Ok(json!(n)))
    }
}

#[tokio::test(start_paused = true)]
async fn cache_hit_inside_ttl_and_refetch_after() {
    let scheduler = SyncScheduler::default();
    let fetches = Arc::new(AtomicUsize::new(0));
    let ttl = Duration::from_millis(500);

    let fetch = counter_fetch(&fetches);
    let first = scheduler.fetch_cached("tree", &fetch, ttl).await.unwrap();
    assert_eq!(first, json!(1));

    advance(Duration::from_millis(499)).await;
    let second = scheduler.fetch_cached("tree", &fetch, ttl).await.unwrap();
    assert_eq!(second, json!(1));
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    advance(Duration::from_millis(1)).await;
    let third = scheduler.fetch_cached("tree", &fetch, ttl).await.unwrap();
    assert_eq!(third, json!(2));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    let stats = scheduler.stats();
    assert_eq!(stats.live_fetches, 2);
    assert_eq!(stats.cache_hits, 1);
}

#[tokio::test(start_paused = true)]
async fn background_multiplier_and_foreground_refetch() {
    let config = SyncConfigBuilder::new().stream("tree", 1_000, 3).build();
    let scheduler = SyncScheduler::new(config);
    let fetches = Arc::new(AtomicUsize::new(0));

    let handle = scheduler
        .start_polling("tree:t1", counter_fetch(&fetches), |_| {}, None)
        .await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    // Foreground tick at t=1000.
    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 2);

    // Going to the background refetches once and rearms at 3x.
    scheduler.set_visibility(Visibility::Background).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 3);

    sleep(Duration::from_millis(2_900)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 3, "no tick before B*m");

    sleep(Duration::from_millis(200)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 4);

    // Returning to the foreground fetches immediately.
    scheduler.set_visibility(Visibility::Foreground).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 5);

    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 6);

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn unchanged_visibility_is_a_noop() {
    let scheduler = SyncScheduler::default();
    let fetches = Arc::new(AtomicUsize::new(0));
    let handle = scheduler
        .start_polling("locks", counter_fetch(&fetches), |_| {}, None)
        .await;

    scheduler.set_visibility(Visibility::Foreground).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn transition_refetches_in_key_order_with_stagger() {
    let config = SyncConfigBuilder::new()
        .fallback(10_000, 2)
        .transition_stagger(50)
        .stagger_threshold(4)
        .build();
    let scheduler = SyncScheduler::new(config);
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for key in ["f", "c", "a", "e", "b", "d"] {
        let order = order.clone();
        let handle = scheduler
            .start_polling(
                format!("stream-{key}"),
                move || {
                    order.lock().push(key);
                    async { Ok(Value::Null) }
                },
                |_| {},
                None,
            )
            .await;
        handles.push(handle);
    }
    order.lock().clear();

    let started = Instant::now();
    scheduler.set_visibility(Visibility::Background).await;
    assert_eq!(*order.lock(), vec!["a", "b", "c", "d", "e", "f"]);
    assert!(started.elapsed() >= Duration::from_millis(250));

    for handle in handles {
        handle.cancel();
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_timer_and_evicts_cache() {
    let config = SyncConfigBuilder::new().stream("audit", 1_000, 2).build();
    let scheduler = SyncScheduler::new(config);
    let fetches = Arc::new(AtomicUsize::new(0));

    let handle = scheduler
        .start_polling("audit:2024", counter_fetch(&fetches), |_| {}, None)
        .await;
    assert!(scheduler.cache_entry("audit:2024").is_some());

    handle.cancel();
    handle.cancel();
    assert!(scheduler.cache_entry("audit:2024").is_none());
    assert!(scheduler.active_channels().is_empty());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_tick_keeps_last_value_and_next_tick_retries() {
    let store = MemoryStore::new();
    store
        .write("trees", "t1", json!({ "rev": 1 }), false)
        .await
        .unwrap();

    let config = SyncConfigBuilder::new().stream("tree", 1_000, 2).build();
    let scheduler = SyncScheduler::new(config);
    let latest = Arc::new(Mutex::new(None));

    let fetch_store = store.clone();
    let sink = latest.clone();
    let handle = scheduler
        .start_polling(
            "tree:t1",
            move || {
                let store = fetch_store.clone();
                async move {
                    store
                        .read("trees", "t1")
                        .await
                        .map(|doc| doc.unwrap_or(Value::Null))
                }
            },
            move |value| *sink.lock() = Some(value),
            None,
        )
        .await;
    assert_eq!(*latest.lock(), Some(json!({ "rev": 1 })));

    store
        .write("trees", "t1", json!({ "rev": 2 }), false)
        .await
        .unwrap();
    store.fail_next(1);

    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(*latest.lock(), Some(json!({ "rev": 1 })));
    assert_eq!(scheduler.stats().fetch_errors, 1);

    sleep(Duration::from_millis(1_000)).await;
    assert_eq!(*latest.lock(), Some(json!({ "rev": 2 })));

    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn batch_window_slides_with_each_operation() {
    let scheduler = SyncScheduler::default();
    let mut events = scheduler.subscribe();
    let ran = Arc::new(AtomicUsize::new(0));
    let delay = Duration::from_millis(100);

    for _ in 0..3 {
        let ran = ran.clone();
        scheduler.batch_write(
            "activity",
            move || async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            delay,
        );
        sleep(Duration::from_millis(80)).await;
    }
    // Last operation at t=160, so nothing may run before t=260.
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(scheduler.pending_batch_len("activity"), 3);

    sleep(Duration::from_millis(40)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(scheduler.pending_batch_len("activity"), 0);

    loop {
        match events.recv().await.unwrap() {
            SyncEvent::BatchFlushed {
                key,
                operations,
                failures,
            } => {
                assert_eq!(key, "activity");
                assert_eq!(operations, 3);
                assert_eq!(failures, 0);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn batch_failures_are_counted_not_fatal() {
    let scheduler = SyncScheduler::default();
    let mut events = scheduler.subscribe();
    let ran = Arc::new(AtomicUsize::new(0));

    for fail in [false, true, false] {
        let ran = ran.clone();
        scheduler.batch_write(
            "feed",
            move || async move {
                if fail {
                    return Err(StoreError::Unavailable("flaky".into()));
                }
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_millis(10),
        );
    }

    sleep(Duration::from_millis(20)).await;
    assert_eq!(ran.load(Ordering::SeqCst), 2);

    let flushed = loop {
        if let SyncEvent::BatchFlushed { failures, .. } = events.recv().await.unwrap() {
            break failures;
        }
    };
    assert_eq!(flushed, 1);
}

#[tokio::test(start_paused = true)]
async fn independent_schedulers_do_not_share_state() {
    let a = SyncScheduler::default();
    let b = SyncScheduler::default();

    let handle = a
        .start_polling("tree", || async { Ok(json!(1)) }, |_| {}, None)
        .await;

    assert_eq!(a.active_channels().len(), 1);
    assert!(b.active_channels().is_empty());
    assert!(b.cache_entry("tree").is_none());
    handle.cancel();
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_channels_and_flushes_writes() {
    let scheduler = SyncScheduler::default();
    let fetches = Arc::new(AtomicUsize::new(0));
    let written = Arc::new(AtomicUsize::new(0));

    let _handle = scheduler
        .start_polling("tree", counter_fetch(&fetches), |_| {}, None)
        .await;
    let w = written.clone();
    scheduler.debounce_write(
        "tree",
        move || async move {
            w.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        Duration::from_secs(30),
    );

    scheduler.shutdown().await;
    assert_eq!(written.load(Ordering::SeqCst), 1);
    assert!(scheduler.active_channels().is_empty());

    sleep(Duration::from_secs(60)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}
