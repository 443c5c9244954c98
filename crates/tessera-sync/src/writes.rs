//! Write-side debouncing and batching.
//!
//! Both primitives sit in front of remote writes, not reads:
//!
//! - [`SyncScheduler::debounce_write`] keeps only the last write per key
//!   within the delay.
//! - [`SyncScheduler::batch_write`] accumulates writes per batch key and runs
//!   them concurrently once the batch has been quiet for the delay. The
//!   window slides: every new operation resets the timer, so a batch flushes
//!   `delay` after its *last* operation rather than its first.

use crate::scheduler::{Shared, SyncEvent, SyncScheduler};
use futures::future::{join_all, BoxFuture};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tessera_store::StoreError;
use tokio::task::JoinHandle;

/// A deferred remote write.
pub type WriteOp = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), StoreError>> + Send>;

pub(crate) struct PendingWrite {
    generation: u64,
    op: WriteOp,
    timer: JoinHandle<()>,
}

pub(crate) struct PendingBatch {
    generation: u64,
    ops: Vec<WriteOp>,
    timer: JoinHandle<()>,
}

fn boxed<F, Fut>(write: F) -> WriteOp
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    Box::new(move || -> BoxFuture<'static, Result<(), StoreError>> { Box::pin(write()) })
}

async fn run_write(shared: &Shared, key: &str, op: WriteOp) {
    match op().await {
        Ok(()) => {
            tracing::debug!(key, "debounced write flushed");
            shared.emit(SyncEvent::WriteFlushed {
                key: key.to_string(),
            });
        }
        Err(err) => {
            tracing::warn!(key, error = %err, "debounced write failed");
            shared.emit(SyncEvent::WriteFailed {
                key: key.to_string(),
                error: err.to_string(),
            });
        }
    }
}

async fn run_batch(shared: &Shared, key: &str, ops: Vec<WriteOp>) {
    let operations = ops.len();
    let results = join_all(ops.into_iter().map(|op| op())).await;
    let failures = results.iter().filter(|r| r.is_err()).count();

    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        tracing::warn!(key, error = %err, "batched write failed");
    }
    tracing::debug!(key, operations, failures, "batch flushed");
    shared.emit(SyncEvent::BatchFlushed {
        key: key.to_string(),
        operations,
        failures,
    });
}

impl SyncScheduler {
    /// Schedule `write` to run after `delay`, replacing any write still
    /// pending under the same key.
    pub fn debounce_write<F, Fut>(&self, key: impl Into<String>, write: F, delay: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let key = key.into();
        let generation = self.shared.next_generation();
        let weak = Arc::downgrade(&self.shared);

        let mut pending = self.shared.debounces.lock();
        if let Some(previous) = pending.remove(&key) {
            previous.timer.abort();
            tracing::trace!(key = %key, "debounced write superseded");
        }

        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let op = {
                let mut pending = shared.debounces.lock();
                match pending.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        pending.remove(&timer_key).map(|entry| entry.op)
                    }
                    _ => None,
                }
            };
            if let Some(op) = op {
                run_write(&shared, &timer_key, op).await;
            }
        });

        pending.insert(
            key,
            PendingWrite {
                generation,
                op: boxed(write),
                timer,
            },
        );
    }

    /// Add `operation` to the batch under `batch_key` and restart the batch
    /// timer. When the timer expires every accumulated operation runs
    /// concurrently and the batch is cleared.
    pub fn batch_write<F, Fut>(&self, batch_key: impl Into<String>, operation: F, delay: Duration)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
    {
        let batch_key = batch_key.into();
        let generation = self.shared.next_generation();
        let weak = Arc::downgrade(&self.shared);

        let mut batches = self.shared.batches.lock();
        let mut ops = match batches.remove(&batch_key) {
            Some(previous) => {
                previous.timer.abort();
                previous.ops
            }
            None => Vec::new(),
        };
        ops.push(boxed(operation));

        let timer_key = batch_key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let ops = {
                let mut batches = shared.batches.lock();
                match batches.get(&timer_key) {
                    Some(batch) if batch.generation == generation => {
                        batches.remove(&timer_key).map(|batch| batch.ops)
                    }
                    _ => None,
                }
            };
            if let Some(ops) = ops {
                run_batch(&shared, &timer_key, ops).await;
            }
        });

        batches.insert(
            batch_key,
            PendingBatch {
                generation,
                ops,
                timer,
            },
        );
    }

    /// Number of operations waiting in a batch.
    pub fn pending_batch_len(&self, batch_key: &str) -> usize {
        self.shared
            .batches
            .lock()
            .get(batch_key)
            .map(|batch| batch.ops.len())
            .unwrap_or(0)
    }

    /// Check whether a debounced write is pending under `key`.
    pub fn has_pending_write(&self, key: &str) -> bool {
        self.shared.debounces.lock().contains_key(key)
    }

    /// Run every pending debounced write and batch now instead of waiting
    /// for their timers.
    pub async fn flush_pending(&self) {
        let writes: Vec<_> = {
            let mut pending = self.shared.debounces.lock();
            pending
                .drain()
                .map(|(key, entry)| {
                    entry.timer.abort();
                    (key, entry.op)
                })
                .collect()
        };
        let batches: Vec<_> = {
            let mut pending = self.shared.batches.lock();
            pending
                .drain()
                .map(|(key, batch)| {
                    batch.timer.abort();
                    (key, batch.ops)
                })
                .collect()
        };

        for (key, op) in writes {
            run_write(&self.shared, &key, op).await;
        }
        for (key, ops) in batches {
            run_batch(&self.shared, &key, ops).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keeps_last_write() {
        let scheduler = SyncScheduler::default();
        let written = Arc::new(Mutex::new(Vec::new()));

        for value in 1..=3 {
            let sink = written.clone();
            scheduler.debounce_write(
                "description:LO-1",
                move || async move {
                    sink.lock().push(value);
                    Ok(())
                },
                Duration::from_millis(300),
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(written.lock().is_empty());
        assert!(scheduler.has_pending_write("description:LO-1"));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*written.lock(), vec![3]);
        assert!(!scheduler.has_pending_write("description:LO-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_keys_are_independent() {
        let scheduler = SyncScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));

        for key in ["a", "b"] {
            let count = count.clone();
            scheduler.debounce_write(
                key,
                move || async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_millis(50),
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_pending_runs_everything() {
        let scheduler = SyncScheduler::default();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        scheduler.debounce_write(
            "w",
            move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            Duration::from_secs(60),
        );
        for _ in 0..2 {
            let c = count.clone();
            scheduler.batch_write(
                "b",
                move || async move {
                    c.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                },
                Duration::from_secs(60),
            );
        }

        scheduler.flush_pending().await;
        assert_eq!(count.load(Ordering::SeqCst), 21);
        assert_eq!(scheduler.pending_batch_len("b"), 0);
        assert!(!scheduler.has_pending_write("w"));
    }
}
