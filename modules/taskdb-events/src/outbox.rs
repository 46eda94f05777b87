//! Outbox: bounded batching queue in front of the EventStore.
//!
//! Producers push events and return immediately (or wait, or are refused, per
//! the backpressure policy). A flusher drains the queue in batches of
//! `flush_size` every `flush_interval`, or as soon as a full batch is waiting.
//! A batch no backend accepted goes back to the head of the queue.
//!
//! A blocked producer waits at most the store timeout for space. If no flush
//! frees space by then (every backend is down), the push fails with `QueueFull`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use taskdb_common::{Backpressure, OutboxConfig, TaskDbError, TaskDbResult};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::store::EventStore;
use crate::types::TaskEvent;

/// Observable queue state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboxStats {
    pub depth: usize,
    pub capacity: usize,
    pub dropped: u64,
    pub flushed: u64,
    pub failed_flushes: u64,
    pub last_flush_latency_ms: Option<u64>,
}

struct OutboxInner {
    store: EventStore,
    config: OutboxConfig,
    queue: Mutex<VecDeque<TaskEvent>>,
    flush_lock: Mutex<()>,
    last_flush_latency: Mutex<Option<Duration>>,
    space: Notify,
    ready: Notify,
    shutdown: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    flushed: AtomicU64,
    failed_flushes: AtomicU64,
}

#[derive(Clone)]
pub struct Outbox {
    inner: Arc<OutboxInner>,
}

impl Outbox {
    pub fn new(store: EventStore, config: OutboxConfig) -> Self {
        Self {
            inner: Arc::new(OutboxInner {
                store,
                config,
                queue: Mutex::new(VecDeque::new()),
                flush_lock: Mutex::new(()),
                last_flush_latency: Mutex::new(None),
                space: Notify::new(),
                ready: Notify::new(),
                shutdown: Notify::new(),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                flushed: AtomicU64::new(0),
                failed_flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueue one event. Invalid events are refused up front.
    pub async fn push(&self, event: TaskEvent) -> TaskDbResult<()> {
        event.validate()?;
        let inner = &self.inner;
        let capacity = inner.config.capacity;
        let deadline = tokio::time::Instant::now() + inner.store.timeout();

        loop {
            // Register for the wakeup before checking, so a flush between the
            // check and the await cannot be missed.
            let space = inner.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut queue = inner.queue.lock().await;
                if queue.len() < capacity {
                    queue.push_back(event);
                    if queue.len() >= inner.config.flush_size {
                        inner.ready.notify_one();
                    }
                    return Ok(());
                }

                match inner.config.backpressure {
                    Backpressure::Block => {}
                    Backpressure::DropOldest => {
                        queue.pop_front();
                        queue.push_back(event);
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(capacity, "Outbox full, dropped oldest event");
                        inner.ready.notify_one();
                        return Ok(());
                    }
                    Backpressure::Reject => return Err(TaskDbError::QueueFull { capacity }),
                }
            }

            debug!(capacity, "Outbox full, waiting for flush");
            inner.ready.notify_one();
            if tokio::time::timeout_at(deadline, space).await.is_err() {
                warn!(capacity, "Outbox still full at deadline, refusing event");
                return Err(TaskDbError::QueueFull { capacity });
            }
        }
    }

    /// Drain the queue into the store in `flush_size` batches. Returns how many
    /// events were written. Stops at the first batch no backend accepted.
    pub async fn flush(&self) -> TaskDbResult<usize> {
        let inner = &self.inner;
        let _guard = inner.flush_lock.lock().await;
        let mut written = 0;

        loop {
            let batch: Vec<TaskEvent> = {
                let mut queue = inner.queue.lock().await;
                let n = queue.len().min(inner.config.flush_size);
                queue.drain(..n).collect()
            };
            if batch.is_empty() {
                break;
            }

            let started = Instant::now();
            let result = inner.store.insert_batch(&batch).await;
            *inner.last_flush_latency.lock().await = Some(started.elapsed());

            match result {
                Ok(_) => {
                    written += batch.len();
                    inner
                        .flushed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    inner.space.notify_waiters();
                }
                Err(e) => {
                    inner.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    let mut queue = inner.queue.lock().await;
                    for event in batch.into_iter().rev() {
                        queue.push_front(event);
                    }
                    // Producers kept filling the queue while the batch was out.
                    if inner.config.backpressure == Backpressure::DropOldest {
                        let excess = queue.len().saturating_sub(inner.config.capacity);
                        if excess > 0 {
                            queue.drain(..excess);
                            inner.dropped.fetch_add(excess as u64, Ordering::Relaxed);
                            warn!(excess, "Requeued batch overflowed outbox, dropped oldest");
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(written)
    }

    pub async fn stats(&self) -> OutboxStats {
        let inner = &self.inner;
        OutboxStats {
            depth: inner.queue.lock().await.len(),
            capacity: inner.config.capacity,
            dropped: inner.dropped.load(Ordering::Relaxed),
            flushed: inner.flushed.load(Ordering::Relaxed),
            failed_flushes: inner.failed_flushes.load(Ordering::Relaxed),
            last_flush_latency_ms: inner
                .last_flush_latency
                .lock()
                .await
                .map(|d| d.as_millis() as u64),
        }
    }

    /// Background flusher. Runs until `close()`, then drains what is left.
    pub fn spawn_flusher(&self) -> JoinHandle<()> {
        let outbox = self.clone();
        tokio::spawn(async move {
            let inner = &outbox.inner;
            let mut ticker = tokio::time::interval(inner.config.flush_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = inner.ready.notified() => {}
                    _ = inner.shutdown.notified() => {}
                }

                if let Err(e) = outbox.flush().await {
                    warn!(error = %e, "Outbox flush failed, batch requeued");
                }

                if inner.closed.load(Ordering::SeqCst) {
                    // Final drain picks up anything pushed while the last flush ran.
                    if let Err(e) = outbox.flush().await {
                        warn!(error = %e, "Final outbox flush failed");
                    }
                    let depth = inner.queue.lock().await.len();
                    if depth > 0 {
                        error!(depth, "Outbox closed with undelivered events");
                    }
                    break;
                }
            }
        })
    }

    /// Stop the flusher after one final drain.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
    }
}
