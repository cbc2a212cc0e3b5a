//! Asynchronous logging pipeline
//!
//! The proxy hands records over with [`LoggingPipeline::enqueue`], which never
//! waits. Records sit in a bounded lock-free ring; when it is full the oldest
//! queued record is dropped. Worker tasks drain the ring into a
//! [`TraceSink`], retrying transient failures with capped exponential backoff.

pub mod sink;

use crate::capture::record::CaptureRecord;
use crate::config::PipelineSettings;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use sink::{HttpTraceSink, SinkError, TraceSink, TracingSink};

/// Retry and sizing knobs
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub queue_capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub warn_interval: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from(&crate::config::Settings::default().pipeline)
    }
}

impl From<&PipelineSettings> for PipelineOptions {
    fn from(settings: &PipelineSettings) -> Self {
        Self {
            queue_capacity: settings.queue_capacity.max(1),
            workers: settings.workers.max(1),
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            warn_interval: Duration::from_secs(settings.warn_interval_secs),
        }
    }
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub delivered: u64,
    /// Evicted from a full queue before delivery
    pub dropped: u64,
    /// Individual retry attempts
    pub retried: u64,
    pub failed_permanent: u64,
    /// Gave up after `max_attempts` transient failures
    pub failed_transient: u64,
    pub discarded_at_shutdown: u64,
    pub queued: usize,
}

/// Result of a hand-off
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Accepted, and the oldest queued record was dropped to make room
    DroppedOldest,
    /// The pipeline is shutting down
    Rejected,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    failed_permanent: AtomicU64,
    failed_transient: AtomicU64,
    discarded_at_shutdown: AtomicU64,
}

struct WarnThrottle {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

struct Shared {
    queue: ArrayQueue<Arc<CaptureRecord>>,
    notify: Notify,
    sink: Arc<dyn TraceSink>,
    options: PipelineOptions,
    counters: Counters,
    accepting: AtomicBool,
    draining: AtomicBool,
    throttle: Mutex<WarnThrottle>,
}

pub struct LoggingPipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LoggingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingPipeline")
            .field("sink", &self.shared.sink.name())
            .field("stats", &self.stats())
            .finish()
    }
}

impl LoggingPipeline {
    /// Spawn the workers on the current runtime
    pub fn start(sink: Arc<dyn TraceSink>, options: PipelineOptions) -> Arc<Self> {
        let shared = Arc::new(Shared {
            queue: ArrayQueue::new(options.queue_capacity.max(1)),
            notify: Notify::new(),
            sink,
            throttle: Mutex::new(WarnThrottle {
                interval: options.warn_interval,
                last: None,
                suppressed: 0,
            }),
            options,
            counters: Counters::default(),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
        });

        let workers = (0..shared.options.workers.max(1))
            .map(|worker| {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move { shared.run_worker(worker).await })
            })
            .collect();

        info!(
            sink = shared.sink.name(),
            workers = shared.options.workers,
            queue_capacity = shared.options.queue_capacity,
            "Logging pipeline started"
        );

        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Hand a record to the pipeline without waiting
    pub fn enqueue(&self, record: Arc<CaptureRecord>) -> Enqueued {
        if !self.shared.accepting.load(Ordering::Acquire) {
            debug!(capture_id = %record.id, "Pipeline closed, record not queued");
            return Enqueued::Rejected;
        }

        self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.shared.queue.force_push(record) {
            None => Enqueued::Accepted,
            Some(evicted) => {
                self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.shared.warn_throttled(format_args!(
                    "Logging queue full, dropped oldest record {}",
                    evicted.id
                ));
                Enqueued::DroppedOldest
            }
        };
        self.shared.notify.notify_one();
        outcome
    }

    pub fn stats(&self) -> PipelineStats {
        let counters = &self.shared.counters;
        PipelineStats {
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            retried: counters.retried.load(Ordering::Relaxed),
            failed_permanent: counters.failed_permanent.load(Ordering::Relaxed),
            failed_transient: counters.failed_transient.load(Ordering::Relaxed),
            discarded_at_shutdown: counters.discarded_at_shutdown.load(Ordering::Relaxed),
            queued: self.shared.queue.len(),
        }
    }

    pub fn sink_name(&self) -> &'static str {
        self.shared.sink.name()
    }

    /// Stop intake, drain for at most `grace`, then discard the rest
    pub async fn shutdown(&self, grace: Duration) -> PipelineStats {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.draining.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();

        let mut workers = std::mem::take(&mut *self.workers.lock());
        let deadline = tokio::time::Instant::now() + grace;

        for worker in workers.iter_mut() {
            if tokio::time::timeout_at(deadline, &mut *worker).await.is_err() {
                break;
            }
        }
        for worker in &workers {
            worker.abort();
        }

        let mut discarded = 0u64;
        while self.shared.queue.pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            self.shared
                .counters
                .discarded_at_shutdown
                .fetch_add(discarded, Ordering::Relaxed);
            warn!(
                discarded,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "Logging pipeline did not drain before shutdown, records discarded"
            );
        }

        let stats = self.stats();
        info!(
            delivered = stats.delivered,
            dropped = stats.dropped,
            failed_permanent = stats.failed_permanent,
            failed_transient = stats.failed_transient,
            discarded_at_shutdown = stats.discarded_at_shutdown,
            "Logging pipeline stopped"
        );
        stats
    }
}

impl Shared {
    async fn run_worker(&self, worker: usize) {
        debug!(worker, "Pipeline worker started");
        loop {
            while let Some(record) = self.queue.pop() {
                self.deliver(&record).await;
            }
            if self.draining.load(Ordering::Acquire) {
                break;
            }
            let notified = self.notify.notified();
            // Re-check after registering so a concurrent shutdown is not missed
            if self.draining.load(Ordering::Acquire) || !self.queue.is_empty() {
                continue;
            }
            notified.await;
        }
        debug!(worker, "Pipeline worker stopped");
    }

    async fn deliver(&self, record: &CaptureRecord) {
        let mut backoff = self.options.initial_backoff;
        let mut attempt = 1;

        loop {
            match self.sink.log(record).await {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(SinkError::Transient(reason)) if attempt < self.options.max_attempts => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        capture_id = %record.id,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        %reason,
                        "Transient sink failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.options.max_backoff);
                    attempt += 1;
                }
                Err(SinkError::Transient(reason)) => {
                    self.counters.failed_transient.fetch_add(1, Ordering::Relaxed);
                    self.warn_throttled(format_args!(
                        "Giving up on record {} after {attempt} attempts: {reason}",
                        record.id
                    ));
                    return;
                }
                Err(SinkError::Permanent(reason)) => {
                    self.counters.failed_permanent.fetch_add(1, Ordering::Relaxed);
                    self.warn_throttled(format_args!(
                        "Sink rejected record {}: {reason}",
                        record.id
                    ));
                    return;
                }
            }
        }
    }

    /// At most one warning per interval; the rest are counted
    fn warn_throttled(&self, message: std::fmt::Arguments<'_>) {
        let mut throttle = self.throttle.lock();
        let now = Instant::now();
        let due = throttle
            .last
            .is_none_or(|last| now.duration_since(last) >= throttle.interval);

        if due {
            let suppressed = std::mem::take(&mut throttle.suppressed);
            throttle.last = Some(now);
            drop(throttle);
            warn!(sink = self.sink.name(), suppressed, "{message}");
        } else {
            throttle.suppressed += 1;
        }
    }
}
