//! Bounded buffer of recent captures with live fan-out
//!
//! Inserts, evictions and subscriber notification happen under one short
//! lock, so every subscriber sees records in insertion order, exactly once,
//! starting right after it subscribed. Each subscriber has a bounded queue; a
//! subscriber that lets it fill up has its feed closed instead of pinning
//! records in memory.

use super::record::{CaptureId, CaptureRecord};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Records a live subscriber may have outstanding before its feed is closed
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Statistics about buffer usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub len: usize,
    pub total_inserted: u64,
    pub evicted: u64,
    pub subscribers: usize,
}

/// A live feed of records inserted after subscription
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<Arc<CaptureRecord>>,
}

impl Subscription {
    /// Next record; `None` once the buffer is gone or this feed fell behind
    pub async fn recv(&mut self) -> Option<Arc<CaptureRecord>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<CaptureRecord>> {
        self.receiver.try_recv().ok()
    }
}

struct Inner {
    records: VecDeque<Arc<CaptureRecord>>,
    subscribers: Vec<mpsc::Sender<Arc<CaptureRecord>>>,
}

pub struct CaptureBuffer {
    capacity: usize,
    subscriber_queue: usize,
    inner: Mutex<Inner>,
    total_inserted: AtomicU64,
    evicted: AtomicU64,
}

impl std::fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("stats", &self.stats())
            .finish()
    }
}

impl CaptureBuffer {
    /// `capacity` of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        Self::with_subscriber_queue(capacity, SUBSCRIBER_QUEUE)
    }

    /// Like [`CaptureBuffer::new`] with a custom per-subscriber queue length
    pub fn with_subscriber_queue(capacity: usize, subscriber_queue: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            subscriber_queue: subscriber_queue.max(1),
            inner: Mutex::new(Inner {
                records: VecDeque::with_capacity(capacity),
                subscribers: Vec::new(),
            }),
            total_inserted: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Append a record, evicting the oldest when full
    pub fn insert(&self, record: Arc<CaptureRecord>) {
        let mut inner = self.inner.lock();

        if inner.records.len() == self.capacity {
            inner.records.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        inner.records.push_back(Arc::clone(&record));
        self.total_inserted.fetch_add(1, Ordering::Relaxed);

        inner
            .subscribers
            .retain(|subscriber| match subscriber.try_send(Arc::clone(&record)) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(capture_id = %record.id, "Live subscriber fell behind, closing its feed");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
    }

    /// Current contents, oldest first
    pub fn snapshot(&self) -> Vec<Arc<CaptureRecord>> {
        self.inner.lock().records.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.subscriber_queue);
        self.inner.lock().subscribers.push(sender);
        Subscription { receiver }
    }

    /// Backlog and live feed taken atomically: no gap, no duplicate
    pub fn subscribe_with_snapshot(&self) -> (Vec<Arc<CaptureRecord>>, Subscription) {
        let (sender, receiver) = mpsc::channel(self.subscriber_queue);
        let mut inner = self.inner.lock();
        let backlog = inner.records.iter().cloned().collect();
        inner.subscribers.push(sender);
        (backlog, Subscription { receiver })
    }

    pub fn get(&self, id: &CaptureId) -> Option<Arc<CaptureRecord>> {
        self.inner
            .lock()
            .records
            .iter()
            .rev()
            .find(|record| &record.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            capacity: self.capacity,
            len: inner.records.len(),
            total_inserted: self.total_inserted.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            subscribers: inner.subscribers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::record::PendingCapture;
    use proptest::prelude::*;

    fn record(path: &str) -> Arc<CaptureRecord> {
        Arc::new(PendingCapture::new("openai", "POST", path, "h", "http://h").finish(None, None))
    }

    fn paths(records: &[Arc<CaptureRecord>]) -> Vec<String> {
        records.iter().map(|r| r.path.clone()).collect()
    }

    #[test]
    fn test_eviction_keeps_most_recent() {
        let buffer = CaptureBuffer::new(2);
        buffer.insert(record("/a"));
        buffer.insert(record("/b"));
        buffer.insert(record("/c"));

        assert_eq!(paths(&buffer.snapshot()), vec!["/b", "/c"]);
        let stats = buffer.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.total_inserted, 3);
    }

    #[test]
    fn test_subscriber_sees_only_later_records() {
        let buffer = CaptureBuffer::new(10);
        buffer.insert(record("/before"));
        let mut subscription = buffer.subscribe();
        buffer.insert(record("/after-1"));
        buffer.insert(record("/after-2"));

        assert_eq!(subscription.try_recv().unwrap().path, "/after-1");
        assert_eq!(subscription.try_recv().unwrap().path, "/after-2");
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_eviction_does_not_notify() {
        let buffer = CaptureBuffer::new(1);
        let mut subscription = buffer.subscribe();
        buffer.insert(record("/a"));
        buffer.insert(record("/b"));

        assert_eq!(subscription.try_recv().unwrap().path, "/a");
        assert_eq!(subscription.try_recv().unwrap().path, "/b");
        assert!(subscription.try_recv().is_none());
    }

    #[test]
    fn test_snapshot_and_subscription_have_no_gap() {
        let buffer = CaptureBuffer::new(10);
        buffer.insert(record("/1"));
        let (backlog, mut subscription) = buffer.subscribe_with_snapshot();
        buffer.insert(record("/2"));

        assert_eq!(paths(&backlog), vec!["/1"]);
        assert_eq!(subscription.try_recv().unwrap().path, "/2");
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let buffer = CaptureBuffer::new(10);
        let subscription = buffer.subscribe();
        let _kept = buffer.subscribe();
        drop(subscription);

        buffer.insert(record("/x"));
        assert_eq!(buffer.stats().subscribers, 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_feed_is_closed() {
        let buffer = CaptureBuffer::with_subscriber_queue(10, 2);
        let mut lagging = buffer.subscribe();
        for i in 0..5 {
            buffer.insert(record(&format!("/{i}")));
        }

        assert_eq!(buffer.stats().subscribers, 0);
        // Queued records are still delivered, then the feed ends
        assert_eq!(lagging.recv().await.unwrap().path, "/0");
        assert_eq!(lagging.recv().await.unwrap().path, "/1");
        assert!(lagging.recv().await.is_none());

        // Fresh subscribers are unaffected
        let mut fresh = buffer.subscribe();
        buffer.insert(record("/5"));
        assert_eq!(fresh.try_recv().unwrap().path, "/5");
    }

    #[test]
    fn test_get_by_id() {
        let buffer = CaptureBuffer::new(10);
        let target = record("/target");
        buffer.insert(record("/other"));
        buffer.insert(Arc::clone(&target));

        assert_eq!(buffer.get(&target.id).unwrap().path, "/target");
        assert!(buffer.get(&CaptureId::generate()).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_reach_subscriber_once() {
        let buffer = Arc::new(CaptureBuffer::with_subscriber_queue(1000, 1000));
        let mut subscription = buffer.subscribe();

        let tasks: Vec<_> = (0..8)
            .map(|task| {
                let buffer = Arc::clone(&buffer);
                tokio::spawn(async move {
                    for i in 0..50 {
                        buffer.insert(record(&format!("/{task}/{i}")));
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let mut received = Vec::new();
        while let Some(record) = subscription.try_recv() {
            received.push(record.id);
        }

        // Subscriber order equals buffer order
        let snapshot_ids: Vec<_> = buffer.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(received.len(), 400);
        assert_eq!(received, snapshot_ids);
    }

    proptest! {
        #[test]
        fn prop_size_never_exceeds_capacity(capacity in 1usize..16, inserts in 0usize..64) {
            let buffer = CaptureBuffer::new(capacity);
            for i in 0..inserts {
                buffer.insert(record(&format!("/{i}")));
                prop_assert!(buffer.len() <= capacity);
            }

            let expected: Vec<String> = (inserts.saturating_sub(capacity)..inserts)
                .map(|i| format!("/{i}"))
                .collect();
            prop_assert_eq!(paths(&buffer.snapshot()), expected);
        }
    }
}
