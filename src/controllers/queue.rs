//! Deduplicating reconciliation queue
//!
//! Watch events, periodic requeues and sibling changes all funnel into
//! [`ReconciliationQueue::request_reconciliation`]. A key is queued at most
//! once; a request arriving while the key's pass runs is remembered and
//! yields exactly one more pass after it. Passes for one key never overlap,
//! passes for different keys run concurrently.

use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::metrics;

#[derive(Clone, Copy, Debug, Default)]
struct EntryState {
    queued: bool,
    active: bool,
}

/// Queue of keys waiting for a reconciliation pass
pub struct ReconciliationQueue<K>
where
    K: Eq + Hash + Clone,
{
    entries: DashMap<K, EntryState>,
    tx: mpsc::UnboundedSender<K>,
}

/// Receiving half of the queue, driven by [`QueueConsumer::run`]
pub struct QueueConsumer<K> {
    rx: mpsc::UnboundedReceiver<K>,
}

impl<K> ReconciliationQueue<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    pub fn new() -> (Arc<Self>, QueueConsumer<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            entries: DashMap::new(),
            tx,
        });
        (queue, QueueConsumer { rx })
    }

    /// Request a pass for `key`.
    ///
    /// Returns false when the key was already waiting, in which case the
    /// request is coalesced into the pending one.
    pub fn request_reconciliation(&self, key: K) -> bool {
        let mut entry = self.entries.entry(key.clone()).or_default();
        if entry.queued {
            return false;
        }
        entry.queued = true;
        if !entry.active {
            // Unbounded send only fails once the consumer is gone
            let _ = self.tx.send(key);
        }
        drop(entry);
        self.update_depth();
        true
    }

    /// Drop all state for `key`; a queued request is discarded.
    ///
    /// A running pass keeps its entry until it completes, so a request for a
    /// recreated object with the same key waits for it.
    pub fn forget(&self, key: &K) {
        let removed = self.entries.remove_if(key, |_, e| !e.active).is_some();
        if !removed {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.queued = false;
            }
        }
        self.update_depth();
    }

    /// Keys waiting for a pass
    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| e.queued).count()
    }

    /// Whether a pass for `key` is running
    pub fn is_active(&self, key: &K) -> bool {
        self.entries.get(key).map_or(false, |e| e.active)
    }

    /// Mark a dequeued key as running. False if it was forgotten meanwhile.
    fn begin(&self, key: &K) -> bool {
        let started = match self.entries.get_mut(key) {
            Some(mut entry) if entry.queued && !entry.active => {
                entry.queued = false;
                entry.active = true;
                true
            }
            _ => false,
        };
        self.update_depth();
        started
    }

    /// Mark a pass finished and re-admit the key if it was requested meanwhile
    fn complete(&self, key: &K) {
        let requeue = match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.active = false;
                if entry.queued {
                    let _ = self.tx.send(key.clone());
                }
                entry.queued
            }
            None => false,
        };
        if !requeue {
            self.entries.remove_if(key, |_, e| !e.queued && !e.active);
        }
    }

    fn update_depth(&self) {
        metrics::QUEUE_DEPTH.set(self.pending() as f64);
    }
}

impl<K> QueueConsumer<K>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
{
    /// Drain the queue every `poll_interval` until `shutdown` fires.
    ///
    /// Each pass runs on its own task; an error or panic in one pass is
    /// logged and never stops the consumer.
    pub async fn run<F, Fut>(
        mut self,
        queue: Arc<ReconciliationQueue<K>>,
        poll_interval: Duration,
        shutdown: CancellationToken,
        process: F,
    ) where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        info!(poll_interval_ms = poll_interval.as_millis() as u64, "Reconciliation queue started");
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            while let Ok(key) = self.rx.try_recv() {
                if !queue.begin(&key) {
                    debug!(key = %key, "Skipping forgotten key");
                    continue;
                }

                let pass = tokio::spawn(process(key.clone()));
                let queue = queue.clone();
                tokio::spawn(async move {
                    match pass.await {
                        Ok(Ok(())) => debug!(key = %key, "Reconciliation pass finished"),
                        Ok(Err(e)) => error!(key = %key, error = %e, "Reconciliation pass failed"),
                        Err(e) => error!(key = %key, error = %e, "Reconciliation pass panicked"),
                    }
                    queue.complete(&key);
                });
            }
        }

        info!("Reconciliation queue stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_duplicate_request_is_coalesced() {
        let (queue, mut consumer) = ReconciliationQueue::<String>::new();
        assert!(queue.request_reconciliation("orders".to_string()));
        assert!(!queue.request_reconciliation("orders".to_string()));
        assert_eq!(queue.pending(), 1);

        assert_eq!(consumer.rx.try_recv().unwrap(), "orders");
        assert!(consumer.rx.try_recv().is_err());
    }

    #[test]
    fn test_request_during_pass_readmits_once() {
        let (queue, mut consumer) = ReconciliationQueue::<String>::new();
        let key = "orders".to_string();
        queue.request_reconciliation(key.clone());
        let dequeued = consumer.rx.try_recv().unwrap();
        assert!(queue.begin(&dequeued));
        assert!(queue.is_active(&key));

        // Accepted while running, coalesced afterwards, and not sent yet
        assert!(queue.request_reconciliation(key.clone()));
        assert!(!queue.request_reconciliation(key.clone()));
        assert!(consumer.rx.try_recv().is_err());

        queue.complete(&key);
        assert_eq!(consumer.rx.try_recv().unwrap(), key);
        assert!(consumer.rx.try_recv().is_err());

        assert!(queue.begin(&key));
        queue.complete(&key);
        assert_eq!(queue.pending(), 0);
        assert!(!queue.is_active(&key));
    }

    #[test]
    fn test_forgotten_key_is_skipped() {
        let (queue, mut consumer) = ReconciliationQueue::<String>::new();
        queue.request_reconciliation("orders".to_string());
        queue.forget(&"orders".to_string());
        let dequeued = consumer.rx.try_recv().unwrap();
        assert!(!queue.begin(&dequeued));
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_forget_during_pass_keeps_passes_sequential() {
        let (queue, mut consumer) = ReconciliationQueue::<String>::new();
        let key = "orders".to_string();
        queue.request_reconciliation(key.clone());
        let first = consumer.rx.try_recv().unwrap();
        assert!(queue.begin(&first));

        // Deleted and recreated while the first pass runs
        queue.forget(&key);
        assert!(queue.is_active(&key));
        assert!(queue.request_reconciliation(key.clone()));
        assert!(consumer.rx.try_recv().is_err());

        queue.complete(&key);
        let second = consumer.rx.try_recv().unwrap();
        assert!(queue.begin(&second));
        assert!(queue.is_active(&key));

        // A late request during the second pass is still held back
        assert!(queue.request_reconciliation(key.clone()));
        assert!(consumer.rx.try_recv().is_err());
        queue.complete(&key);
        assert_eq!(consumer.rx.try_recv().unwrap(), key);
    }

    #[test]
    fn test_forget_during_pass_discards_pending_request() {
        let (queue, mut consumer) = ReconciliationQueue::<String>::new();
        let key = "orders".to_string();
        queue.request_reconciliation(key.clone());
        assert!(queue.begin(&consumer.rx.try_recv().unwrap()));
        queue.request_reconciliation(key.clone());

        queue.forget(&key);
        assert_eq!(queue.pending(), 0);
        queue.complete(&key);
        assert!(consumer.rx.try_recv().is_err());
        assert!(!queue.is_active(&key));
    }

    #[tokio::test]
    async fn test_failing_pass_does_not_stop_consumer() {
        let (queue, consumer) = ReconciliationQueue::<String>::new();
        let shutdown = CancellationToken::new();
        let passes = Arc::new(AtomicUsize::new(0));

        let counter = passes.clone();
        let handle = tokio::spawn(consumer.run(
            queue.clone(),
            Duration::from_millis(10),
            shutdown.clone(),
            move |key: String| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if key == "broken" {
                        return Err(Error::validation("bad spec"));
                    }
                    Ok(())
                }
            },
        ));

        queue.request_reconciliation("broken".to_string());
        queue.request_reconciliation("orders".to_string());

        for _ in 0..100 {
            if passes.load(Ordering::SeqCst) == 2 && queue.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(passes.load(Ordering::SeqCst), 2);

        // The consumer is still alive and serves new requests
        queue.request_reconciliation("broken".to_string());
        for _ in 0..100 {
            if passes.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(passes.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
