//! Batch grouping for write and delete requests
//!
//! Submissions are grouped by [`BatchKey`]. A group is flushed as one
//! provider call when it reaches `max_size` items or when its oldest item has
//! waited `max_wait`, whichever comes first. The wait-based flush is driven by
//! a single scheduler task that stops on shutdown; the size-based flush runs
//! immediately on the submitting path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::config::BatchConfig;
use crate::dispatch::Dispatcher;
use crate::error::GmailError;
use crate::request::{BatchKey, Outcome, Request};

struct PendingGroup {
    opened_at: Instant,
    items: Vec<(Request, oneshot::Sender<Outcome>)>,
}

struct BatchInner {
    dispatcher: Arc<Dispatcher>,
    groups: Mutex<HashMap<BatchKey, PendingGroup>>,
    wake: Notify,
    /// Stops the scheduler and refuses new submissions
    shutdown: CancellationToken,
    /// Aborts waits inside in-flight flushes
    abort: CancellationToken,
    tracker: TaskTracker,
    max_size: usize,
    max_wait: Duration,
    flushes: AtomicU64,
    items_flushed: AtomicU64,
}

/// Counters for batch activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStats {
    pub flushes: u64,
    pub items_flushed: u64,
    pub pending_items: usize,
}

/// Resolves to the outcome of one submitted request
#[derive(Debug)]
pub struct BatchTicket {
    request: Request,
    receiver: oneshot::Receiver<Outcome>,
}

impl BatchTicket {
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Wait for the request's outcome. A request dropped without being
    /// dispatched resolves to `OperationCancelled`.
    pub async fn wait(self) -> Outcome {
        let BatchTicket { request, receiver } = self;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::failure(
                request,
                GmailError::OperationCancelled("batch executor stopped before dispatch".to_string()),
                0,
            ),
        }
    }
}

impl BatchInner {
    /// Send a group to the transport in the background
    fn spawn_flush(self: &Arc<Self>, key: BatchKey, group: PendingGroup) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            let (requests, senders): (Vec<_>, Vec<_>) = group.items.into_iter().unzip();
            let size = requests.len();
            inner.flushes.fetch_add(1, Ordering::Relaxed);
            inner.items_flushed.fetch_add(size as u64, Ordering::Relaxed);
            debug!(
                "Flushing {} group of {} after {:?}",
                key,
                size,
                group.opened_at.elapsed()
            );

            let outcomes = inner
                .dispatcher
                .dispatch_group(&key, requests, &inner.abort)
                .await;
            for (sender, outcome) in senders.into_iter().zip(outcomes) {
                // Receiver may have been dropped by a caller that stopped waiting
                let _ = sender.send(outcome);
            }
        });
    }

    /// Flush groups whose wait has expired; returns the earliest remaining deadline
    async fn flush_expired(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let expired: Vec<(BatchKey, PendingGroup)> = {
            let mut groups = self.groups.lock().await;
            let keys: Vec<BatchKey> = groups
                .iter()
                .filter(|(_, group)| group.opened_at + self.max_wait <= now)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| groups.remove(&key).map(|group| (key, group)))
                .collect()
        };

        for (key, group) in expired {
            self.spawn_flush(key, group);
        }

        let groups = self.groups.lock().await;
        groups
            .values()
            .map(|group| group.opened_at + self.max_wait)
            .min()
    }

    async fn run_scheduler(self: Arc<Self>) {
        debug!("Batch scheduler started");
        loop {
            let deadline = self.flush_expired().await;
            let until_deadline = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = until_deadline => {}
            }
        }
        debug!("Batch scheduler stopped");
    }
}

/// Groups compatible requests into provider batch calls
pub struct BatchExecutor {
    inner: Arc<BatchInner>,
}

impl BatchExecutor {
    /// Start an executor and its flush scheduler. Must be called inside a
    /// Tokio runtime.
    pub fn new(dispatcher: Arc<Dispatcher>, config: &BatchConfig) -> Self {
        let inner = Arc::new(BatchInner {
            dispatcher,
            groups: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            abort: CancellationToken::new(),
            tracker: TaskTracker::new(),
            max_size: config.max_size.max(1),
            max_wait: config.max_wait(),
            flushes: AtomicU64::new(0),
            items_flushed: AtomicU64::new(0),
        });

        inner.tracker.spawn(Arc::clone(&inner).run_scheduler());
        Self { inner }
    }

    /// Queue a request. Requests without a batch key are dispatched on their own
    /// right away; after shutdown every submission fails with `OperationCancelled`.
    pub async fn submit(&self, request: Request) -> BatchTicket {
        let (sender, receiver) = oneshot::channel();
        let ticket = BatchTicket {
            request: request.clone(),
            receiver,
        };

        let Some(key) = request.operation().batch_key() else {
            if self.inner.shutdown.is_cancelled() {
                let _ = sender.send(Self::rejected(request));
                return ticket;
            }
            let inner = Arc::clone(&self.inner);
            self.inner.tracker.spawn(async move {
                let outcome = inner.dispatcher.execute_single(request, &inner.abort).await;
                let _ = sender.send(outcome);
            });
            return ticket;
        };

        let full_group = {
            let mut groups = self.inner.groups.lock().await;
            if self.inner.shutdown.is_cancelled() {
                let _ = sender.send(Self::rejected(request));
                return ticket;
            }

            let group = groups.entry(key.clone()).or_insert_with(|| PendingGroup {
                opened_at: Instant::now(),
                items: Vec::new(),
            });
            group.items.push((request, sender));

            if group.items.len() >= self.inner.max_size {
                groups.remove(&key)
            } else {
                None
            }
        };

        match full_group {
            Some(group) => self.inner.spawn_flush(key, group),
            None => self.inner.wake.notify_one(),
        }
        ticket
    }

    /// Submit every request and wait for all outcomes, in submission order
    pub async fn submit_all(&self, requests: Vec<Request>) -> Vec<Outcome> {
        let mut tickets = Vec::with_capacity(requests.len());
        for request in requests {
            tickets.push(self.submit(request).await);
        }
        futures::future::join_all(tickets.into_iter().map(BatchTicket::wait)).await
    }

    fn rejected(request: Request) -> Outcome {
        Outcome::failure(
            request,
            GmailError::OperationCancelled("batch executor is shutting down".to_string()),
            0,
        )
    }

    pub async fn stats(&self) -> BatchStats {
        let pending_items = self
            .inner
            .groups
            .lock()
            .await
            .values()
            .map(|group| group.items.len())
            .sum();
        BatchStats {
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            items_flushed: self.inner.items_flushed.load(Ordering::Relaxed),
            pending_items,
        }
    }

    /// Stop the scheduler, flush every pending group, and wait for in-flight
    /// flushes to finish. Later submissions fail with `OperationCancelled`.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let drained: Vec<(BatchKey, PendingGroup)> = {
            let mut groups = self.inner.groups.lock().await;
            groups.drain().collect()
        };
        if !drained.is_empty() {
            info!("Flushing {} pending batch groups on shutdown", drained.len());
        }
        for (key, group) in drained {
            self.inner.spawn_flush(key, group);
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Drop for BatchExecutor {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.abort.cancel();
    }
}
