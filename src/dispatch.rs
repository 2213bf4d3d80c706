//! Per-request state machine shared by the façade and the batch engine
//!
//! ```text
//! Received -> CacheCheck -> CacheHit -> Done
//!                        -> CacheMiss -> QuotaCheck -> Exhausted -> Failed
//!                                                   -> Granted -> RateWait -> Dispatch
//! Dispatch -> Success -> CacheUpdate -> Done
//!          -> TransientError -> RetryWait -> RateWait -> Dispatch
//!          -> PermanentError -> Failed
//! ```
//!
//! Every path resolves to exactly one [`Outcome`] per request.

use futures::future::join_all;
use lru::LruCache;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::CacheConfig;
use crate::error::{GmailError, Result};
use crate::quota::QuotaTracker;
use crate::rate_limiter::RateLimiter;
use crate::request::{BatchKey, Outcome, Request};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::transport::GmailTransport;

const COMPLETED_KEYS_CAPACITY: usize = 4096;

/// Shared handles every dispatch path goes through
pub struct Dispatcher {
    transport: Arc<dyn GmailTransport>,
    cache: CacheStore,
    cache_config: CacheConfig,
    quota: QuotaTracker,
    limiter: RateLimiter,
    retry: RetryPolicy,
    /// Upper bound on a single quota or rate-limit wait
    wait_timeout: Option<Duration>,
    idempotency: Mutex<IdempotencyLog>,
}

/// Idempotency keys that completed or are being dispatched right now
struct IdempotencyLog {
    completed: LruCache<String, Value>,
    in_flight: HashMap<String, Arc<Notify>>,
}

enum Claim<'a> {
    /// An earlier request with this key already succeeded
    Recorded(Value),
    Owned(KeyClaim<'a>),
}

/// Exclusive hold on an idempotency key. Dropping it records the result
/// if one was set and wakes every request waiting on the key.
struct KeyClaim<'a> {
    dispatcher: &'a Dispatcher,
    key: String,
    result: Option<Value>,
}

impl KeyClaim<'_> {
    fn complete(&mut self, outcome: &Outcome) {
        self.result = outcome.value().cloned();
    }
}

impl Drop for KeyClaim<'_> {
    fn drop(&mut self) {
        let waiters = {
            let mut log = self.dispatcher.idempotency_log();
            if let Some(value) = self.result.take() {
                log.completed.put(self.key.clone(), value);
            }
            log.in_flight.remove(&self.key)
        };
        if let Some(waiters) = waiters {
            waiters.notify_waiters();
        }
    }
}

fn batch_method(key: &BatchKey) -> &'static str {
    match key {
        BatchKey::Modify { .. } => "messages.batchModify",
        BatchKey::Delete => "messages.batchDelete",
        BatchKey::Trash => "messages.trash",
    }
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn GmailTransport>,
        cache: CacheStore,
        cache_config: CacheConfig,
        quota: QuotaTracker,
        limiter: RateLimiter,
        retry: RetryPolicy,
        wait_timeout: Option<Duration>,
    ) -> Self {
        let capacity = NonZeroUsize::new(COMPLETED_KEYS_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            transport,
            cache,
            cache_config,
            quota,
            limiter,
            retry,
            wait_timeout,
            idempotency: Mutex::new(IdempotencyLog {
                completed: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Apply the configured wait timeout to a quota or rate-limit wait
    async fn bounded<T, F>(&self, what: &str, wait: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.wait_timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
                Err(GmailError::RateLimitTimeout(format!(
                    "{} did not complete within {:?}",
                    what, limit
                )))
            }),
            None => wait.await,
        }
    }

    async fn reserve(&self, units: u64, cancel: &CancellationToken) -> Result<()> {
        self.bounded("quota reservation", self.quota.reserve(units, cancel))
            .await
    }

    async fn acquire_tokens(&self, tokens: f64, cancel: &CancellationToken) -> Result<()> {
        self.bounded("rate limiter wait", self.limiter.acquire(tokens, cancel))
            .await
            .map(|_| ())
    }

    async fn cached_response(&self, request: &Request) -> Option<Value> {
        if !self.cache_config.enabled || !request.kind().is_read() {
            return None;
        }
        self.cache_config.ttl_for(request.operation())?;
        self.cache.get(&request.fingerprint()).await
    }

    fn idempotency_log(&self) -> std::sync::MutexGuard<'_, IdempotencyLog> {
        self.idempotency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check and claim a key in one step. A key held by another request
    /// yields the handle its holder notifies on release.
    fn try_claim(&self, key: &str) -> std::result::Result<Claim<'_>, Arc<Notify>> {
        let mut log = self.idempotency_log();
        if let Some(value) = log.completed.get(key) {
            return Ok(Claim::Recorded(value.clone()));
        }
        if let Some(waiters) = log.in_flight.get(key) {
            return Err(Arc::clone(waiters));
        }
        log.in_flight.insert(key.to_string(), Arc::new(Notify::new()));
        Ok(Claim::Owned(KeyClaim {
            dispatcher: self,
            key: key.to_string(),
            result: None,
        }))
    }

    /// Claim a key, waiting out any request that currently holds it. Once
    /// the holder finishes, its recorded result answers this request; if it
    /// failed, this request takes the key and dispatches itself.
    async fn claim(&self, key: &str, cancel: &CancellationToken) -> Result<Claim<'_>> {
        loop {
            let waiters = match self.try_claim(key) {
                Ok(settled) => return Ok(settled),
                Err(waiters) => waiters,
            };

            let notified = waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let still_held = self
                .idempotency_log()
                .in_flight
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &waiters));
            if !still_held {
                continue;
            }

            debug!("Waiting for in-flight request with idempotency key {}", key);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GmailError::OperationCancelled(format!(
                        "cancelled while waiting on idempotency key {}",
                        key
                    )));
                }
                _ = notified => {}
            }
        }
    }

    /// Bring the cache in line with a successful response. Writes drop every
    /// entry touching their resource before the caller sees success. Reads are
    /// stored only if no such write landed after `dispatched_at`.
    async fn update_cache(&self, request: &Request, value: &Value, dispatched_at: u64) {
        if request.kind().is_read() {
            if !self.cache_config.enabled {
                return;
            }
            if let Some(ttl) = self.cache_config.ttl_for(request.operation()) {
                self.cache
                    .put_if_current(
                        dispatched_at,
                        request.fingerprint(),
                        request.resource(),
                        value.clone(),
                        ttl,
                    )
                    .await;
            }
        } else {
            self.cache.invalidate(&request.resource()).await;
        }
    }

    async fn commit(&self, units: u64, method: &str) {
        if let Err(e) = self.quota.commit(units, method).await {
            warn!("Failed to persist quota window: {}", e);
        }
    }

    /// Settle quota for a failed dispatch
    async fn settle_failure(&self, units: u64, method: &str, error: &GmailError) {
        self.quota.record_error().await;
        if matches!(error, GmailError::QuotaExhausted(_)) {
            self.commit(units, method).await;
            self.quota.mark_exhausted(units).await;
        } else {
            self.quota.rollback(units).await;
        }
    }

    /// Run one request through the full state machine
    pub async fn execute_single(&self, request: Request, cancel: &CancellationToken) -> Outcome {
        if let Some(value) = self.cached_response(&request).await {
            debug!("Serving {} from cache", request.method());
            return Outcome::cached(request, value);
        }

        let Some(key) = request.idempotency_key().map(str::to_string) else {
            return self.dispatch_single(request, cancel).await;
        };

        let mut claim = match self.claim(&key, cancel).await {
            Ok(Claim::Owned(claim)) => claim,
            Ok(Claim::Recorded(value)) => {
                debug!(
                    "{} with idempotency key already completed, skipping dispatch",
                    request.method()
                );
                return Outcome::success(request, value, 0);
            }
            Err(e) => return Outcome::failure(request, e, 0),
        };

        let outcome = self.dispatch_single(request, cancel).await;
        claim.complete(&outcome);
        outcome
    }

    /// Reserve, rate-limit and send one request with retries. Callers own
    /// the cache check and any idempotency key.
    async fn dispatch_single(&self, request: Request, cancel: &CancellationToken) -> Outcome {
        let units = u64::from(request.cost());
        if let Err(e) = self.reserve(units, cancel).await {
            return Outcome::failure(request, e, 0);
        }

        let dispatched_at = self.cache.generation().await;
        let tokens = self.limiter.tokens_for(request.kind(), request.cost());
        let (result, attempts) = run_with_retry(&self.retry, cancel, request.method(), |attempt| {
            let request = &request;
            async move {
                self.acquire_tokens(tokens, cancel).await?;
                match self.transport.call(request.operation()).await {
                    Err(e)
                        if attempt > 1
                            && request.idempotency_key().is_some()
                            && e.is_already_applied(request.kind()) =>
                    {
                        info!(
                            "{} already applied by an earlier attempt: {}",
                            request.method(),
                            e
                        );
                        Ok(json!({ "alreadyApplied": true }))
                    }
                    other => other,
                }
            }
        })
        .await;

        match result {
            Ok(value) => {
                self.update_cache(&request, &value, dispatched_at).await;
                self.commit(units, request.method()).await;
                Outcome::success(request, value, attempts)
            }
            Err(e) => {
                self.settle_failure(units, request.method(), &e).await;
                Outcome::failure(request, e, attempts)
            }
        }
    }

    /// Dispatch a compatible group as one provider batch call.
    ///
    /// The group is quota-reserved and rate-limited as the sum of its items.
    /// A transient failure of the whole call retries the group as a unit;
    /// transient per-item failures are resubmitted individually. Returns one
    /// outcome per request, in submission order.
    pub async fn dispatch_group(
        &self,
        key: &BatchKey,
        requests: Vec<Request>,
        cancel: &CancellationToken,
    ) -> Vec<Outcome> {
        let mut outcomes: Vec<Option<Outcome>> = Vec::with_capacity(requests.len());
        let mut pending: Vec<(usize, Request)> = Vec::new();
        let mut claims: HashMap<usize, KeyClaim<'_>> = HashMap::new();
        // Keys held elsewhere go through the single path once the group is done
        let mut deferred: Vec<(usize, Request)> = Vec::new();

        for (index, request) in requests.into_iter().enumerate() {
            outcomes.push(None);
            let Some(idempotency_key) = request.idempotency_key() else {
                pending.push((index, request));
                continue;
            };
            match self.try_claim(idempotency_key) {
                Ok(Claim::Recorded(value)) => {
                    outcomes[index] = Some(Outcome::success(request, value, 0))
                }
                Ok(Claim::Owned(claim)) => {
                    claims.insert(index, claim);
                    pending.push((index, request));
                }
                Err(_) => deferred.push((index, request)),
            }
        }

        if !pending.is_empty() {
            for (index, outcome) in self.dispatch_pending(key, pending, cancel).await {
                if let Some(claim) = claims.get_mut(&index) {
                    claim.complete(&outcome);
                }
                outcomes[index] = Some(outcome);
            }
        }
        drop(claims);

        let retried = join_all(deferred.into_iter().map(|(index, request)| async move {
            (index, self.execute_single(request, cancel).await)
        }))
        .await;
        for (index, outcome) in retried {
            outcomes[index] = Some(outcome);
        }

        outcomes.into_iter().flatten().collect()
    }

    async fn dispatch_pending(
        &self,
        key: &BatchKey,
        pending: Vec<(usize, Request)>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, Outcome)> {
        let method = batch_method(key);
        let total_units: u64 = pending.iter().map(|(_, r)| u64::from(r.cost())).sum();
        let total_tokens: f64 = pending
            .iter()
            .map(|(_, r)| self.limiter.tokens_for(r.kind(), r.cost()))
            .sum();

        if let Err(e) = self.reserve(total_units, cancel).await {
            return pending
                .into_iter()
                .map(|(index, request)| (index, Outcome::failure(request, e.clone(), 0)))
                .collect();
        }

        let dispatched_at = self.cache.generation().await;
        let operations: Vec<_> = pending.iter().map(|(_, r)| r.operation().clone()).collect();
        info!("Dispatching {} batch of {} items", key, operations.len());

        let (result, attempts) = run_with_retry(&self.retry, cancel, method, |_| {
            let operations = &operations;
            async move {
                self.acquire_tokens(total_tokens, cancel).await?;
                let results = self.transport.call_batch(key, operations).await?;
                if results.len() != operations.len() {
                    return Err(GmailError::ApiError(format!(
                        "batch returned {} results for {} items",
                        results.len(),
                        operations.len()
                    )));
                }
                Ok(results)
            }
        })
        .await;

        let results = match result {
            Ok(results) => results,
            Err(e) => {
                warn!("{} batch of {} items failed: {}", key, pending.len(), e);
                self.settle_failure(total_units, method, &e).await;
                return pending
                    .into_iter()
                    .map(|(index, request)| (index, Outcome::failure(request, e.clone(), attempts)))
                    .collect();
            }
        };

        let mut resolved = Vec::with_capacity(pending.len());
        let mut resubmit = Vec::new();

        for ((index, request), item) in pending.into_iter().zip(results) {
            let units = u64::from(request.cost());
            let item = match item {
                Err(e)
                    if attempts > 1
                        && request.idempotency_key().is_some()
                        && e.is_already_applied(request.kind()) =>
                {
                    Ok(json!({ "alreadyApplied": true }))
                }
                other => other,
            };

            match item {
                Ok(value) => {
                    self.update_cache(&request, &value, dispatched_at).await;
                    self.commit(units, request.method()).await;
                    resolved.push((index, Outcome::success(request, value, attempts)));
                }
                Err(e) if e.is_transient() => {
                    self.quota.rollback(units).await;
                    resubmit.push((index, request));
                }
                Err(e) => {
                    self.settle_failure(units, request.method(), &e).await;
                    resolved.push((index, Outcome::failure(request, e, attempts)));
                }
            }
        }

        if !resubmit.is_empty() {
            debug!(
                "Resubmitting {} failed items of {} batch individually",
                resubmit.len(),
                key
            );
            let retried = join_all(resubmit.into_iter().map(|(index, request)| async move {
                let mut outcome = self.dispatch_single(request, cancel).await;
                outcome.attempts += attempts;
                (index, outcome)
            }))
            .await;
            resolved.extend(retried);
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Operation;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replays scripted single-call results, then succeeds
    #[derive(Default)]
    struct Scripted {
        singles: StdMutex<VecDeque<Result<Value>>>,
        batches: StdMutex<VecDeque<Result<Vec<Result<Value>>>>>,
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl GmailTransport for Scripted {
        async fn call(&self, operation: &Operation) -> Result<Value> {
            self.calls.lock().unwrap().push(operation.method().to_string());
            self.singles
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(json!({ "ok": true })))
        }

        async fn call_batch(&self, key: &BatchKey, operations: &[Operation]) -> Result<Vec<Result<Value>>> {
            self.calls.lock().unwrap().push(format!("batch:{}", key));
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(operations.iter().map(|_| Ok(json!({}))).collect()))
        }
    }

    fn dispatcher(transport: Arc<Scripted>) -> Dispatcher {
        Dispatcher::new(
            transport,
            CacheStore::new(64),
            CacheConfig::default(),
            QuotaTracker::new(10_000),
            RateLimiter::with_config(1000.0, 1000.0),
            RetryPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
                jitter: false,
            },
            None,
        )
    }

    fn trash(id: &str) -> Request {
        Request::with_default_cost(Operation::TrashMessage { id: id.to_string() })
    }

    fn delete(id: &str) -> Request {
        Request::with_default_cost(Operation::DeleteMessage { id: id.to_string() })
    }

    fn server_error() -> GmailError {
        GmailError::ServerError {
            status: 500,
            message: "backend".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_rolls_back_then_commits_once() {
        let transport = Arc::new(Scripted::default());
        transport.singles.lock().unwrap().push_back(Err(server_error()));
        let dispatcher = dispatcher(Arc::clone(&transport));

        let outcome = dispatcher.execute_single(trash("m1"), &CancellationToken::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 2);

        let stats = dispatcher.quota().stats().await;
        assert_eq!(stats.consumed, 5);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_releases_reservation() {
        let transport = Arc::new(Scripted::default());
        transport
            .singles
            .lock()
            .unwrap()
            .push_back(Err(GmailError::BadRequest("bad id".to_string())));
        let dispatcher = dispatcher(Arc::clone(&transport));

        let outcome = dispatcher.execute_single(trash("m1"), &CancellationToken::new()).await;
        assert!(matches!(outcome.error(), Some(GmailError::BadRequest(_))));
        assert_eq!(outcome.attempts, 1);

        let stats = dispatcher.quota().stats().await;
        assert_eq!(stats.consumed, 0);
        assert_eq!(stats.reserved, 0);
        assert_eq!(stats.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_applied_on_retry_counts_as_success() {
        let transport = Arc::new(Scripted::default());
        {
            let mut singles = transport.singles.lock().unwrap();
            singles.push_back(Err(GmailError::NetworkError("reset".to_string())));
            singles.push_back(Err(GmailError::NotFound("gone".to_string())));
        }
        let dispatcher = dispatcher(Arc::clone(&transport));

        let request = trash("m1").with_idempotency_key("trash-m1");
        let outcome = dispatcher.execute_single(request, &CancellationToken::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.value(), Some(&json!({ "alreadyApplied": true })));

        // Same key again is answered without reaching the transport
        let again = dispatcher
            .execute_single(trash("m1").with_idempotency_key("trash-m1"), &CancellationToken::new())
            .await;
        assert!(again.is_success());
        assert_eq!(again.attempts, 0);
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_provider_quota_exhaustion_marks_window() {
        let transport = Arc::new(Scripted::default());
        transport
            .singles
            .lock()
            .unwrap()
            .push_back(Err(GmailError::QuotaExhausted("daily limit".to_string())));
        let dispatcher = dispatcher(Arc::clone(&transport));

        let outcome = dispatcher.execute_single(trash("m1"), &CancellationToken::new()).await;
        assert!(matches!(outcome.error(), Some(GmailError::QuotaExhausted(_))));

        let next = dispatcher.execute_single(trash("m2"), &CancellationToken::new()).await;
        assert!(matches!(next.error(), Some(GmailError::QuotaExhausted(_))));
        assert_eq!(next.attempts, 0);
        assert_eq!(transport.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_partial_failure_resubmits_transient_items() {
        let transport = Arc::new(Scripted::default());
        transport.batches.lock().unwrap().push_back(Ok(vec![
            Ok(json!({})),
            Err(server_error()),
            Err(GmailError::Forbidden("not yours".to_string())),
        ]));
        let dispatcher = dispatcher(Arc::clone(&transport));

        let requests = vec![trash("a"), trash("b"), trash("c")];
        let outcomes = dispatcher
            .dispatch_group(&BatchKey::Trash, requests, &CancellationToken::new())
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_success());
        assert!(outcomes[1].is_success());
        assert_eq!(outcomes[1].attempts, 2);
        assert!(matches!(outcomes[2].error(), Some(GmailError::Forbidden(_))));
        assert_eq!(
            *transport.calls.lock().unwrap(),
            vec!["batch:trash".to_string(), "messages.trash".to_string()]
        );

        let stats = dispatcher.quota().stats().await;
        assert_eq!(stats.consumed, 10);
        assert_eq!(stats.reserved, 0);
    }

    #[tokio::test]
    async fn test_group_duplicate_key_dispatched_once() {
        let transport = Arc::new(Scripted::default());
        let dispatcher = dispatcher(Arc::clone(&transport));

        let requests = vec![
            trash("a").with_idempotency_key("trash:a"),
            trash("a").with_idempotency_key("trash:a"),
        ];
        let outcomes = dispatcher
            .dispatch_group(&BatchKey::Trash, requests, &CancellationToken::new())
            .await;

        assert!(outcomes.iter().all(|o| o.is_success()));
        assert_eq!(outcomes[1].attempts, 0);
        assert_eq!(*transport.calls.lock().unwrap(), vec!["batch:trash".to_string()]);
        assert_eq!(dispatcher.quota().stats().await.consumed, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_group_transient_failure_retries_whole_batch() {
        let transport = Arc::new(Scripted::default());
        transport.batches.lock().unwrap().push_back(Err(server_error()));
        let dispatcher = dispatcher(Arc::clone(&transport));

        let outcomes = dispatcher
            .dispatch_group(&BatchKey::Delete, vec![delete("a"), delete("b")], &CancellationToken::new())
            .await;

        assert!(outcomes.iter().all(|o| o.is_success() && o.attempts == 2));
        assert_eq!(transport.calls.lock().unwrap().len(), 2);
    }
}
