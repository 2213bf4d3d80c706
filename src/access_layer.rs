//! Façade used by the orchestration layer
//!
//! All shared state (cache, quota window, rate bucket) is held in explicit
//! handles. [`AccessLayerBuilder`] accepts existing handles so several layers
//! can share one quota window, and so tests can build isolated instances.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::batch::{BatchExecutor, BatchStats, BatchTicket};
use crate::cache::{CacheStats, CacheStore};
use crate::config::{Config, CostConfig};
use crate::dispatch::Dispatcher;
use crate::error::{GmailError, Result};
use crate::quota::{QuotaStats, QuotaTracker};
use crate::rate_limiter::{RateLimiter, RateStats};
use crate::request::{Operation, Outcome, Request};
use crate::retry::RetryPolicy;
use crate::transport::GmailTransport;

/// Point-in-time view of every shared component
#[derive(Debug, Clone)]
pub struct AccessLayerStats {
    pub cache: CacheStats,
    pub quota: QuotaStats,
    pub rate: RateStats,
    pub batch: BatchStats,
}

pub struct AccessLayerBuilder {
    transport: Arc<dyn GmailTransport>,
    config: Config,
    cache: Option<CacheStore>,
    quota: Option<QuotaTracker>,
    limiter: Option<RateLimiter>,
    retry: Option<RetryPolicy>,
}

impl AccessLayerBuilder {
    pub fn new(transport: Arc<dyn GmailTransport>) -> Self {
        Self {
            transport,
            config: Config::default(),
            cache: None,
            quota: None,
            limiter: None,
            retry: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Share an existing cache instead of creating one from config
    pub fn cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Share an existing quota tracker instead of loading one from config
    pub fn quota(mut self, quota: QuotaTracker) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Share an existing rate limiter instead of creating one from config
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Validate the configuration and start the layer. Must be called inside a
    /// Tokio runtime; loads the persisted quota window when one is configured.
    pub async fn build(self) -> Result<GmailAccessLayer> {
        self.config.validate()?;
        let config = self.config;

        let cache = self
            .cache
            .unwrap_or_else(|| CacheStore::new(config.cache.capacity));
        let quota = match self.quota {
            Some(quota) => quota,
            None => QuotaTracker::load(&config.quota).await?,
        };
        let limiter = self
            .limiter
            .unwrap_or_else(|| RateLimiter::from_config(&config.rate_limit));
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::from_config(&config.retry));

        let dispatcher = Arc::new(Dispatcher::new(
            self.transport,
            cache,
            config.cache.clone(),
            quota,
            limiter,
            retry,
            config.rate_limit.acquire_timeout(),
        ));
        let batcher = BatchExecutor::new(Arc::clone(&dispatcher), &config.batch);

        info!(
            "Gmail access layer ready (daily ceiling {} units, batch size {})",
            config.quota.daily_ceiling, config.batch.max_size
        );

        Ok(GmailAccessLayer {
            dispatcher,
            batcher,
            costs: config.costs,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }
}

/// Resilient entry point for every Gmail call
pub struct GmailAccessLayer {
    dispatcher: Arc<Dispatcher>,
    batcher: BatchExecutor,
    costs: CostConfig,
    /// Never cancelled; used when the caller supplies no token
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl GmailAccessLayer {
    /// Build a layer with fresh shared state from `config`
    pub async fn new(transport: Arc<dyn GmailTransport>, config: Config) -> Result<Self> {
        AccessLayerBuilder::new(transport).config(config).build().await
    }

    pub fn builder(transport: Arc<dyn GmailTransport>) -> AccessLayerBuilder {
        AccessLayerBuilder::new(transport)
    }

    /// Wrap an operation in a request costed from the configured cost table
    pub fn request(&self, operation: Operation) -> Request {
        let cost = self.costs.units_for(&operation);
        Request::new(operation, cost)
    }

    /// Execute one request directly
    pub async fn execute(&self, request: Request) -> Outcome {
        self.execute_with_cancel(request, &self.cancel).await
    }

    /// Execute one request; `cancel` abandons quota and rate-limit waits and
    /// retry backoff
    pub async fn execute_with_cancel(&self, request: Request, cancel: &CancellationToken) -> Outcome {
        if self.closed.load(Ordering::Acquire) {
            return Outcome::failure(
                request,
                GmailError::OperationCancelled("access layer is shut down".to_string()),
                0,
            );
        }

        self.dispatcher.execute_single(request, cancel).await
    }

    /// Convenience for `execute(request(operation))` returning the response body
    pub async fn call(&self, operation: Operation) -> Result<serde_json::Value> {
        self.execute(self.request(operation)).await.into_result()
    }

    /// Queue one request for batching
    pub async fn submit(&self, request: Request) -> BatchTicket {
        self.batcher.submit(request).await
    }

    /// Dispatch many requests, batching the compatible ones.
    ///
    /// Returns exactly one outcome per request, in submission order.
    pub async fn submit_batch(&self, requests: Vec<Request>) -> Vec<Outcome> {
        self.batcher.submit_all(requests).await
    }

    pub fn cache(&self) -> &CacheStore {
        self.dispatcher.cache()
    }

    pub fn quota(&self) -> &QuotaTracker {
        self.dispatcher.quota()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        self.dispatcher.limiter()
    }

    pub async fn stats(&self) -> AccessLayerStats {
        AccessLayerStats {
            cache: self.cache().stats().await,
            quota: self.quota().stats().await,
            rate: self.rate_limiter().stats().await,
            batch: self.batcher.stats().await,
        }
    }

    /// Flush pending batches, wait for in-flight work, and refuse new requests
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.batcher.shutdown().await;
        info!("Gmail access layer shut down");
    }
}
