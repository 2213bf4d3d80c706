//! Token-bucket rate limiter for Gmail API calls
//!
//! Bounds request throughput independently of the daily quota:
//! - Tokens refill continuously at `refill_rate` per second, computed lazily
//!   on every acquire (no background timer)
//! - Bursting is allowed up to `max_tokens`
//! - `acquire` waits until enough tokens are available; it never rejects,
//!   only the caller's cancellation token can end the wait early

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RateLimitConfig;
use crate::error::{GmailError, Result};
use crate::request::OperationKind;

/// Token bucket shared by every call path. Clones share state.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateBucket>>,
    read_weight: f64,
    write_weight: f64,
}

#[derive(Debug)]
struct RateBucket {
    /// Current available tokens, always within [0, max_tokens]
    tokens: f64,
    max_tokens: f64,
    /// Tokens added per second
    refill_rate: f64,
    last_refill: Instant,
    /// Total tokens consumed (for stats)
    total_consumed: f64,
    /// Total grants (for stats)
    total_operations: u64,
}

impl RateBucket {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn debit(&mut self, tokens: f64) {
        self.tokens = (self.tokens - tokens).max(0.0);
        self.total_consumed += tokens;
        self.total_operations += 1;
    }
}

impl RateLimiter {
    /// Create a limiter with Gmail's per-user defaults:
    /// 250 tokens per second, 500 token burst capacity
    pub fn new() -> Self {
        Self::with_config(250.0, 500.0)
    }

    /// Create a limiter with custom refill rate and burst capacity
    pub fn with_config(refill_rate: f64, max_tokens: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RateBucket {
                tokens: max_tokens, // Start with full bucket
                max_tokens,
                refill_rate,
                last_refill: Instant::now(),
                total_consumed: 0.0,
                total_operations: 0,
            })),
            read_weight: 1.0,
            write_weight: 1.0,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::with_config(config.refill_per_second, config.max_tokens);
        limiter.read_weight = config.read_weight;
        limiter.write_weight = config.write_weight;
        limiter
    }

    /// Tokens a request of the given kind and quota cost draws from the bucket
    pub fn tokens_for(&self, kind: OperationKind, cost_units: u32) -> f64 {
        let weight = match kind {
            OperationKind::Read => self.read_weight,
            OperationKind::Write | OperationKind::Delete => self.write_weight,
        };
        cost_units as f64 * weight
    }

    /// Wait until `tokens` are available, then debit them.
    ///
    /// Requests larger than the bucket wait for a full bucket and drain it.
    /// Returns `RateLimitTimeout` if `cancel` fires while waiting.
    pub async fn acquire(&self, tokens: f64, cancel: &CancellationToken) -> Result<RatePermit> {
        loop {
            let wait_time = {
                let mut bucket = self.inner.lock().await;
                bucket.refill(Instant::now());

                let needed = tokens.min(bucket.max_tokens);
                trace!(
                    "Rate bucket: {:.1}/{:.1} tokens available, requesting {:.1}",
                    bucket.tokens,
                    bucket.max_tokens,
                    needed
                );

                if bucket.tokens >= needed {
                    bucket.debit(needed);
                    debug!("Acquired {:.1} tokens, {:.1} remaining", needed, bucket.tokens);
                    return Ok(RatePermit { tokens: needed });
                }

                let deficit = needed - bucket.tokens;
                Duration::from_secs_f64(deficit / bucket.refill_rate)
            };

            // Wait outside the lock to allow other operations to proceed
            debug!(
                "Rate limit reached, waiting {:.2}s for {:.1} tokens",
                wait_time.as_secs_f64(),
                tokens
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(GmailError::RateLimitTimeout(format!(
                        "cancelled while waiting for {:.1} rate tokens",
                        tokens
                    )));
                }
                _ = tokio::time::sleep(wait_time) => {}
            }
        }
    }

    /// Try to acquire tokens without waiting
    pub async fn try_acquire(&self, tokens: f64) -> Option<RatePermit> {
        let mut bucket = self.inner.lock().await;
        bucket.refill(Instant::now());

        let needed = tokens.min(bucket.max_tokens);
        if bucket.tokens >= needed {
            bucket.debit(needed);
            Some(RatePermit { tokens: needed })
        } else {
            None
        }
    }

    /// Current available tokens after refill, without consuming any
    pub async fn available(&self) -> f64 {
        let mut bucket = self.inner.lock().await;
        bucket.refill(Instant::now());
        bucket.tokens
    }

    pub async fn stats(&self) -> RateStats {
        let bucket = self.inner.lock().await;
        RateStats {
            available_tokens: bucket.tokens,
            max_tokens: bucket.max_tokens,
            refill_rate: bucket.refill_rate,
            total_consumed: bucket.total_consumed,
            total_operations: bucket.total_operations,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Proof that tokens were debited
#[derive(Debug)]
pub struct RatePermit {
    tokens: f64,
}

impl RatePermit {
    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Statistics about bucket usage
#[derive(Debug, Clone)]
pub struct RateStats {
    pub available_tokens: f64,
    pub max_tokens: f64,
    pub refill_rate: f64,
    pub total_consumed: f64,
    pub total_operations: u64,
}
