//! Retry decisions and the explicit retry loop
//!
//! [`RetryPolicy::next_delay`] is a pure decision: given the error from the
//! last attempt and how many attempts have been made, either wait and retry
//! or give up. [`run_with_retry`] drives an operation through that decision
//! with cancellable sleeps and reports how many attempts it took.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{ErrorKind, GmailError, Result};

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale computed delays by a random factor in [0.5, 1.5)
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Backoff before retry number `attempt` (1 for the first retry), without the
    /// attempt cap: `base * 2^(attempt-1) * jitter`, capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let mut delay = self.base_delay.as_secs_f64() * f64::from(1u32 << exponent);
        if self.jitter {
            delay *= rand::thread_rng().gen_range(0.5..1.5);
        }
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    /// Decide whether to retry after `attempts` failed attempts ending in `error`.
    ///
    /// Only transient errors are retried. A provider retry-after hint replaces
    /// the computed delay.
    pub fn next_delay(&self, error: &GmailError, attempts: u32) -> RetryDecision {
        if error.kind() != ErrorKind::Transient || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        match error.retry_after() {
            Some(hint) => RetryDecision::RetryAfter(hint),
            None => RetryDecision::RetryAfter(self.backoff(attempts)),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the policy gives up.
///
/// Returns the final result together with the number of attempts made.
/// Consecutive computed delays never shrink. `cancel` interrupts a pending
/// backoff sleep, which surfaces as `OperationCancelled`.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> (Result<T>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut previous_delay = Duration::ZERO;

    loop {
        attempts += 1;
        let error = match operation(attempts).await {
            Ok(value) => {
                if attempts > 1 {
                    debug!("{} succeeded after {} attempts", operation_name, attempts);
                }
                return (Ok(value), attempts);
            }
            Err(e) => e,
        };

        let delay = match policy.next_delay(&error, attempts) {
            RetryDecision::GiveUp => {
                if error.is_transient() {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation_name, attempts, error
                    );
                } else {
                    debug!("{} failed permanently: {}", operation_name, error);
                }
                return (Err(error), attempts);
            }
            RetryDecision::RetryAfter(delay) if error.retry_after().is_some() => delay,
            RetryDecision::RetryAfter(delay) => delay.max(previous_delay),
        };
        previous_delay = delay;

        warn!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            operation_name, attempts, policy.max_attempts, delay, error
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return (
                    Err(GmailError::OperationCancelled(format!(
                        "{} cancelled during retry backoff",
                        operation_name
                    ))),
                    attempts,
                );
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
