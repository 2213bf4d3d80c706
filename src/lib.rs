//! Gmail Access Layer
//!
//! A resilient access layer between mailbox automation and the Gmail API.
//! Every call is served from cache when possible, checked against the daily
//! quota, paced by a token bucket, retried with backoff on transient errors,
//! and (for bulk label changes and deletions) grouped into provider batches.
//!
//! # Overview
//!
//! - **Cache**: TTL response cache for reads, invalidated synchronously by writes
//! - **Rate limiting**: Token bucket with continuous lazy refill
//! - **Quota**: Pessimistic daily quota reservations with rollover and persistence
//! - **Retry**: Exponential backoff with jitter, honouring provider retry-after hints
//! - **Batching**: Size- or time-triggered provider batch calls with per-item outcomes
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use gmail_access::{auth, config::Config, GmailAccessLayer, GmailApiTransport, Operation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml".as_ref()).await?;
//!     let hub = auth::authenticate(&config.auth).await?;
//!
//!     let layer = GmailAccessLayer::new(Arc::new(GmailApiTransport::new(hub)), config).await?;
//!     let labels = layer.call(Operation::ListLabels).await?;
//!     println!("{}", labels);
//!
//!     layer.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`access_layer`] - Façade and builder
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`batch`] - Batch grouping and flush scheduling
//! - [`cache`] - Response cache
//! - [`cli`] - Command-line interface
//! - [`config`] - Configuration management
//! - [`dispatch`] - Per-request state machine
//! - [`error`] - Error types and result aliases
//! - [`mailbox`] - Typed mailbox operations
//! - [`models`] - Parsed mailbox types
//! - [`quota`] - Daily quota tracking
//! - [`rate_limiter`] - Token bucket
//! - [`request`] - Requests, operations and outcomes
//! - [`retry`] - Retry policy and loop
//! - [`transport`] - Transport trait and Gmail API implementation

pub mod access_layer;
pub mod auth;
pub mod batch;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod mailbox;
pub mod models;
pub mod quota;
pub mod rate_limiter;
pub mod request;
pub mod retry;
pub mod transport;

// Re-export commonly used types for convenience
pub use error::{ErrorKind, GmailError, Result};

pub use access_layer::{AccessLayerBuilder, AccessLayerStats, GmailAccessLayer};
pub use batch::{BatchExecutor, BatchStats, BatchTicket};
pub use cache::{CacheStats, CacheStore};
pub use config::Config;
pub use mailbox::Mailbox;
pub use models::{AttachmentInfo, LabelInfo, MessageMetadata};
pub use quota::{QuotaStats, QuotaTracker, QuotaWindow};
pub use rate_limiter::{RateLimiter, RateStats};
pub use request::{
    ensure_all_succeeded, BatchKey, Fingerprint, MessageFormat, Operation, OperationKind, Outcome,
    Request,
};
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{GmailApiTransport, GmailTransport};
