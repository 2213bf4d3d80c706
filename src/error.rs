use std::time::Duration;

use thiserror::Error;

use crate::request::{OperationKind, Outcome};

/// Type alias for Result with GmailError
pub type Result<T> = std::result::Result<T, GmailError>;

/// How the access layer treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeouts, 5xx, provider rate limiting. Retried locally.
    Transient,
    /// Malformed request, not found, forbidden. Never retried.
    Permanent,
    /// Authorization failed; surfaced for re-authentication, never retried.
    Unauthorized,
    /// Daily quota window is spent. Never retried within the window.
    QuotaExhausted,
    /// Caller abandoned the wait or the layer is shutting down.
    Cancelled,
}

/// Error types for the Gmail access layer
#[derive(Error, Debug, Clone)]
pub enum GmailError {
    /// Gmail API returned an error we could not classify further
    #[error("Gmail API error: {0}")]
    ApiError(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Provider signalled rate limiting, optionally with a retry-after hint in seconds
    #[error("Rate limit exceeded{}", .retry_after.map(|s| format!(", retry after {} seconds", s)).unwrap_or_default())]
    RateLimitExceeded { retry_after: Option<u64> },

    /// Cancelled or timed out while waiting on the rate limiter or quota tracker
    #[error("Rate limit wait abandoned: {0}")]
    RateLimitTimeout(String),

    /// The layer is shutting down and will not dispatch the request
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Network-related error (connection issues, timeouts, etc.)
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Server returned 5xx error
    #[error("Server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Bad request (400)
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Forbidden (403, not quota related)
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Conflict (409), e.g. a label with that name already exists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// Daily quota window is exhausted
    #[error("Quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Some items of a batch failed; carries one outcome per submitted item
    #[error("Batch partially failed: {failed} of {} items failed", .outcomes.len())]
    BatchPartialFailure { failed: usize, outcomes: Vec<Outcome> },

    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    IoError(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<std::io::Error> for GmailError {
    fn from(error: std::io::Error) -> Self {
        GmailError::IoError(error.to_string())
    }
}

impl From<serde_json::Error> for GmailError {
    fn from(error: serde_json::Error) -> Self {
        GmailError::SerializationError(error.to_string())
    }
}

impl GmailError {
    /// Classify the error for retry and propagation decisions
    pub fn kind(&self) -> ErrorKind {
        match self {
            GmailError::RateLimitExceeded { .. }
            | GmailError::ServerError { .. }
            | GmailError::NetworkError(_) => ErrorKind::Transient,
            GmailError::AuthError(_) => ErrorKind::Unauthorized,
            GmailError::QuotaExhausted(_) => ErrorKind::QuotaExhausted,
            GmailError::RateLimitTimeout(_) | GmailError::OperationCancelled(_) => {
                ErrorKind::Cancelled
            }
            _ => ErrorKind::Permanent,
        }
    }

    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Provider-declared delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GmailError::RateLimitExceeded {
                retry_after: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Whether this error on a retried write means an earlier attempt already
    /// took effect remotely (the response to that attempt was lost).
    pub fn is_already_applied(&self, kind: OperationKind) -> bool {
        match (self, kind) {
            (GmailError::Conflict(_), OperationKind::Write) => true,
            (GmailError::NotFound(_), OperationKind::Delete) => true,
            _ => false,
        }
    }
}

/// Parse the Retry-After header from an HTTP response
///
/// The Retry-After header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns `None` when the header is missing, invalid, or names a past date.
fn parse_retry_after_header<B>(response: &hyper::Response<B>) -> Option<u64> {
    let value = response.headers().get("retry-after")?.to_str().ok()?;

    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }

    let http_date = httpdate::parse_http_date(value).ok()?;
    http_date
        .duration_since(std::time::SystemTime::now())
        .ok()
        .map(|d| d.as_secs())
}

/// Map a status code plus optional provider reasons to an error
fn classify_status(status_code: u16, message: String, reasons: &[String]) -> GmailError {
    let has_reason = |wanted: &[&str]| reasons.iter().any(|r| wanted.contains(&r.as_str()));

    match status_code {
        429 => GmailError::RateLimitExceeded { retry_after: None },
        401 => GmailError::AuthError(message),
        403 if has_reason(&["dailyLimitExceeded", "quotaExceeded"]) => {
            GmailError::QuotaExhausted(message)
        }
        403 if has_reason(&["rateLimitExceeded", "userRateLimitExceeded"]) => {
            GmailError::RateLimitExceeded { retry_after: None }
        }
        403 => GmailError::Forbidden(message),
        404 => GmailError::NotFound(message),
        409 => GmailError::Conflict(message),
        400 => GmailError::BadRequest(message),
        500..=599 => GmailError::ServerError {
            status: status_code,
            message,
        },
        _ => GmailError::ApiError(message),
    }
}

/// Classify a Google JSON error body:
/// `{"error": {"code": 403, "message": "...", "errors": [{"reason": "..."}]}}`
pub(crate) fn from_error_body(body: &serde_json::Value) -> GmailError {
    let error = &body["error"];
    let code = error["code"].as_u64().unwrap_or(0) as u16;
    let message = error["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    let reasons: Vec<String> = error["errors"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["reason"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    if code == 0 {
        return GmailError::BadRequest(message);
    }
    classify_status(code, message, &reasons)
}

impl From<google_gmail1::Error> for GmailError {
    fn from(error: google_gmail1::Error) -> Self {
        match error {
            // HTTP response with status code and no parseable body
            google_gmail1::Error::Failure(ref response) => {
                let status = response.status();
                let status_code = status.as_u16();
                let message = format!(
                    "HTTP {}: {}",
                    status_code,
                    status.canonical_reason().unwrap_or("Unknown")
                );

                match classify_status(status_code, message, &[]) {
                    GmailError::RateLimitExceeded { .. } => GmailError::RateLimitExceeded {
                        retry_after: parse_retry_after_header(response),
                    },
                    other => other,
                }
            }
            // Non-success response whose body was a JSON error document
            google_gmail1::Error::BadRequest(ref body) => from_error_body(body),
            google_gmail1::Error::MissingToken(ref err) => {
                GmailError::AuthError(format!("No valid token: {}", err))
            }
            // Network/connection errors - transient
            google_gmail1::Error::HttpError(ref err) => {
                GmailError::NetworkError(format!("Connection error: {}", err))
            }
            google_gmail1::Error::Io(err) => GmailError::NetworkError(err.to_string()),
            google_gmail1::Error::JsonDecodeError(_, ref err) => {
                GmailError::SerializationError(err.to_string())
            }
            _ => GmailError::ApiError(error.to_string()),
        }
    }
}
