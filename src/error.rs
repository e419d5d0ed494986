//! Error types surfaced at the rotator boundary

use std::fmt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for rotation, retry, and transport failures.
#[derive(Debug)]
pub enum RotatorError {
    /// No proxy is currently eligible for selection.
    ///
    /// Raised whether the pool is empty, every proxy has expired, or every
    /// circuit breaker is refusing admission. The message distinguishes the
    /// reason for operator diagnosis.
    PoolEmpty { reason: String },
    /// A request failed after exhausting retries, or a rate limit denied it.
    Connection { message: String, source: Option<BoxError> },
    /// The upstream proxy rejected our credentials (401/407).
    Authentication { status: u16, message: String },
    /// An error classified as non-retryable (malformed request, decode
    /// failure, redirect loop).
    NonRetryable { source: BoxError },
    /// The request queue is at capacity; the caller should back off.
    QueueFull { capacity: usize },
    /// A builder or parser rejected its input.
    InvalidConfiguration { message: String },
}

impl RotatorError {
    /// Pool-empty error for the all-breakers-open condition.
    pub(crate) fn all_proxies_failing() -> Self {
        Self::PoolEmpty {
            reason: "503 Service Temporarily Unavailable - All proxies are currently failing. \
                     Please wait for circuit breakers to recover or add new proxies."
                .to_string(),
        }
    }

    /// Pool-empty error when no proxies are configured at all.
    pub(crate) fn no_proxies_configured() -> Self {
        Self::PoolEmpty { reason: "proxy pool is empty - no proxies configured".to_string() }
    }

    /// Pool-empty error when every configured proxy has expired.
    pub(crate) fn all_proxies_expired() -> Self {
        Self::PoolEmpty {
            reason: "proxy pool is empty - all configured proxies have expired".to_string(),
        }
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration { message: message.into() }
    }

    pub(crate) fn connection(message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Connection { message: message.into(), source }
    }

    /// Check if this error means no proxy was available.
    pub fn is_pool_empty(&self) -> bool {
        matches!(self, Self::PoolEmpty { .. })
    }

    /// Check if this error is a connection-class failure.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Check if this error is a proxy authentication failure.
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Check if this error was classified as non-retryable.
    pub fn is_non_retryable(&self) -> bool {
        matches!(self, Self::NonRetryable { .. })
    }

    /// Check if this error is queue backpressure.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, Self::QueueFull { .. })
    }

    /// Check if this error came from config validation.
    pub fn is_invalid_configuration(&self) -> bool {
        matches!(self, Self::InvalidConfiguration { .. })
    }
}

impl fmt::Display for RotatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolEmpty { reason } => write!(f, "{}", reason),
            Self::Connection { message, .. } => write!(f, "{}", message),
            Self::Authentication { status, message } => {
                write!(f, "proxy authentication failed ({}): {}", status, message)
            }
            Self::NonRetryable { source } => write!(f, "non-retryable error: {}", source),
            Self::QueueFull { capacity } => {
                write!(f, "request queue is full (capacity {})", capacity)
            }
            Self::InvalidConfiguration { message } => {
                write!(f, "invalid configuration: {}", message)
            }
        }
    }
}

impl std::error::Error for RotatorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connection { source, .. } => {
                source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
            }
            Self::NonRetryable { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}
