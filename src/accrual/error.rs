//! Query outcomes that are not an accrual status.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Delay used when a 429 carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Longest `Retry-After` we honour; larger hints are capped.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60 * 60);

/// Errors from a single accrual query.
///
/// All of them are retryable from the reconciliation loop's point of view;
/// they differ in how long to wait and how loudly to log.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccrualError {
    /// No HTTP response was received.
    #[error("accrual transport error: {0}")]
    Transport(String),

    /// HTTP 429; the service asked us to come back later.
    #[error("too many requests, retry after {}s", retry_after.as_secs())]
    TooManyRequests { retry_after: Duration },

    #[error("unexpected accrual http status: {0}")]
    UnexpectedStatus(u16),

    #[error("unknown accrual status: {0}")]
    UnknownStatus(String),

    #[error("malformed accrual response: {0}")]
    MalformedBody(String),
}

impl AccrualError {
    /// Server-requested delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TooManyRequests { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// The service answered, but not with anything we understand.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedStatus(_) | Self::UnknownStatus(_) | Self::MalformedBody(_)
        )
    }

    /// Classify a non-200 HTTP status.
    pub fn from_status(status: StatusCode, retry_after: Option<&str>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Self::TooManyRequests {
                retry_after: parse_retry_after(retry_after),
            }
        } else {
            Self::UnexpectedStatus(status.as_u16())
        }
    }
}

impl From<reqwest::Error> for AccrualError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Parse a `Retry-After` value given in whole seconds.
///
/// Missing or unparseable hints fall back to [`DEFAULT_RETRY_AFTER`];
/// anything above [`MAX_RETRY_AFTER`] is capped.
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}
