//! Domain entities: orders, their reconciliation status, and user accounts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an uploaded order.
///
/// ```text
/// NEW -> PROCESSING -> { PROCESSED, INVALID, TOO_MANY_RETRIES }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
    TooManyRetries,
}

impl OrderStatus {
    /// Terminal statuses never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Processed | Self::Invalid | Self::TooManyRetries
        )
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    ///
    /// Re-asserting PROCESSING is allowed (the accrual service may report it
    /// many times); nothing may go back to NEW or leave a terminal state.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match self {
            Self::New => next != Self::New,
            Self::Processing => next != Self::New,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Invalid => "INVALID",
            Self::TooManyRetries => "TOO_MANY_RETRIES",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a persisted status string is not one of ours.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown order status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for OrderStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(Self::New),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "INVALID" => Ok(Self::Invalid),
            "TOO_MANY_RETRIES" => Ok(Self::TooManyRetries),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A purchase-order number uploaded by a user.
///
/// # Invariants
/// - `accrual > 0` only when `status == Processed`
/// - once `status.is_terminal()`, the order is never mutated again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "number")]
    pub order_id: String,
    #[serde(skip)]
    pub user_id: String,
    pub status: OrderStatus,
    pub accrual: f64,
    #[serde(skip)]
    pub retry_count: u32,
    #[serde(skip)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    /// Create a freshly uploaded order in `NEW` status.
    pub fn new(user_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            user_id: user_id.into(),
            status: OrderStatus::New,
            accrual: 0.0,
            retry_count: 0,
            next_retry_at: None,
            uploaded_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: OrderStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_accrual(mut self, accrual: f64) -> Self {
        self.accrual = accrual;
        self
    }

    pub fn with_uploaded_at(mut self, uploaded_at: DateTime<Utc>) -> Self {
        self.uploaded_at = uploaded_at;
        self
    }
}

/// Per-user points account.
///
/// `balance` is credits minus withdrawals; the withdrawal path keeps it
/// non-negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(skip)]
    pub user_id: String,
    #[serde(rename = "current")]
    pub balance: f64,
    #[serde(rename = "withdrawn")]
    pub withdrawals_total: f64,
}

impl Account {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            balance: 0.0,
            withdrawals_total: 0.0,
        }
    }
}
