//! Accrual service client.
//!
//! One call to [`AccrualClient::query`] is one outbound request. Retrying is
//! the reconciliation loop's business, never the client's.

mod client;
mod error;

pub use client::HttpAccrualClient;
pub use error::{AccrualError, DEFAULT_RETRY_AFTER, MAX_RETRY_AFTER, parse_retry_after};

use async_trait::async_trait;
use serde::Deserialize;

/// Order status as reported by the accrual service.
#[derive(Debug, Clone, PartialEq)]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed { accrual: f64 },
}

/// Outcome of a single accrual query.
pub type AccrualResult = Result<AccrualStatus, AccrualError>;

/// Body of `GET /api/orders/{number}` on success.
#[derive(Debug, Clone, Deserialize)]
pub struct AccrualResponse {
    pub order: String,
    pub status: String,
    #[serde(default)]
    pub accrual: Option<f64>,
}

impl AccrualResponse {
    /// Map the wire status onto [`AccrualStatus`].
    ///
    /// A PROCESSED body without `accrual` is treated as zero points.
    pub fn into_status(self) -> AccrualResult {
        match self.status.as_str() {
            "REGISTERED" => Ok(AccrualStatus::Registered),
            "PROCESSING" => Ok(AccrualStatus::Processing),
            "INVALID" => Ok(AccrualStatus::Invalid),
            "PROCESSED" => Ok(AccrualStatus::Processed {
                accrual: self.accrual.unwrap_or(0.0),
            }),
            _ => Err(AccrualError::UnknownStatus(self.status)),
        }
    }
}

/// Queries the external accrual service for one order.
#[async_trait]
pub trait AccrualClient: Send + Sync {
    async fn query(&self, order_id: &str) -> AccrualResult;
}
