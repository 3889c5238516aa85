//! Accrual reconciliation.
//!
//! Drives every uploaded order from NEW to a terminal status by polling the
//! accrual service, one cycle at a time.
//!
//! # Cycle
//! ```text
//! 1. load order; terminal            -> Finished (no-op)
//! 2. retry_count > max_retries       -> TOO_MANY_RETRIES, Finished
//! 3. query accrual service (rate limited, cancellable)
//! 4. PROCESSED                       -> settle, Finished
//!    INVALID                         -> persist, Finished
//!    REGISTERED | PROCESSING         -> persist PROCESSING
//!    429 (n)                         -> wait n
//!    transport / unexpected          -> wait default interval
//!    settlement failure              -> wait default interval
//! 5. bump retry_count, persist next_retry_at -> RetryAfter(wait)
//! ```
//!
//! Cycles are stepped by the [`Scheduler`]; a cycle never sleeps itself.

mod scheduler;

pub use scheduler::{recover_unfinished, Scheduler, SchedulerHandle};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::accrual::{AccrualClient, AccrualError, AccrualStatus};
use crate::model::{Order, OrderStatus};
use crate::settlement::{self, Settlement};
use crate::store::{OrderStore, StoreError};

/// Upper bound on any single wait between cycles.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Retry ceiling and fallback backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The order gives up once `retry_count` exceeds this.
    pub max_retries: u32,
    /// Wait used when the service gave no explicit delay.
    pub default_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            default_interval: Duration::from_millis(50),
        }
    }
}

/// What the scheduler should do with the order after a cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleOutcome {
    /// Terminal status reached (now or earlier); stop tracking.
    Finished(OrderStatus),
    /// Query again after the delay.
    RetryAfter(Duration),
    /// The order does not exist.
    Missing,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("storage failure during reconciliation: {0}")]
    Store(#[from] StoreError),
}

/// Runs reconciliation cycles against injected store and client.
pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    client: Arc<dyn AccrualClient>,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        client: Arc<dyn AccrualClient>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            client,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one query cycle for `order_id`.
    ///
    /// Cancellation is observed only while waiting on the accrual service;
    /// persistence steps always run to completion once started.
    pub async fn run_cycle(
        &self,
        order_id: &str,
        cancel: &CancellationToken,
    ) -> Result<CycleOutcome, ReconcileError> {
        let order = match self.store.get_order(order_id).await {
            Ok(order) => order,
            Err(StoreError::OrderNotFound(_)) => {
                tracing::warn!(order_id = %order_id, "Order vanished before reconciliation");
                return Ok(CycleOutcome::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        if order.status.is_terminal() {
            tracing::debug!(
                order_id = %order_id,
                status = %order.status,
                "Order already final"
            );
            return Ok(CycleOutcome::Finished(order.status));
        }

        if order.retry_count > self.policy.max_retries {
            tracing::info!(
                order_id = %order_id,
                retry_count = order.retry_count,
                "Accrual retry limit reached"
            );
            return self.finish(&order, OrderStatus::TooManyRetries).await;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReconcileError::Cancelled),
            result = self.client.query(order_id) => result,
        };

        let wait = match result {
            Ok(AccrualStatus::Processed { accrual }) => {
                match settlement::settle(self.store.as_ref(), &order, accrual).await {
                    Ok(Settlement::AlreadySettled) => {
                        let current = self.store.get_order(order_id).await?;
                        return Ok(CycleOutcome::Finished(current.status));
                    }
                    Ok(_) => return Ok(CycleOutcome::Finished(OrderStatus::Processed)),
                    // Counts as a retry so a credit that keeps failing ends
                    // in TOO_MANY_RETRIES instead of re-querying forever.
                    Err(e) => {
                        tracing::error!(
                            order_id = %order_id,
                            retry_count = order.retry_count,
                            accrual = accrual,
                            error = %e,
                            "Settlement failed"
                        );
                        self.policy.default_interval
                    }
                }
            }
            Ok(AccrualStatus::Invalid) => {
                return self.finish(&order, OrderStatus::Invalid).await;
            }
            Ok(AccrualStatus::Registered) | Ok(AccrualStatus::Processing) => {
                if let Some(outcome) = self.mark_processing(&order).await? {
                    return Ok(outcome);
                }
                self.policy.default_interval
            }
            Err(err) => self.backoff_for(&order, &err),
        };

        self.schedule_next(&order, wait).await
    }

    fn backoff_for(&self, order: &Order, err: &AccrualError) -> Duration {
        if let Some(retry_after) = err.retry_after() {
            tracing::info!(
                order_id = %order.order_id,
                retry_count = order.retry_count,
                retry_after_secs = retry_after.as_secs(),
                "Accrual service asked to slow down"
            );
            retry_after
        } else if err.is_unexpected() {
            tracing::error!(
                order_id = %order.order_id,
                retry_count = order.retry_count,
                error = %err,
                "Unexpected accrual response"
            );
            self.policy.default_interval
        } else {
            tracing::warn!(
                order_id = %order.order_id,
                retry_count = order.retry_count,
                error = %err,
                "Accrual query failed"
            );
            self.policy.default_interval
        }
    }

    /// Persist PROCESSING; returns an outcome only if the order turned out final.
    async fn mark_processing(&self, order: &Order) -> Result<Option<CycleOutcome>, ReconcileError> {
        match self
            .store
            .set_order_status_and_accrual(&order.order_id, OrderStatus::Processing, 0.0)
            .await
        {
            Ok(()) => Ok(None),
            Err(StoreError::OrderFinal { status, .. }) => Ok(Some(CycleOutcome::Finished(status))),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish(
        &self,
        order: &Order,
        status: OrderStatus,
    ) -> Result<CycleOutcome, ReconcileError> {
        match self
            .store
            .set_order_status_and_accrual(&order.order_id, status, 0.0)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    order_id = %order.order_id,
                    retry_count = order.retry_count,
                    status = %status,
                    "Order reconciliation finished"
                );
                Ok(CycleOutcome::Finished(status))
            }
            Err(StoreError::OrderFinal { status, .. }) => Ok(CycleOutcome::Finished(status)),
            Err(e) => Err(e.into()),
        }
    }

    async fn schedule_next(
        &self,
        order: &Order,
        wait: Duration,
    ) -> Result<CycleOutcome, ReconcileError> {
        let wait = wait.min(MAX_RETRY_DELAY);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        match self
            .store
            .set_order_next_retry_at(&order.order_id, next_retry_at)
            .await
        {
            Ok(()) => Ok(CycleOutcome::RetryAfter(wait)),
            Err(StoreError::OrderFinal { status, .. }) => Ok(CycleOutcome::Finished(status)),
            Err(e) => Err(e.into()),
        }
    }
}
