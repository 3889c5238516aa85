//! Crediting a user once their order's accrual is final.

use crate::model::Order;
use crate::store::{OrderStore, StoreError};

/// Result of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Settlement {
    /// This call moved the order to PROCESSED and credited `amount`.
    Credited { amount: f64 },
    /// The order reached PROCESSED with nothing to credit.
    NothingToCredit,
    /// The order was already terminal; nothing changed.
    AlreadySettled,
}

/// Finalize `order` as PROCESSED and credit its owner `amount` points.
///
/// Safe to call repeatedly or concurrently for the same order: the store
/// flips the status and applies the credit as one unit, and only the call
/// that performs the flip credits.
pub async fn settle(
    store: &dyn OrderStore,
    order: &Order,
    amount: f64,
) -> Result<Settlement, StoreError> {
    if !store.settle_order(&order.order_id, amount).await? {
        tracing::debug!(order_id = %order.order_id, "Order already settled");
        return Ok(Settlement::AlreadySettled);
    }

    if amount > 0.0 {
        tracing::info!(
            order_id = %order.order_id,
            user_id = %order.user_id,
            accrual = amount,
            "Accrual credited"
        );
        Ok(Settlement::Credited { amount })
    } else {
        tracing::warn!(order_id = %order.order_id, "Order processed with zero accrual");
        Ok(Settlement::NothingToCredit)
    }
}
