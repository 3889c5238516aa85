//! Durable order and account state.
//!
//! The reconciliation engine only sees [`OrderStore`]; the HTTP layer that
//! owns users and sessions writes through the same trait.
//!
//! # Guarantees every implementation provides
//! - single-key atomicity for order updates and balance changes
//! - terminal orders are never mutated ([`StoreError::OrderFinal`])
//! - [`OrderStore::settle_order`] applies the PROCESSED transition and the
//!   credit as one unit, and credits at most once per order

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Account, Order, OrderStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("order {0} already exists")]
    OrderExists(String),

    #[error("order {order_id} is already {status}")]
    OrderFinal {
        order_id: String,
        status: OrderStatus,
    },

    #[error("order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("account for user {0} not found")]
    AccountNotFound(String),

    #[error("account for user {0} already exists")]
    AccountExists(String),

    #[error("invalid amount {0}: must be positive")]
    InvalidAmount(f64),

    #[error("insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: f64, requested: f64 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Order and account persistence.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn add_account(&self, user_id: &str) -> Result<(), StoreError>;

    async fn get_account(&self, user_id: &str) -> Result<Account, StoreError>;

    /// Record a freshly uploaded order.
    async fn add_order(&self, order: Order) -> Result<(), StoreError>;

    async fn get_order(&self, order_id: &str) -> Result<Order, StoreError>;

    /// All orders of a user, oldest upload first.
    async fn user_orders(&self, user_id: &str) -> Result<Vec<Order>, StoreError>;

    /// Persist a non-settling status change (PROCESSING, INVALID, TOO_MANY_RETRIES).
    async fn set_order_status_and_accrual(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: f64,
    ) -> Result<(), StoreError>;

    /// Record when the order is next eligible for a query and bump its retry count.
    async fn set_order_next_retry_at(
        &self,
        order_id: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn refill_account_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError>;

    async fn withdraw_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError>;

    /// Move the order to PROCESSED with `accrual` and credit its owner, atomically.
    ///
    /// Returns `Ok(false)` without touching anything when the order is already
    /// terminal, which makes repeated or concurrent calls safe.
    async fn settle_order(&self, order_id: &str, accrual: f64) -> Result<bool, StoreError>;

    /// Orders still waiting for a terminal status.
    async fn unfinished_orders(&self) -> Result<Vec<Order>, StoreError>;
}

fn check_transition(order: &Order, to: OrderStatus) -> Result<(), StoreError> {
    ensure_open(order)?;
    if !order.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            order_id: order.order_id.clone(),
            from: order.status,
            to,
        });
    }
    Ok(())
}

/// Checks for [`OrderStore::set_order_status_and_accrual`].
///
/// PROCESSED is reachable only through [`OrderStore::settle_order`], and only
/// PROCESSED orders may carry points.
fn check_status_update(order: &Order, to: OrderStatus, accrual: f64) -> Result<(), StoreError> {
    if to == OrderStatus::Processed {
        return Err(StoreError::InvalidTransition {
            order_id: order.order_id.clone(),
            from: order.status,
            to,
        });
    }
    if accrual != 0.0 {
        return Err(StoreError::InvalidAmount(accrual));
    }
    check_transition(order, to)
}

fn ensure_open(order: &Order) -> Result<(), StoreError> {
    if order.status.is_terminal() {
        return Err(StoreError::OrderFinal {
            order_id: order.order_id.clone(),
            status: order.status,
        });
    }
    Ok(())
}

/// Settled points may be zero but never negative or non-finite.
fn check_accrual(accrual: f64) -> Result<(), StoreError> {
    if accrual >= 0.0 && accrual.is_finite() {
        Ok(())
    } else {
        Err(StoreError::InvalidAmount(accrual))
    }
}

fn check_amount(amount: f64) -> Result<(), StoreError> {
    if amount > 0.0 && amount.is_finite() {
        Ok(())
    } else {
        Err(StoreError::InvalidAmount(amount))
    }
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour shared by every store implementation.

    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;

    pub async fn orders_round_trip(store: &dyn OrderStore) {
        let older = Order::new("u1", "12345678903").with_uploaded_at(Utc::now() - Duration::hours(1));
        let newer = Order::new("u1", "92345678905");
        store.add_order(newer.clone()).await.unwrap();
        store.add_order(older.clone()).await.unwrap();
        store.add_order(Order::new("u2", "4561261212345467")).await.unwrap();

        let got = store.get_order("92345678905").await.unwrap();
        assert_eq!(got.user_id, "u1");
        assert_eq!(got.status, OrderStatus::New);

        let orders = store.user_orders("u1").await.unwrap();
        let ids: Vec<_> = orders.iter().map(|o| o.order_id.as_str()).collect();
        assert_eq!(ids, vec!["12345678903", "92345678905"]);

        assert!(matches!(
            store.add_order(Order::new("u2", "92345678905")).await,
            Err(StoreError::OrderExists(_))
        ));
        assert!(matches!(
            store.get_order("0").await,
            Err(StoreError::OrderNotFound(_))
        ));
    }

    pub async fn retry_bookkeeping(store: &dyn OrderStore) {
        store.add_order(Order::new("u1", "1")).await.unwrap();
        let at = Utc::now() + Duration::seconds(60);
        store.set_order_next_retry_at("1", at).await.unwrap();
        store.set_order_next_retry_at("1", at).await.unwrap();

        let order = store.get_order("1").await.unwrap();
        assert_eq!(order.retry_count, 2);
        assert_eq!(
            order.next_retry_at.map(|t| t.timestamp_millis()),
            Some(at.timestamp_millis())
        );
    }

    pub async fn terminal_orders_are_frozen(store: &dyn OrderStore) {
        store.add_account("u1").await.unwrap();
        store.add_order(Order::new("u1", "1")).await.unwrap();
        store
            .set_order_status_and_accrual("1", OrderStatus::Processing, 0.0)
            .await
            .unwrap();
        store
            .set_order_status_and_accrual("1", OrderStatus::Invalid, 0.0)
            .await
            .unwrap();

        assert!(matches!(
            store
                .set_order_status_and_accrual("1", OrderStatus::Processing, 0.0)
                .await,
            Err(StoreError::OrderFinal { .. })
        ));
        assert!(!store.settle_order("1", 10.0).await.unwrap());
        assert!(store
            .set_order_next_retry_at("1", Utc::now())
            .await
            .is_err());

        let order = store.get_order("1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Invalid);
        assert_eq!(order.accrual, 0.0);
        assert_eq!(store.get_account("u1").await.unwrap().balance, 0.0);
    }

    pub async fn no_regression_to_new(store: &dyn OrderStore) {
        store.add_order(Order::new("u1", "1")).await.unwrap();
        store
            .set_order_status_and_accrual("1", OrderStatus::Processing, 0.0)
            .await
            .unwrap();
        assert!(matches!(
            store
                .set_order_status_and_accrual("1", OrderStatus::New, 0.0)
                .await,
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(
            store.get_order("1").await.unwrap().status,
            OrderStatus::Processing
        );
    }

    pub async fn settle_credits_once(store: Arc<dyn OrderStore>) {
        store.add_account("u1").await.unwrap();
        store.add_order(Order::new("u1", "92345678905")).await.unwrap();

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.settle_order("92345678905", 50.0).await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.settle_order("92345678905", 50.0).await })
        };
        let credited = [a.await.unwrap().unwrap(), b.await.unwrap().unwrap()];
        assert_eq!(credited.iter().filter(|c| **c).count(), 1);

        assert!(!store.settle_order("92345678905", 50.0).await.unwrap());

        let order = store.get_order("92345678905").await.unwrap();
        assert_eq!(order.status, OrderStatus::Processed);
        assert_eq!(order.accrual, 50.0);
        assert_eq!(store.get_account("u1").await.unwrap().balance, 50.0);
    }

    pub async fn concurrent_credits_for_one_user(store: Arc<dyn OrderStore>) {
        store.add_account("u1").await.unwrap();
        let handles: Vec<_> = (0..20)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let id = format!("order-{}", i);
                    store.add_order(Order::new("u1", id.clone())).await.unwrap();
                    store.settle_order(&id, 1.5).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(store.get_account("u1").await.unwrap().balance, 30.0);
    }

    pub async fn settle_rolls_back_without_account(store: &dyn OrderStore) {
        store.add_order(Order::new("ghost", "1")).await.unwrap();
        assert!(matches!(
            store.settle_order("1", 10.0).await,
            Err(StoreError::AccountNotFound(_))
        ));
        let order = store.get_order("1").await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.accrual, 0.0);
    }

    pub async fn zero_settlement_skips_credit(store: &dyn OrderStore) {
        store.add_account("u1").await.unwrap();
        store.add_order(Order::new("u1", "1")).await.unwrap();
        assert!(store.settle_order("1", 0.0).await.unwrap());
        assert_eq!(
            store.get_order("1").await.unwrap().status,
            OrderStatus::Processed
        );
        assert_eq!(store.get_account("u1").await.unwrap().balance, 0.0);
    }

    pub async fn settle_rejects_bad_amounts(store: &dyn OrderStore) {
        store.add_account("u1").await.unwrap();
        store.add_order(Order::new("u1", "1")).await.unwrap();
        for bad in [-10.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                store.settle_order("1", bad).await,
                Err(StoreError::InvalidAmount(_))
            ));
        }
        let order = store.get_order("1").await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.accrual, 0.0);
        assert_eq!(store.get_account("u1").await.unwrap().balance, 0.0);
    }

    pub async fn withdrawals(store: &dyn OrderStore) {
        store.add_account("u1").await.unwrap();
        assert!(matches!(
            store.add_account("u1").await,
            Err(StoreError::AccountExists(_))
        ));
        store.refill_account_amount("u1", 100.0).await.unwrap();
        store.withdraw_amount("u1", 40.0).await.unwrap();
        assert!(matches!(
            store.withdraw_amount("u1", 61.0).await,
            Err(StoreError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            store.refill_account_amount("u1", 0.0).await,
            Err(StoreError::InvalidAmount(_))
        ));

        let account = store.get_account("u1").await.unwrap();
        assert_eq!(account.balance, 60.0);
        assert_eq!(account.withdrawals_total, 40.0);
        assert!(matches!(
            store.refill_account_amount("nobody", 1.0).await,
            Err(StoreError::AccountNotFound(_))
        ));
    }

    pub async fn unfinished_orders(store: &dyn OrderStore) {
        store.add_account("u1").await.unwrap();
        for id in ["a", "b", "c", "d"] {
            store.add_order(Order::new("u1", id)).await.unwrap();
        }
        store
            .set_order_status_and_accrual("b", OrderStatus::Processing, 0.0)
            .await
            .unwrap();
        store
            .set_order_status_and_accrual("c", OrderStatus::TooManyRetries, 0.0)
            .await
            .unwrap();
        store.settle_order("d", 5.0).await.unwrap();

        let mut ids: Vec<_> = store
            .unfinished_orders()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
