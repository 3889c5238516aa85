//! In-process store, used when no database is configured and in tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    check_accrual, check_amount, check_status_update, check_transition, ensure_open, OrderStore,
    StoreError,
};
use crate::model::{Account, Order, OrderStatus};

#[derive(Debug, Default)]
struct Tables {
    orders: HashMap<String, Order>,
    accounts: HashMap<String, Account>,
}

/// Orders and accounts behind one lock.
///
/// Sharing the write guard between the two maps is what makes
/// [`OrderStore::settle_order`] atomic here.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tables {
    fn order_mut(&mut self, order_id: &str) -> Result<&mut Order, StoreError> {
        self.orders
            .get_mut(order_id)
            .ok_or_else(|| StoreError::OrderNotFound(order_id.to_string()))
    }

    fn account_mut(&mut self, user_id: &str) -> Result<&mut Account, StoreError> {
        self.accounts
            .get_mut(user_id)
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn add_account(&self, user_id: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.accounts.contains_key(user_id) {
            return Err(StoreError::AccountExists(user_id.to_string()));
        }
        tables
            .accounts
            .insert(user_id.to_string(), Account::new(user_id));
        Ok(())
    }

    async fn get_account(&self, user_id: &str) -> Result<Account, StoreError> {
        self.tables
            .read()
            .await
            .accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))
    }

    async fn add_order(&self, order: Order) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.orders.contains_key(&order.order_id) {
            return Err(StoreError::OrderExists(order.order_id));
        }
        tables.orders.insert(order.order_id.clone(), order);
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, StoreError> {
        self.tables
            .read()
            .await
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| StoreError::OrderNotFound(order_id.to_string()))
    }

    async fn user_orders(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let tables = self.tables.read().await;
        let mut orders: Vec<Order> = tables
            .orders
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.uploaded_at);
        Ok(orders)
    }

    async fn set_order_status_and_accrual(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: f64,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let order = tables.order_mut(order_id)?;
        check_status_update(order, status, accrual)?;
        order.status = status;
        order.accrual = accrual;
        Ok(())
    }

    async fn set_order_next_retry_at(
        &self,
        order_id: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let order = tables.order_mut(order_id)?;
        ensure_open(order)?;
        order.retry_count += 1;
        order.next_retry_at = Some(next_retry_at);
        Ok(())
    }

    async fn refill_account_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError> {
        check_amount(amount)?;
        let mut tables = self.tables.write().await;
        tables.account_mut(user_id)?.balance += amount;
        Ok(())
    }

    async fn withdraw_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError> {
        check_amount(amount)?;
        let mut tables = self.tables.write().await;
        let account = tables.account_mut(user_id)?;
        if account.balance < amount {
            return Err(StoreError::InsufficientFunds {
                balance: account.balance,
                requested: amount,
            });
        }
        account.balance -= amount;
        account.withdrawals_total += amount;
        Ok(())
    }

    async fn settle_order(&self, order_id: &str, accrual: f64) -> Result<bool, StoreError> {
        check_accrual(accrual)?;
        let mut tables = self.tables.write().await;
        let order = tables.order_mut(order_id)?;
        if order.status.is_terminal() {
            return Ok(false);
        }
        check_transition(order, OrderStatus::Processed)?;
        let user_id = order.user_id.clone();

        // Credit first so a missing account leaves the order untouched.
        if accrual > 0.0 {
            tables.account_mut(&user_id)?.balance += accrual;
        }
        let order = tables.order_mut(order_id)?;
        order.status = OrderStatus::Processed;
        order.accrual = accrual;
        Ok(true)
    }

    async fn unfinished_orders(&self) -> Result<Vec<Order>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect())
    }
}
