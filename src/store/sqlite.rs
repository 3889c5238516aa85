//! SQLite-backed store.
//!
//! One connection behind a mutex; every call runs on the blocking pool so the
//! async runtime never waits on disk I/O.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use super::{
    check_accrual, check_amount, check_status_update, check_transition, ensure_open, OrderStore,
    StoreError,
};
use crate::model::{Account, Order, OrderStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    user_id           TEXT PRIMARY KEY,
    balance           REAL NOT NULL DEFAULT 0,
    withdrawals_total REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS orders (
    order_id      TEXT PRIMARY KEY,
    user_id       TEXT NOT NULL,
    status        TEXT NOT NULL,
    accrual       REAL NOT NULL DEFAULT 0,
    retry_count   INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER,
    uploaded_at   INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user_id, uploaded_at);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status, next_retry_at);
"#;

const ORDER_COLUMNS: &str =
    "order_id, user_id, status, accrual, retry_count, next_retry_at, uploaded_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Backend(format!("connection lock poisoned: {}", e)))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("spawn_blocking failed: {}", e)))?
    }
}

fn timestamp(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_timestamp(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Integer,
            format!("timestamp out of range: {}", millis).into(),
        )
    })
}

fn row_to_order(row: &Row<'_>) -> rusqlite::Result<Order> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<OrderStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let next_retry_at = row
        .get::<_, Option<i64>>(5)?
        .map(|ms| from_timestamp(5, ms))
        .transpose()?;

    Ok(Order {
        order_id: row.get(0)?,
        user_id: row.get(1)?,
        status,
        accrual: row.get(3)?,
        retry_count: row.get(4)?,
        next_retry_at,
        uploaded_at: from_timestamp(6, row.get(6)?)?,
    })
}

fn load_order(conn: &Connection, order_id: &str) -> Result<Order, StoreError> {
    conn.query_row(
        &format!("SELECT {} FROM orders WHERE order_id = ?1", ORDER_COLUMNS),
        params![order_id],
        row_to_order,
    )
    .optional()?
    .ok_or_else(|| StoreError::OrderNotFound(order_id.to_string()))
}

fn load_account(conn: &Connection, user_id: &str) -> Result<Account, StoreError> {
    conn.query_row(
        "SELECT user_id, balance, withdrawals_total FROM accounts WHERE user_id = ?1",
        params![user_id],
        |row| {
            Ok(Account {
                user_id: row.get(0)?,
                balance: row.get(1)?,
                withdrawals_total: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| StoreError::AccountNotFound(user_id.to_string()))
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl OrderStore for SqliteStore {
    async fn add_account(&self, user_id: &str) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO accounts (user_id) VALUES (?1)",
                params![user_id],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::AccountExists(user_id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_account(&self, user_id: &str) -> Result<Account, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| load_account(conn, &user_id)).await
    }

    async fn add_order(&self, order: Order) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT INTO orders ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    ORDER_COLUMNS
                ),
                params![
                    order.order_id,
                    order.user_id,
                    order.status.as_str(),
                    order.accrual,
                    order.retry_count,
                    order.next_retry_at.map(timestamp),
                    timestamp(order.uploaded_at),
                ],
            );
            match inserted {
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => Err(StoreError::OrderExists(order.order_id)),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, StoreError> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| load_order(conn, &order_id)).await
    }

    async fn user_orders(&self, user_id: &str) -> Result<Vec<Order>, StoreError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM orders WHERE user_id = ?1 ORDER BY uploaded_at ASC",
                ORDER_COLUMNS
            ))?;
            let orders = stmt
                .query_map(params![user_id], row_to_order)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(orders)
        })
        .await
    }

    async fn set_order_status_and_accrual(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: f64,
    ) -> Result<(), StoreError> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let order = load_order(&tx, &order_id)?;
            check_status_update(&order, status, accrual)?;
            tx.execute(
                "UPDATE orders SET status = ?2, accrual = ?3 WHERE order_id = ?1",
                params![order_id, status.as_str(), accrual],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_order_next_retry_at(
        &self,
        order_id: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let order = load_order(&tx, &order_id)?;
            ensure_open(&order)?;
            tx.execute(
                "UPDATE orders SET retry_count = retry_count + 1, next_retry_at = ?2 \
                 WHERE order_id = ?1",
                params![order_id, timestamp(next_retry_at)],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn refill_account_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError> {
        check_amount(amount)?;
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn.execute(
                "UPDATE accounts SET balance = balance + ?2 WHERE user_id = ?1",
                params![user_id, amount],
            )?;
            if updated == 0 {
                return Err(StoreError::AccountNotFound(user_id));
            }
            Ok(())
        })
        .await
    }

    async fn withdraw_amount(&self, user_id: &str, amount: f64) -> Result<(), StoreError> {
        check_amount(amount)?;
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let account = load_account(&tx, &user_id)?;
            if account.balance < amount {
                return Err(StoreError::InsufficientFunds {
                    balance: account.balance,
                    requested: amount,
                });
            }
            tx.execute(
                "UPDATE accounts SET balance = balance - ?2, \
                 withdrawals_total = withdrawals_total + ?2 WHERE user_id = ?1",
                params![user_id, amount],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn settle_order(&self, order_id: &str, accrual: f64) -> Result<bool, StoreError> {
        check_accrual(accrual)?;
        let order_id = order_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let order = load_order(&tx, &order_id)?;
            if order.status.is_terminal() {
                return Ok(false);
            }
            check_transition(&order, OrderStatus::Processed)?;

            // Compare-and-swap on status: only a non-terminal row flips.
            let flipped = tx.execute(
                "UPDATE orders SET status = 'PROCESSED', accrual = ?2 \
                 WHERE order_id = ?1 AND status IN ('NEW', 'PROCESSING')",
                params![order_id, accrual],
            )?;
            if flipped == 0 {
                return Ok(false);
            }

            if accrual > 0.0 {
                    let credited = tx.execute(
                    "UPDATE accounts SET balance = balance + ?2 WHERE user_id = ?1",
                    params![order.user_id, accrual],
                )?;
                if credited == 0 {
                    return Err(StoreError::AccountNotFound(order.user_id));
                }
            }

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn unfinished_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM orders WHERE status IN ('NEW', 'PROCESSING') \
                 ORDER BY next_retry_at ASC",
                ORDER_COLUMNS
            ))?;
            let orders = stmt
                .query_map([], row_to_order)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(orders)
        })
        .await
    }
}
