//! Loyalty-points accrual engine.
//!
//! Users upload purchase-order numbers; an external accrual service decides
//! how many points each order earns. This crate polls that service for every
//! uploaded order until it reaches a terminal status and credits the owner's
//! account exactly once.
//!
//! # Modules
//! - [`accrual`]: one rate-limited query to the accrual service
//! - [`ratelimit`]: shared permit issuing across all orders
//! - [`reconcile`]: per-order state machine and the worker pool driving it
//! - [`settlement`]: at-most-once crediting
//! - [`store`]: order and account persistence (in-memory, SQLite)
//! - [`intake`]: upload-time trigger
//! - [`shutdown`]: termination signals for the binary

pub mod accrual;
pub mod config;
pub mod intake;
pub mod model;
pub mod ratelimit;
pub mod reconcile;
pub mod settlement;
pub mod shutdown;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
