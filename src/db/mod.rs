//! Database module: view models and SQL repositories.
//!
//! - `model`: admin view models and partial-update inputs.
//! - `repo`: SQL-only functions over sessions, deliveries, cursors and metrics.
//!
//! Callers import from `tx_watchbot::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{BlockedUser, MetricTotal, SessionSettings};
