//! Transaction notification engine: polls a finance provider per user,
//! announces new transactions over Telegram and keeps sent messages current.

pub mod accounts;
pub mod categorize;
pub mod categorizer;
pub mod channel;
pub mod config;
pub mod db;
pub mod diff;
pub mod model;
pub mod notifier;
pub mod provider;
pub mod render;
pub mod retry;
pub mod scheduler;
