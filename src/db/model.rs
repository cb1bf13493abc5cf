//! View models and inputs used by repositories.
//!
//! Core entities (`UserSession`, `DeliveryRecord`, `PollCursor`) live in
//! `crate::model`; the structs here only exist to shape admin queries and
//! partial updates.

use crate::model::UserId;

/// A blocked user together with how many delivery rows they still own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedUser {
    pub user_id: UserId,
    pub deliveries: i64,
}

/// Partial settings update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSettings {
    pub poll_interval_secs: Option<i64>,
    pub timezone: Option<String>,
    pub categorization_enabled: Option<bool>,
    pub mark_reviewed_after_categorized: Option<bool>,
    pub poll_pending: Option<bool>,
    pub tagging: Option<bool>,
    pub show_datetime: Option<bool>,
    pub auto_mark_reviewed: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricTotal {
    pub key: String,
    pub value: f64,
}
