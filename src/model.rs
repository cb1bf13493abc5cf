use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub type UserId = i64;
pub type ExternalTxId = i64;
pub type AccountId = i64;
pub type CategoryId = i64;
pub type MessageId = i32;

/// Whether the scheduler may poll and deliver for a user.
///
/// `Expired` and `Blocked` are only ever left through an external
/// re-authorization (see the admin binary).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthStatus {
    Active,
    Expired,
    Blocked,
}

impl AuthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthStatus::Active => "active",
            AuthStatus::Expired => "expired",
            AuthStatus::Blocked => "blocked",
        }
    }

    pub fn parse_status(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AuthStatus::Active),
            "expired" => Some(AuthStatus::Expired),
            "blocked" => Some(AuthStatus::Blocked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeliveryLifecycle {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryLifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryLifecycle::Pending => "pending",
            DeliveryLifecycle::Delivered => "delivered",
            DeliveryLifecycle::Failed => "failed",
        }
    }

    pub fn parse_lifecycle(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(DeliveryLifecycle::Pending),
            "delivered" => Some(DeliveryLifecycle::Delivered),
            "failed" => Some(DeliveryLifecycle::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserSession {
    pub user_id: UserId,
    pub provider_token: String,
    pub auth_status: AuthStatus,
    pub poll_interval_secs: i64,
    pub timezone: String,
    pub ignored_account_ids: HashSet<AccountId>,
    pub categorization_enabled: bool,
    pub mark_reviewed_after_categorized: bool,
    pub poll_pending: bool,
    pub tagging: bool,
    pub show_datetime: bool,
    /// Mark posted transactions as reviewed on the provider before announcing them.
    pub auto_mark_reviewed: bool,
    pub last_poll_at: Option<DateTime<Utc>>,
}

impl UserSession {
    pub fn is_active(&self) -> bool {
        self.auth_status == AuthStatus::Active
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::seconds(self.poll_interval_secs.max(1))
    }

    /// A session is due when it has never been polled or its interval elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_poll_at {
            None => true,
            Some(last) => now >= last + self.poll_interval(),
        }
    }
}

/// Persisted link between a remote transaction and the message sent for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub user_id: UserId,
    pub external_tx_id: ExternalTxId,
    pub message_id: Option<MessageId>,
    pub content_hash: String,
    pub lifecycle: DeliveryLifecycle,
    pub send_attempts: i64,
    /// Provider-side id of the transaction the message was sent for.
    pub plaid_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollCursor {
    pub user_id: UserId,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub updated_at: DateTime<Utc>,
}

/// Date range (inclusive) requested from the finance provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub pending: bool,
}

impl FetchWindow {
    /// Window for the next cycle: re-read `lookback_days` before the last
    /// processed end (or `initial_lookback_days` before today on first poll)
    /// so late edits to recent transactions are still observed.
    pub fn next(
        cursor: Option<&PollCursor>,
        today: NaiveDate,
        lookback_days: i64,
        initial_lookback_days: i64,
        pending: bool,
    ) -> Self {
        let start = match cursor {
            Some(c) => c.window_end.min(today) - Duration::days(lookback_days),
            None => today - Duration::days(initial_lookback_days),
        };
        Self {
            start,
            end: today,
            pending,
        }
    }
}

/// A transaction as reported by the finance provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteTxn {
    pub id: ExternalTxId,
    pub date: NaiveDate,
    pub account_id: Option<AccountId>,
    pub account_name: Option<String>,
    pub amount: f64,
    pub currency: String,
    pub payee: String,
    pub category_id: Option<CategoryId>,
    pub category_name: Option<String>,
    pub category_group_name: Option<String>,
    pub notes: Option<String>,
    pub reviewed: bool,
    pub is_pending: bool,
    pub recurring: bool,
    pub tags: Vec<String>,
    pub merchant_name: Option<String>,
    pub authorized_at: Option<DateTime<Utc>>,
    /// Bank-feed id of this transaction, when imported through Plaid.
    pub plaid_id: Option<String>,
    /// For a posted transaction, the bank-feed id of the pending transaction
    /// it replaces.
    pub pending_plaid_id: Option<String>,
}

/// Fields the core may change on a remote transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxUpdate {
    pub category_id: Option<CategoryId>,
    pub reviewed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Category {
    pub id: CategoryId,
    pub name: String,
    pub group_name: Option<String>,
    pub is_group: bool,
}
