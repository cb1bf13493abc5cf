use super::model::{BlockedUser, MetricTotal, SessionSettings};
use crate::model::{
    AccountId, AuthStatus, DeliveryLifecycle, DeliveryRecord, ExternalTxId, MessageId,
    PollCursor, UserId, UserSession,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Daily counter keys.
pub mod metric {
    pub const SENT_TRANSACTION_MESSAGES: &str = "sent_transaction_messages";
    pub const EDITED_TRANSACTION_MESSAGES: &str = "edited_transaction_messages";
    pub const DELIVERY_FAILURES: &str = "delivery_failures";
    pub const CATEGORIZATION_REQUESTS: &str = "categorization_requests";
    pub const CATEGORIZATION_APPLIED: &str = "categorization_applied";
    pub const CATEGORIZATION_FAILURES: &str = "categorization_failures";
    pub const POLL_CYCLES: &str = "poll_cycles";
    pub const AUTO_REVIEWED: &str = "auto_reviewed_transactions";
    pub const POSTED_RECONCILED: &str = "posted_transactions_reconciled";
}

const SESSION_COLUMNS: &str = "user_id, provider_token, auth_status, poll_interval_secs, timezone, \
     categorization_enabled, mark_reviewed_after_categorized, poll_pending, tagging, \
     show_datetime, auto_mark_reviewed, last_poll_at";

const DELIVERY_COLUMNS: &str =
    "user_id, external_tx_id, message_id, content_hash, lifecycle, send_attempts, plaid_id";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect_with(connect_options(&normalized)?).await?;
    Ok(pool)
}

/// Per-connection settings: every pooled connection gets WAL, full
/// durability and foreign key enforcement.
fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
    let opts = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url {}", url))?
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    if url.starts_with("sqlite::memory") {
        return Ok(opts);
    }
    Ok(opts.journal_mode(SqliteJournalMode::Wal))
}

/// Expand a leading `~/` in a file-backed SQLite URL, create its parent
/// directory and request create-if-missing. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{}&mode=rwc", q),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{}?{}", expanded_path, query)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions

fn session_from_row(row: &SqliteRow, ignored: HashSet<AccountId>) -> Result<UserSession> {
    let user_id: i64 = row.get("user_id");
    let status: String = row.get("auth_status");
    let auth_status = AuthStatus::parse_status(&status)
        .ok_or_else(|| anyhow!("session {} has unknown auth status {}", user_id, status))?;
    Ok(UserSession {
        user_id,
        provider_token: row.get("provider_token"),
        auth_status,
        poll_interval_secs: row.get("poll_interval_secs"),
        timezone: row.get("timezone"),
        ignored_account_ids: ignored,
        categorization_enabled: row.get("categorization_enabled"),
        mark_reviewed_after_categorized: row.get("mark_reviewed_after_categorized"),
        poll_pending: row.get("poll_pending"),
        tagging: row.get("tagging"),
        show_datetime: row.get("show_datetime"),
        auto_mark_reviewed: row.get("auto_mark_reviewed"),
        last_poll_at: row.try_get::<Option<DateTime<Utc>>, _>("last_poll_at")?,
    })
}

async fn ignored_accounts(pool: &Pool, user_id: UserId) -> Result<HashSet<AccountId>> {
    let ids: Vec<i64> =
        sqlx::query_scalar("SELECT account_id FROM ignored_accounts WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
    Ok(ids.into_iter().collect())
}

/// Create a session or re-authorize an existing one with a fresh token.
/// Either way the session ends up `Active`.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn register_session(
    pool: &Pool,
    user_id: UserId,
    provider_token: &str,
    poll_interval_secs: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO sessions (user_id, provider_token, auth_status, poll_interval_secs) \
         VALUES (?, ?, 'active', ?) \
         ON CONFLICT(user_id) DO UPDATE SET provider_token = excluded.provider_token, \
         auth_status = 'active', poll_interval_secs = excluded.poll_interval_secs",
    )
    .bind(user_id)
    .bind(provider_token)
    .bind(poll_interval_secs)
    .execute(pool)
    .await
    .context("failed to register session")?;
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn get_session(pool: &Pool, user_id: UserId) -> Result<Option<UserSession>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM sessions WHERE user_id = ?",
        SESSION_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let ignored = ignored_accounts(pool, user_id).await?;
    session_from_row(&row, ignored).map(Some)
}

#[instrument(skip_all)]
pub async fn list_sessions(pool: &Pool, status: Option<AuthStatus>) -> Result<Vec<UserSession>> {
    let rows = match status {
        Some(status) => {
            sqlx::query(&format!(
                "SELECT {} FROM sessions WHERE auth_status = ? ORDER BY user_id",
                SESSION_COLUMNS
            ))
            .bind(status.as_str())
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM sessions ORDER BY user_id",
                SESSION_COLUMNS
            ))
            .fetch_all(pool)
            .await?
        }
    };

    let mut ignored: HashMap<UserId, HashSet<AccountId>> = HashMap::new();
    for row in sqlx::query("SELECT user_id, account_id FROM ignored_accounts")
        .fetch_all(pool)
        .await?
    {
        ignored
            .entry(row.get("user_id"))
            .or_default()
            .insert(row.get("account_id"));
    }

    rows.iter()
        .map(|row| {
            let user_id: i64 = row.get("user_id");
            session_from_row(row, ignored.remove(&user_id).unwrap_or_default())
        })
        .collect()
}

#[instrument(skip_all, fields(user_id = user_id, status = status.as_str()))]
pub async fn set_auth_status(pool: &Pool, user_id: UserId, status: AuthStatus) -> Result<()> {
    let res = sqlx::query("UPDATE sessions SET auth_status = ? WHERE user_id = ?")
        .bind(status.as_str())
        .bind(user_id)
        .execute(pool)
        .await
        .context("failed to update auth status")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("session {} not found", user_id));
    }
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn update_settings(
    pool: &Pool,
    user_id: UserId,
    settings: &SessionSettings,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE sessions SET \
         poll_interval_secs = COALESCE(?, poll_interval_secs), \
         timezone = COALESCE(?, timezone), \
         categorization_enabled = COALESCE(?, categorization_enabled), \
         mark_reviewed_after_categorized = COALESCE(?, mark_reviewed_after_categorized), \
         poll_pending = COALESCE(?, poll_pending), \
         tagging = COALESCE(?, tagging), \
         show_datetime = COALESCE(?, show_datetime), \
         auto_mark_reviewed = COALESCE(?, auto_mark_reviewed) \
         WHERE user_id = ?",
    )
    .bind(settings.poll_interval_secs)
    .bind(settings.timezone.as_deref())
    .bind(settings.categorization_enabled)
    .bind(settings.mark_reviewed_after_categorized)
    .bind(settings.poll_pending)
    .bind(settings.tagging)
    .bind(settings.show_datetime)
    .bind(settings.auto_mark_reviewed)
    .bind(user_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("session {} not found", user_id));
    }
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn touch_last_poll(pool: &Pool, user_id: UserId, at: DateTime<Utc>) -> Result<()> {
    sqlx::query("UPDATE sessions SET last_poll_at = ? WHERE user_id = ?")
        .bind(at)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id, account_id = account_id))]
pub async fn ignore_account(pool: &Pool, user_id: UserId, account_id: AccountId) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO ignored_accounts (user_id, account_id) VALUES (?, ?)")
        .bind(user_id)
        .bind(account_id)
        .execute(pool)
        .await
        .context("failed to ignore account")?;
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id, account_id = account_id))]
pub async fn unignore_account(pool: &Pool, user_id: UserId, account_id: AccountId) -> Result<()> {
    sqlx::query("DELETE FROM ignored_accounts WHERE user_id = ? AND account_id = ?")
        .bind(user_id)
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn blocked_users(pool: &Pool) -> Result<Vec<BlockedUser>> {
    let rows = sqlx::query(
        "SELECT s.user_id, COUNT(d.id) AS deliveries \
         FROM sessions s LEFT JOIN deliveries d ON d.user_id = s.user_id \
         WHERE s.auth_status = 'blocked' \
         GROUP BY s.user_id ORDER BY s.user_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| BlockedUser {
            user_id: row.get("user_id"),
            deliveries: row.get("deliveries"),
        })
        .collect())
}

/// Remove every row owned by a blocked user. Returns `false` (and deletes
/// nothing) when the user is missing or not blocked.
#[instrument(skip_all, fields(user_id = user_id))]
pub async fn delete_user_data(pool: &Pool, user_id: UserId) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let status: Option<String> =
        sqlx::query_scalar("SELECT auth_status FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
    if status.as_deref() != Some(AuthStatus::Blocked.as_str()) {
        return Ok(false);
    }
    for sql in [
        "DELETE FROM deliveries WHERE user_id = ?",
        "DELETE FROM poll_cursors WHERE user_id = ?",
        "DELETE FROM ignored_accounts WHERE user_id = ?",
        "DELETE FROM sessions WHERE user_id = ?",
    ] {
        sqlx::query(sql).bind(user_id).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(true)
}

// ---------------------------------------------------------------------------
// Deliveries

fn delivery_from_row(row: &SqliteRow) -> Result<DeliveryRecord> {
    let lifecycle: String = row.get("lifecycle");
    let external_tx_id: i64 = row.get("external_tx_id");
    Ok(DeliveryRecord {
        user_id: row.get("user_id"),
        external_tx_id,
        message_id: row.get("message_id"),
        content_hash: row.get("content_hash"),
        lifecycle: DeliveryLifecycle::parse_lifecycle(&lifecycle).ok_or_else(|| {
            anyhow!(
                "delivery {} has unknown lifecycle {}",
                external_tx_id,
                lifecycle
            )
        })?,
        send_attempts: row.get("send_attempts"),
        plaid_id: row.get("plaid_id"),
    })
}

#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id))]
pub async fn get_delivery(
    pool: &Pool,
    user_id: UserId,
    tx_id: ExternalTxId,
) -> Result<Option<DeliveryRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM deliveries WHERE user_id = ? AND external_tx_id = ?",
        DELIVERY_COLUMNS
    ))
    .bind(user_id)
    .bind(tx_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(delivery_from_row).transpose()
}

/// Records for the given transaction ids, keyed by id.
#[instrument(skip_all, fields(user_id = user_id, count = tx_ids.len()))]
pub async fn deliveries_for(
    pool: &Pool,
    user_id: UserId,
    tx_ids: &[ExternalTxId],
) -> Result<HashMap<ExternalTxId, DeliveryRecord>> {
    let mut out = HashMap::new();
    // Stay well under SQLite's bound-parameter limit.
    for chunk in tx_ids.chunks(500) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM deliveries WHERE user_id = ",
            DELIVERY_COLUMNS
        ));
        qb.push_bind(user_id);
        qb.push(" AND external_tx_id IN (");
        let mut ids = qb.separated(", ");
        for id in chunk {
            ids.push_bind(*id);
        }
        ids.push_unseparated(")");
        for row in qb.build().fetch_all(pool).await? {
            let rec = delivery_from_row(&row)?;
            out.insert(rec.external_tx_id, rec);
        }
    }
    Ok(out)
}

/// Write (or re-arm) the provisional row that must exist before a send.
///
/// Returns `None` when a confirmed or failed row already exists, in which
/// case no send may happen.
#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id))]
pub async fn begin_send(
    pool: &Pool,
    user_id: UserId,
    tx_id: ExternalTxId,
    content_hash: &str,
    plaid_id: Option<&str>,
) -> Result<Option<DeliveryRecord>> {
    let row = sqlx::query(&format!(
        "INSERT INTO deliveries \
           (user_id, external_tx_id, content_hash, lifecycle, send_attempts, plaid_id) \
         VALUES (?, ?, ?, 'pending', 1, ?) \
         ON CONFLICT(user_id, external_tx_id) DO UPDATE SET \
           send_attempts = deliveries.send_attempts + 1, \
           content_hash = excluded.content_hash, \
           plaid_id = COALESCE(excluded.plaid_id, deliveries.plaid_id), \
           updated_at = CURRENT_TIMESTAMP \
         WHERE deliveries.lifecycle = 'pending' AND deliveries.message_id IS NULL \
         RETURNING {}",
        DELIVERY_COLUMNS
    ))
    .bind(user_id)
    .bind(tx_id)
    .bind(content_hash)
    .bind(plaid_id)
    .fetch_optional(pool)
    .await
    .context("failed to write provisional delivery")?;
    row.as_ref().map(delivery_from_row).transpose()
}

#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id, message_id = message_id))]
pub async fn promote_delivered(
    pool: &Pool,
    user_id: UserId,
    tx_id: ExternalTxId,
    message_id: MessageId,
    content_hash: &str,
) -> Result<()> {
    let res = sqlx::query(
        "UPDATE deliveries SET lifecycle = 'delivered', message_id = ?, content_hash = ?, \
         updated_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND external_tx_id = ? AND lifecycle = 'pending'",
    )
    .bind(message_id)
    .bind(content_hash)
    .bind(user_id)
    .bind(tx_id)
    .execute(pool)
    .await
    .context("failed to promote delivery")?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("no pending delivery for tx {}", tx_id));
    }
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id))]
pub async fn update_hash(
    pool: &Pool,
    user_id: UserId,
    tx_id: ExternalTxId,
    content_hash: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE deliveries SET content_hash = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND external_tx_id = ? AND lifecycle = 'delivered'",
    )
    .bind(content_hash)
    .bind(user_id)
    .bind(tx_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id))]
pub async fn mark_failed(pool: &Pool, user_id: UserId, tx_id: ExternalTxId) -> Result<()> {
    sqlx::query(
        "UPDATE deliveries SET lifecycle = 'failed', updated_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND external_tx_id = ?",
    )
    .bind(user_id)
    .bind(tx_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a provisional row whose send is known not to have happened.
#[instrument(skip_all, fields(user_id = user_id, tx_id = tx_id))]
pub async fn discard_pending(pool: &Pool, user_id: UserId, tx_id: ExternalTxId) -> Result<()> {
    sqlx::query(
        "DELETE FROM deliveries WHERE user_id = ? AND external_tx_id = ? \
         AND lifecycle = 'pending' AND message_id IS NULL",
    )
    .bind(user_id)
    .bind(tx_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move the record of a pending transaction that has since posted under a
/// new id onto that id. Returns false when no record carries `old_plaid_id`
/// or the posted id already has a record of its own.
#[instrument(skip_all, fields(user_id = user_id, new_tx_id = new_tx_id))]
pub async fn rekey_posted(
    pool: &Pool,
    user_id: UserId,
    old_plaid_id: &str,
    new_tx_id: ExternalTxId,
    new_plaid_id: Option<&str>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE deliveries SET external_tx_id = ?, plaid_id = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE user_id = ? AND plaid_id = ? AND external_tx_id != ? \
         AND NOT EXISTS ( \
           SELECT 1 FROM deliveries d WHERE d.user_id = ? AND d.external_tx_id = ?)",
    )
    .bind(new_tx_id)
    .bind(new_plaid_id)
    .bind(user_id)
    .bind(old_plaid_id)
    .bind(new_tx_id)
    .bind(user_id)
    .bind(new_tx_id)
    .execute(pool)
    .await
    .context("failed to re-key posted transaction")?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn auth_status(pool: &Pool, user_id: UserId) -> Result<Option<AuthStatus>> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT auth_status FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    status
        .map(|s| {
            AuthStatus::parse_status(&s)
                .ok_or_else(|| anyhow!("session {} has unknown auth status {}", user_id, s))
        })
        .transpose()
}

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn count_deliveries(
    pool: &Pool,
    user_id: UserId,
    lifecycle: Option<DeliveryLifecycle>,
) -> Result<i64> {
    let count: i64 = match lifecycle {
        Some(l) => {
            sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE user_id = ? AND lifecycle = ?")
                .bind(user_id)
                .bind(l.as_str())
                .fetch_one(pool)
                .await?
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM deliveries WHERE user_id = ?")
                .bind(user_id)
                .fetch_one(pool)
                .await?
        }
    };
    Ok(count)
}

// ---------------------------------------------------------------------------
// Cursors

#[instrument(skip_all, fields(user_id = user_id))]
pub async fn get_cursor(pool: &Pool, user_id: UserId) -> Result<Option<PollCursor>> {
    let row = sqlx::query(
        "SELECT user_id, window_start, window_end, updated_at FROM poll_cursors WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(PollCursor {
        user_id: row.get("user_id"),
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

#[instrument(skip_all, fields(user_id = user_id, window_end = %window_end))]
pub async fn advance_cursor(
    pool: &Pool,
    user_id: UserId,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO poll_cursors (user_id, window_start, window_end, updated_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(user_id) DO UPDATE SET window_start = excluded.window_start, \
         window_end = excluded.window_end, updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(window_start)
    .bind(window_end)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("failed to advance poll cursor")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Metrics

#[instrument(skip_all, fields(key = key))]
pub async fn inc_metric(pool: &Pool, key: &str, value: f64) -> Result<()> {
    let day = Utc::now().date_naive();
    sqlx::query(
        "INSERT INTO metrics (key, day, value) VALUES (?, ?, ?) \
         ON CONFLICT(key, day) DO UPDATE SET value = metrics.value + excluded.value",
    )
    .bind(key)
    .bind(day)
    .bind(value)
    .execute(pool)
    .await?;
    Ok(())
}

/// Sum of `key` over the inclusive day range.
pub async fn get_metric(pool: &Pool, key: &str, from: NaiveDate, to: NaiveDate) -> Result<f64> {
    let total: Option<f64> =
        sqlx::query_scalar("SELECT SUM(value) FROM metrics WHERE key = ? AND day >= ? AND day <= ?")
            .bind(key)
            .bind(from)
            .bind(to)
            .fetch_one(pool)
            .await?;
    Ok(total.unwrap_or(0.0))
}

pub async fn metric_totals(pool: &Pool, from: NaiveDate, to: NaiveDate) -> Result<Vec<MetricTotal>> {
    let rows = sqlx::query(
        "SELECT key, SUM(value) AS total FROM metrics WHERE day >= ? AND day <= ? \
         GROUP BY key ORDER BY key",
    )
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| MetricTotal {
            key: row.get("key"),
            value: row.get("total"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn sqlite_url_normalisation() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn session_round_trip_and_status() {
        let pool = setup_pool().await;
        assert!(get_session(&pool, 7).await.unwrap().is_none());

        register_session(&pool, 7, "tok", 600).await.unwrap();
        ignore_account(&pool, 7, 42).await.unwrap();
        ignore_account(&pool, 7, 42).await.unwrap();
        update_settings(
            &pool,
            7,
            &SessionSettings {
                categorization_enabled: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let s = get_session(&pool, 7).await.unwrap().unwrap();
        assert_eq!(s.auth_status, AuthStatus::Active);
        assert_eq!(s.poll_interval_secs, 600);
        assert!(s.categorization_enabled);
        assert!(s.tagging);
        assert_eq!(s.ignored_account_ids, HashSet::from([42]));
        assert!(s.last_poll_at.is_none());

        set_auth_status(&pool, 7, AuthStatus::Blocked).await.unwrap();
        assert!(list_sessions(&pool, Some(AuthStatus::Active))
            .await
            .unwrap()
            .is_empty());

        // Re-registering re-authorizes.
        register_session(&pool, 7, "tok2", 600).await.unwrap();
        let s = get_session(&pool, 7).await.unwrap().unwrap();
        assert_eq!(s.auth_status, AuthStatus::Active);
        assert_eq!(s.provider_token, "tok2");

        let now = Utc::now();
        touch_last_poll(&pool, 7, now).await.unwrap();
        let s = list_sessions(&pool, None).await.unwrap().remove(0);
        assert!(s.last_poll_at.is_some());
        assert_eq!(s.ignored_account_ids, HashSet::from([42]));

        assert!(set_auth_status(&pool, 99, AuthStatus::Expired).await.is_err());
    }

    #[tokio::test]
    async fn delivery_lifecycle() {
        let pool = setup_pool().await;
        let rec = begin_send(&pool, 1, 100, "h1", None).await.unwrap().unwrap();
        assert_eq!(rec.lifecycle, DeliveryLifecycle::Pending);
        assert_eq!(rec.send_attempts, 1);

        // Unconfirmed retry bumps the attempt counter.
        let rec = begin_send(&pool, 1, 100, "h1", None).await.unwrap().unwrap();
        assert_eq!(rec.send_attempts, 2);

        promote_delivered(&pool, 1, 100, 55, "h1").await.unwrap();
        // Once delivered no provisional row can be re-armed.
        assert!(begin_send(&pool, 1, 100, "h2", None).await.unwrap().is_none());

        update_hash(&pool, 1, 100, "h2").await.unwrap();
        let rec = get_delivery(&pool, 1, 100).await.unwrap().unwrap();
        assert_eq!(rec.message_id, Some(55));
        assert_eq!(rec.content_hash, "h2");
        assert_eq!(rec.lifecycle, DeliveryLifecycle::Delivered);

        mark_failed(&pool, 1, 100).await.unwrap();
        let rec = get_delivery(&pool, 1, 100).await.unwrap().unwrap();
        assert_eq!(rec.lifecycle, DeliveryLifecycle::Failed);
        assert!(promote_delivered(&pool, 1, 100, 56, "h3").await.is_err());
    }

    #[tokio::test]
    async fn discard_only_touches_unconfirmed_rows() {
        let pool = setup_pool().await;
        begin_send(&pool, 1, 1, "a", None).await.unwrap();
        begin_send(&pool, 1, 2, "b", None).await.unwrap();
        promote_delivered(&pool, 1, 2, 9, "b").await.unwrap();

        discard_pending(&pool, 1, 1).await.unwrap();
        discard_pending(&pool, 1, 2).await.unwrap();
        assert!(get_delivery(&pool, 1, 1).await.unwrap().is_none());
        assert!(get_delivery(&pool, 1, 2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn deliveries_for_filters_by_user_and_ids() {
        let pool = setup_pool().await;
        for id in 1..=3 {
            begin_send(&pool, 1, id, "x", None).await.unwrap();
        }
        begin_send(&pool, 2, 1, "y", None).await.unwrap();

        let map = deliveries_for(&pool, 1, &[1, 3, 4]).await.unwrap();
        assert_eq!(map.len(), 2);
        assert!(map.contains_key(&1) && map.contains_key(&3));
        assert_eq!(map[&1].content_hash, "x");
        assert!(deliveries_for(&pool, 1, &[]).await.unwrap().is_empty());
        assert_eq!(count_deliveries(&pool, 1, None).await.unwrap(), 3);
        assert_eq!(
            count_deliveries(&pool, 1, Some(DeliveryLifecycle::Delivered))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn cursor_upsert() {
        let pool = setup_pool().await;
        assert!(get_cursor(&pool, 1).await.unwrap().is_none());
        let d1 = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 5, 20).unwrap();
        advance_cursor(&pool, 1, d1, d2).await.unwrap();
        advance_cursor(&pool, 1, d1, d2 + Duration::days(1)).await.unwrap();
        let c = get_cursor(&pool, 1).await.unwrap().unwrap();
        assert_eq!(c.window_start, d1);
        assert_eq!(c.window_end, d2 + Duration::days(1));
    }

    #[tokio::test]
    async fn metrics_accumulate_per_day() {
        let pool = setup_pool().await;
        inc_metric(&pool, metric::SENT_TRANSACTION_MESSAGES, 1.0)
            .await
            .unwrap();
        inc_metric(&pool, metric::SENT_TRANSACTION_MESSAGES, 2.0)
            .await
            .unwrap();
        inc_metric(&pool, metric::POLL_CYCLES, 1.0).await.unwrap();
        let today = Utc::now().date_naive();
        let week_ago = today - Duration::days(7);
        assert_eq!(
            get_metric(&pool, metric::SENT_TRANSACTION_MESSAGES, week_ago, today)
                .await
                .unwrap(),
            3.0
        );
        assert_eq!(
            get_metric(&pool, "missing", week_ago, today).await.unwrap(),
            0.0
        );
        let totals = metric_totals(&pool, week_ago, today).await.unwrap();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].key, metric::POLL_CYCLES);
    }

    #[tokio::test]
    async fn every_pooled_connection_enforces_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("fk.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let mut first = pool.acquire().await.unwrap();
        let mut second = pool.acquire().await.unwrap();
        for conn in [&mut first, &mut second] {
            let enabled: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
                .fetch_one(&mut **conn)
                .await
                .unwrap();
            assert_eq!(enabled, 1);
        }
        drop((first, second));

        // No session 5, so the ignored account row is rejected.
        assert!(ignore_account(&pool, 5, 1).await.is_err());
        pool.close().await;
    }

    #[tokio::test]
    async fn posted_transaction_takes_over_pending_record() {
        let pool = setup_pool().await;
        begin_send(&pool, 1, 10, "pending-hash", Some("plaid-pending"))
            .await
            .unwrap();
        promote_delivered(&pool, 1, 10, 70, "pending-hash").await.unwrap();

        assert!(rekey_posted(&pool, 1, "plaid-pending", 11, Some("plaid-posted"))
            .await
            .unwrap());
        assert!(get_delivery(&pool, 1, 10).await.unwrap().is_none());
        let rec = get_delivery(&pool, 1, 11).await.unwrap().unwrap();
        assert_eq!(rec.message_id, Some(70));
        assert_eq!(rec.plaid_id.as_deref(), Some("plaid-posted"));
        assert_eq!(rec.content_hash, "pending-hash");

        // Already moved, and other users are never touched.
        assert!(!rekey_posted(&pool, 1, "plaid-pending", 11, None).await.unwrap());
        assert!(!rekey_posted(&pool, 2, "plaid-posted", 12, None).await.unwrap());

        // The posted id already has its own record: leave both alone.
        begin_send(&pool, 1, 20, "a", Some("p20")).await.unwrap();
        begin_send(&pool, 1, 21, "b", None).await.unwrap();
        assert!(!rekey_posted(&pool, 1, "p20", 21, None).await.unwrap());
        assert!(get_delivery(&pool, 1, 20).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn auth_status_lookup_and_auto_review_setting() {
        let pool = setup_pool().await;
        assert!(auth_status(&pool, 4).await.unwrap().is_none());
        register_session(&pool, 4, "t", 60).await.unwrap();
        assert_eq!(auth_status(&pool, 4).await.unwrap(), Some(AuthStatus::Active));
        assert!(!get_session(&pool, 4).await.unwrap().unwrap().auto_mark_reviewed);

        update_settings(
            &pool,
            4,
            &SessionSettings {
                auto_mark_reviewed: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        set_auth_status(&pool, 4, AuthStatus::Blocked).await.unwrap();
        assert_eq!(auth_status(&pool, 4).await.unwrap(), Some(AuthStatus::Blocked));
        assert!(get_session(&pool, 4).await.unwrap().unwrap().auto_mark_reviewed);
    }

    #[tokio::test]
    async fn delete_requires_blocked() {
        let pool = setup_pool().await;
        register_session(&pool, 3, "t", 60).await.unwrap();
        begin_send(&pool, 3, 1, "h", None).await.unwrap();
        assert!(!delete_user_data(&pool, 3).await.unwrap());

        set_auth_status(&pool, 3, AuthStatus::Blocked).await.unwrap();
        let blocked = blocked_users(&pool).await.unwrap();
        assert_eq!(
            blocked,
            vec![BlockedUser {
                user_id: 3,
                deliveries: 1
            }]
        );
        assert!(delete_user_data(&pool, 3).await.unwrap());
        assert!(get_session(&pool, 3).await.unwrap().is_none());
        assert_eq!(count_deliveries(&pool, 3, None).await.unwrap(), 0);
    }
}
