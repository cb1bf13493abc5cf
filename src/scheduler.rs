//! Per-user poll cycles driven by a periodic tick.
//!
//! Every tick loads the active sessions that are due and spawns one cycle
//! per user. A user whose previous cycle is still running is skipped for
//! that tick. Cycles observe the shutdown token and may be abandoned at any
//! await point; the cursor only moves once a batch has been fully handled.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::categorize::CategorizationTrigger;
use crate::config::Config;
use crate::db::{self, metric, Pool};
use crate::diff::classify;
use crate::model::{
    AuthStatus, DeliveryLifecycle, DeliveryRecord, ExternalTxId, FetchWindow, RemoteTxn, TxUpdate,
    UserId, UserSession,
};
use crate::notifier::{DeliveryFailure, Notifier};
use crate::provider::{FinanceProvider, ProviderError};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    #[error("provider unavailable: {0}")]
    Transient(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

fn persistence(err: anyhow::Error) -> CycleError {
    CycleError::Persistence(format!("{:#}", err))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    pub lookback_days: i64,
    pub initial_lookback_days: i64,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tick_interval: cfg.app.tick_interval(),
            lookback_days: cfg.app.lookback_days,
            initial_lookback_days: cfg.app.initial_lookback_days,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub sent: usize,
    pub edited: usize,
    pub failed: usize,
    pub skipped: usize,
    pub categorizations: usize,
    /// Posted transactions marked reviewed on the provider.
    pub reviewed: usize,
    /// Posted transactions that took over the record of their pending version.
    pub reconciled: usize,
    /// The recipient became unreachable during this cycle.
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// The session is not `Active`; nothing was attempted.
    Inactive(AuthStatus),
    UnknownUser,
}

/// Removes the user from the in-flight set when the cycle ends.
struct InFlightGuard {
    users: Arc<Mutex<HashSet<UserId>>>,
    user_id: UserId,
}

impl InFlightGuard {
    fn acquire(users: &Arc<Mutex<HashSet<UserId>>>, user_id: UserId) -> Option<Self> {
        let mut set = users.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(user_id) {
            return None;
        }
        Some(Self {
            users: users.clone(),
            user_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.users.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.user_id);
    }
}

#[derive(Clone)]
pub struct Scheduler {
    pool: Pool,
    provider: Arc<dyn FinanceProvider>,
    notifier: Arc<Notifier>,
    trigger: Option<CategorizationTrigger>,
    retry: RetryPolicy,
    settings: SchedulerSettings,
    in_flight: Arc<Mutex<HashSet<UserId>>>,
    cycles: TaskTracker,
}

impl Scheduler {
    pub fn new(
        pool: Pool,
        provider: Arc<dyn FinanceProvider>,
        notifier: Arc<Notifier>,
        trigger: Option<CategorizationTrigger>,
        retry: RetryPolicy,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            pool,
            provider,
            notifier,
            trigger,
            retry,
            settings,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cycles: TaskTracker::new(),
        }
    }

    /// Tick until `shutdown` fires, then wait for running cycles to stop.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.settings.tick_interval, "scheduler started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick(&shutdown).await;
                }
            }
        }
        self.cycles.close();
        self.cycles.wait().await;
        info!("scheduler stopped");
    }

    /// Spawn a cycle for every due, active user that has none running.
    /// Returns the users a cycle was started for.
    pub async fn tick(&self, shutdown: &CancellationToken) -> Vec<UserId> {
        let sessions = match db::list_sessions(&self.pool, Some(AuthStatus::Active)).await {
            Ok(s) => s,
            Err(err) => {
                error!(?err, "failed to load sessions");
                return Vec::new();
            }
        };
        let now = Utc::now();
        let mut started = Vec::new();
        for session in sessions.into_iter().filter(|s| s.is_due(now)) {
            let user_id = session.user_id;
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, user_id) else {
                debug!(user_id, "previous cycle still running; dropping tick");
                continue;
            };
            let this = self.clone();
            let token = shutdown.child_token();
            self.cycles.spawn(async move {
                let _guard = guard;
                tokio::select! {
                    res = this.run_cycle(user_id) => match res {
                        Ok(CycleOutcome::Completed(report)) => debug!(user_id, ?report, "cycle finished"),
                        Ok(other) => debug!(user_id, ?other, "cycle skipped"),
                        Err(err) => warn!(user_id, %err, "cycle aborted"),
                    },
                    _ = token.cancelled() => info!(user_id, "cycle cancelled"),
                }
            });
            started.push(user_id);
        }
        started
    }

    /// Wait for every cycle spawned so far to finish.
    pub async fn wait_idle(&self) {
        self.cycles.close();
        self.cycles.wait().await;
        self.cycles.reopen();
    }

    /// One fetch, diff and notify pass for `user_id`.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, user_id: UserId) -> Result<CycleOutcome, CycleError> {
        let Some(session) = db::get_session(&self.pool, user_id)
            .await
            .map_err(persistence)?
        else {
            warn!("no session for user");
            return Ok(CycleOutcome::UnknownUser);
        };
        if !session.is_active() {
            info!(status = session.auth_status.as_str(), "session not active; skipping cycle");
            return Ok(CycleOutcome::Inactive(session.auth_status));
        }

        let res = self.poll(&session).await;

        if let Err(err) = db::touch_last_poll(&self.pool, user_id, Utc::now()).await {
            warn!(?err, "failed to stamp last poll time");
        }
        if let Err(err) = db::inc_metric(&self.pool, metric::POLL_CYCLES, 1.0).await {
            warn!(?err, "failed to record metric");
        }
        res.map(CycleOutcome::Completed)
    }

    async fn poll(&self, session: &UserSession) -> Result<CycleReport, CycleError> {
        let user_id = session.user_id;
        let cursor = db::get_cursor(&self.pool, user_id)
            .await
            .map_err(persistence)?;
        let window = FetchWindow::next(
            cursor.as_ref(),
            Utc::now().date_naive(),
            self.settings.lookback_days,
            self.settings.initial_lookback_days,
            session.poll_pending,
        );

        let fetched = with_retry(&self.retry, "list_transactions", || {
            self.provider.list_transactions(session, &window)
        })
        .await;
        let mut batch = match fetched {
            Ok(batch) => batch,
            Err(ProviderError::Auth(reason)) => {
                warn!(%reason, "provider token rejected; expiring session");
                db::set_auth_status(&self.pool, user_id, AuthStatus::Expired)
                    .await
                    .map_err(persistence)?;
                return Err(CycleError::Auth(reason));
            }
            Err(err) => return Err(CycleError::Transient(err.to_string())),
        };
        drop_superseded_pending(&mut batch);

        let ids: Vec<_> = batch.iter().map(|t| t.id).collect();
        let mut records = db::deliveries_for(&self.pool, user_id, &ids)
            .await
            .map_err(persistence)?;
        let reconciled = self.reconcile_posted(user_id, &batch, &mut records).await?;

        let mut report = CycleReport {
            fetched: batch.len(),
            reconciled: reconciled.len(),
            ..Default::default()
        };
        if session.auto_mark_reviewed {
            report.reviewed = self
                .auto_review(session, &mut batch, &records, &reconciled)
                .await;
        }

        let diff = classify(&batch, &session.ignored_account_ids, &records);
        report.skipped = diff.skip.len();
        debug!(
            start = %window.start,
            end = %window.end,
            new = diff.to_notify.len(),
            changed = diff.to_update.len(),
            skipped = report.skipped,
            "batch classified"
        );

        let mut halted = false;
        for new in &diff.to_notify {
            if self.halt_if_inactive(user_id, &mut report).await? {
                halted = true;
                break;
            }
            match self.notifier.notify_new(session, new).await {
                Ok(_) => {
                    report.sent += 1;
                    self.maybe_categorize(session, &new.txn, &mut report);
                }
                Err(DeliveryFailure::RecipientUnreachable(_)) => {
                    report.blocked = true;
                    halted = true;
                    break;
                }
                Err(DeliveryFailure::Persistence(reason)) => {
                    return Err(CycleError::Persistence(reason))
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(tx_id = new.txn.id, %err, "notification failed");
                }
            }
        }

        if !halted {
            for changed in &diff.to_update {
                if self.halt_if_inactive(user_id, &mut report).await? {
                    break;
                }
                match self.notifier.notify_update(session, changed).await {
                    Ok(()) => {
                        report.edited += 1;
                        self.maybe_categorize(session, &changed.txn, &mut report);
                    }
                    Err(DeliveryFailure::RecipientUnreachable(_)) => {
                        report.blocked = true;
                        break;
                    }
                    Err(DeliveryFailure::Persistence(reason)) => {
                        return Err(CycleError::Persistence(reason))
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(tx_id = changed.txn.id, %err, "update failed");
                    }
                }
            }
        }

        db::advance_cursor(&self.pool, user_id, window.start, window.end)
            .await
            .map_err(persistence)?;
        Ok(report)
    }

    /// The session can change under a running cycle, e.g. a categorization
    /// follow-up finding the recipient unreachable. Returns true when the
    /// cycle must stop sending.
    async fn halt_if_inactive(
        &self,
        user_id: UserId,
        report: &mut CycleReport,
    ) -> Result<bool, CycleError> {
        let status = db::auth_status(&self.pool, user_id)
            .await
            .map_err(persistence)?;
        match status {
            Some(AuthStatus::Active) => Ok(false),
            other => {
                info!(status = ?other, "session no longer active; stopping cycle");
                report.blocked = other == Some(AuthStatus::Blocked);
                Ok(true)
            }
        }
    }

    /// Move the record of an announced pending transaction onto the posted
    /// transaction that replaced it, so the existing message is edited
    /// instead of a second one being sent. Returns the ids that took over.
    async fn reconcile_posted(
        &self,
        user_id: UserId,
        batch: &[RemoteTxn],
        records: &mut HashMap<ExternalTxId, DeliveryRecord>,
    ) -> Result<HashSet<ExternalTxId>, CycleError> {
        let mut moved = HashSet::new();
        for txn in batch.iter().filter(|t| !t.is_pending) {
            let Some(pending_plaid_id) = txn.pending_plaid_id.as_deref() else {
                continue;
            };
            if records.contains_key(&txn.id) {
                continue;
            }
            let rekeyed = db::rekey_posted(
                &self.pool,
                user_id,
                pending_plaid_id,
                txn.id,
                txn.plaid_id.as_deref(),
            )
            .await
            .map_err(persistence)?;
            if !rekeyed {
                continue;
            }
            info!(tx_id = txn.id, pending_plaid_id, "pending transaction posted under a new id");
            if let Some(rec) = db::get_delivery(&self.pool, user_id, txn.id)
                .await
                .map_err(persistence)?
            {
                records.insert(txn.id, rec);
            }
            moved.insert(txn.id);
        }
        if !moved.is_empty() {
            if let Err(err) =
                db::inc_metric(&self.pool, metric::POSTED_RECONCILED, moved.len() as f64).await
            {
                warn!(?err, "failed to record metric");
            }
        }
        Ok(moved)
    }

    /// Mark posted, unreviewed transactions reviewed on the provider before
    /// they are first announced, or first edited after posting. A failed
    /// update leaves the transaction as fetched.
    async fn auto_review(
        &self,
        session: &UserSession,
        batch: &mut [RemoteTxn],
        records: &HashMap<ExternalTxId, DeliveryRecord>,
        reconciled: &HashSet<ExternalTxId>,
    ) -> usize {
        let update = TxUpdate {
            category_id: None,
            reviewed: Some(true),
        };
        let mut reviewed = 0;
        for txn in batch.iter_mut() {
            if txn.is_pending
                || txn.reviewed
                || txn
                    .account_id
                    .map_or(false, |a| session.ignored_account_ids.contains(&a))
            {
                continue;
            }
            let first_sight = match records.get(&txn.id) {
                None => true,
                Some(rec) => {
                    reconciled.contains(&txn.id)
                        || (rec.lifecycle == DeliveryLifecycle::Pending && rec.message_id.is_none())
                }
            };
            if !first_sight {
                continue;
            }
            let tx_id = txn.id;
            let res = with_retry(&self.retry, "mark_reviewed", || {
                self.provider.update_transaction(session, tx_id, &update)
            })
            .await;
            match res {
                Ok(()) => {
                    txn.reviewed = true;
                    reviewed += 1;
                }
                Err(err) => warn!(tx_id, %err, "could not mark transaction reviewed"),
            }
        }
        if reviewed > 0 {
            if let Err(err) =
                db::inc_metric(&self.pool, metric::AUTO_REVIEWED, reviewed as f64).await
            {
                warn!(?err, "failed to record metric");
            }
        }
        reviewed
    }

    fn maybe_categorize(&self, session: &UserSession, txn: &RemoteTxn, report: &mut CycleReport) {
        if let Some(trigger) = &self.trigger {
            if trigger.maybe_spawn(session, txn) {
                report.categorizations += 1;
            }
        }
    }
}

/// A pending transaction whose posted successor is in the same batch is
/// stale; only the posted one is processed.
fn drop_superseded_pending(batch: &mut Vec<RemoteTxn>) {
    let superseded: HashSet<String> = batch
        .iter()
        .filter(|t| !t.is_pending)
        .filter_map(|t| t.pending_plaid_id.clone())
        .collect();
    if superseded.is_empty() {
        return;
    }
    batch.retain(|t| {
        !(t.is_pending
            && t
                .plaid_id
                .as_ref()
                .map_or(false, |p| superseded.contains(p)))
    });
}
