//! Background category suggestions for freshly delivered transactions.
//!
//! Each request runs as a task on a [`TaskTracker`] that is independent of
//! the poll cycle: the cycle neither waits for it nor cancels it. Failures
//! are logged and counted but never touch delivery state.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::categorizer::{leaf_categories, CategorizationContext, CategorizationError, Categorizer};
use crate::db::{self, metric, Pool};
use crate::diff::Changed;
use crate::model::{Category, CategoryId, DeliveryLifecycle, RemoteTxn, TxUpdate, UserSession};
use crate::notifier::Notifier;
use crate::provider::FinanceProvider;
use crate::render::content_hash;
use crate::retry::with_timeout;

#[derive(Clone)]
pub struct CategorizationTrigger {
    pool: Pool,
    provider: Arc<dyn FinanceProvider>,
    categorizer: Arc<dyn Categorizer>,
    notifier: Arc<Notifier>,
    tracker: TaskTracker,
    call_timeout: Duration,
}

impl CategorizationTrigger {
    pub fn new(
        pool: Pool,
        provider: Arc<dyn FinanceProvider>,
        categorizer: Arc<dyn Categorizer>,
        notifier: Arc<Notifier>,
        tracker: TaskTracker,
        call_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            provider,
            categorizer,
            notifier,
            tracker,
            call_timeout,
        }
    }

    /// Only uncategorized, non-recurring, posted transactions are sent to the model.
    pub fn eligible(session: &UserSession, txn: &RemoteTxn) -> bool {
        session.categorization_enabled
            && txn.category_id.is_none()
            && !txn.recurring
            && !txn.is_pending
    }

    /// Start a tracked background categorization when `txn` is eligible.
    pub fn maybe_spawn(&self, session: &UserSession, txn: &RemoteTxn) -> bool {
        if !Self::eligible(session, txn) {
            return false;
        }
        let this = self.clone();
        let session = session.clone();
        let txn = txn.clone();
        let span = tracing::info_span!("categorize", user_id = session.user_id, tx_id = txn.id);
        self.tracker.spawn(
            async move {
                match this.categorize(&session, &txn).await {
                    Ok(category_id) => debug!(category_id, "categorization finished"),
                    Err(err) => {
                        warn!(%err, "categorization failed; leaving transaction untouched");
                        this.bump(metric::CATEGORIZATION_FAILURES).await;
                    }
                }
            }
            .instrument(span),
        );
        true
    }

    async fn bump(&self, key: &str) {
        if let Err(err) = db::inc_metric(&self.pool, key, 1.0).await {
            warn!(?err, key, "failed to record metric");
        }
    }

    /// Suggest, validate and apply a category, then refresh the message.
    #[instrument(skip_all, fields(user_id = session.user_id, tx_id = txn.id))]
    pub async fn categorize(
        &self,
        session: &UserSession,
        txn: &RemoteTxn,
    ) -> Result<CategoryId, CategorizationError> {
        self.bump(metric::CATEGORIZATION_REQUESTS).await;

        let categories = with_timeout(self.call_timeout, self.provider.list_categories(session))
            .await
            .map_err(|err| CategorizationError::Rejected(err.to_string()))?;

        let ctx = CategorizationContext::new(txn, categories);
        let category_id =
            with_timeout(self.call_timeout, self.categorizer.suggest_category(&ctx)).await?;

        let Some(category) = leaf_categories(&ctx.categories)
            .find(|c| c.id == category_id)
            .cloned()
        else {
            return Err(CategorizationError::InvalidCategory(category_id));
        };

        if txn.category_id == Some(category_id) {
            debug!(category_id, "already in suggested category");
            return Ok(category_id);
        }

        let update = TxUpdate {
            category_id: Some(category_id),
            reviewed: session.mark_reviewed_after_categorized.then_some(true),
        };
        with_timeout(
            self.call_timeout,
            self.provider.update_transaction(session, txn.id, &update),
        )
        .await
        .map_err(|err| CategorizationError::Rejected(err.to_string()))?;
        self.bump(metric::CATEGORIZATION_APPLIED).await;
        info!(category_id, category = %category.name, "category applied");

        let refreshed = match with_timeout(
            self.call_timeout,
            self.provider.get_transaction(session, txn.id),
        )
        .await
        {
            Ok(fresh) => fresh,
            Err(err) => {
                debug!(%err, "re-fetch failed; rendering local copy");
                patched(txn, &category, &update)
            }
        };

        self.refresh_message(session.user_id, refreshed).await;
        Ok(category_id)
    }

    /// Best-effort edit after a successful categorization. Skipped when the
    /// user is no longer active or the delivery is not in a deliverable state.
    async fn refresh_message(&self, user_id: i64, txn: RemoteTxn) {
        let session = match db::get_session(&self.pool, user_id).await {
            Ok(Some(s)) if s.is_active() => s,
            Ok(_) => {
                info!("session not active; skipping message refresh");
                return;
            }
            Err(err) => {
                warn!(?err, "failed to reload session");
                return;
            }
        };
        let record = match db::get_delivery(&self.pool, user_id, txn.id).await {
            Ok(Some(r)) if r.lifecycle == DeliveryLifecycle::Delivered => r,
            Ok(_) => return,
            Err(err) => {
                warn!(?err, "failed to load delivery");
                return;
            }
        };

        let hash = content_hash(&txn);
        if hash == record.content_hash {
            return;
        }
        let changed = Changed { record, txn, hash };
        if let Err(err) = self.notifier.notify_update(&session, &changed).await {
            warn!(%err, "message refresh after categorization failed");
        }
    }
}

fn patched(txn: &RemoteTxn, category: &Category, update: &TxUpdate) -> RemoteTxn {
    let mut txn = txn.clone();
    txn.category_id = Some(category.id);
    txn.category_name = Some(category.name.clone());
    txn.category_group_name = category.group_name.clone();
    if let Some(reviewed) = update.reviewed {
        txn.reviewed = reviewed;
    }
    txn
}
