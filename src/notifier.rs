//! Sends and edits transaction messages and keeps delivery rows in step.
//!
//! A provisional `pending` row is written before every send and promoted to
//! `delivered` once the channel hands back a message id. A row that is still
//! provisional on a later cycle is sent at most once more; after that it is
//! marked `failed` so a transaction can never be announced twice.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelError, MessageChannel};
use crate::db::{self, metric, Pool};
use crate::diff::{Changed, New};
use crate::model::{AuthStatus, MessageId, UserSession};
use crate::render::{render_transaction, RenderOptions};
use crate::retry::{with_retry, RetryPolicy};

/// Send attempts allowed for one transaction, including the reconciling retry.
pub const MAX_SEND_ATTEMPTS: i64 = 2;

#[derive(Debug, Error)]
pub enum DeliveryFailure {
    /// The user can no longer be reached; the session is now `Blocked`.
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),
    /// The message being edited is gone; only its record is affected.
    #[error("message gone: {0}")]
    MessageGone(String),
    #[error("delivery gave up: {0}")]
    Exhausted(String),
    #[error("delivery store failure: {0}")]
    Persistence(String),
}

fn persistence(err: anyhow::Error) -> DeliveryFailure {
    DeliveryFailure::Persistence(format!("{:#}", err))
}

pub struct Notifier {
    pool: Pool,
    channel: Arc<dyn MessageChannel>,
    retry: RetryPolicy,
}

impl Notifier {
    pub fn new(pool: Pool, channel: Arc<dyn MessageChannel>, retry: RetryPolicy) -> Self {
        Self {
            pool,
            channel,
            retry,
        }
    }

    async fn bump(&self, key: &str) {
        if let Err(err) = db::inc_metric(&self.pool, key, 1.0).await {
            warn!(?err, key, "failed to record metric");
        }
    }

    /// Announce a transaction that has no confirmed message yet.
    #[instrument(skip_all, fields(user_id = session.user_id, tx_id = new.txn.id))]
    pub async fn notify_new(
        &self,
        session: &UserSession,
        new: &New,
    ) -> Result<MessageId, DeliveryFailure> {
        let user_id = session.user_id;
        let tx_id = new.txn.id;

        if let Some(pending) = &new.pending {
            if pending.send_attempts >= MAX_SEND_ATTEMPTS {
                warn!(
                    attempts = pending.send_attempts,
                    "unconfirmed send already retried; marking failed"
                );
                db::mark_failed(&self.pool, user_id, tx_id)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::DELIVERY_FAILURES).await;
                return Err(DeliveryFailure::Exhausted(
                    "unconfirmed send already retried".into(),
                ));
            }
            info!(
                attempts = pending.send_attempts,
                "reconciling unconfirmed send"
            );
        }

        let Some(record) = db::begin_send(
            &self.pool,
            user_id,
            tx_id,
            &new.hash,
            new.txn.plaid_id.as_deref(),
        )
        .await
        .map_err(persistence)?
        else {
            // Someone already settled this row; never send again.
            let existing = db::get_delivery(&self.pool, user_id, tx_id)
                .await
                .map_err(persistence)?;
            return match existing.and_then(|r| r.message_id) {
                Some(message_id) => Ok(message_id),
                None => Err(DeliveryFailure::Exhausted("delivery record is terminal".into())),
            };
        };
        debug!(attempt = record.send_attempts, "provisional delivery written");

        let text = render_transaction(&new.txn, &RenderOptions::from(session));
        let sent = with_retry(&self.retry, "send", || self.channel.send(user_id, &text)).await;

        match sent {
            Ok(message_id) => {
                db::promote_delivered(&self.pool, user_id, tx_id, message_id, &new.hash)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::SENT_TRANSACTION_MESSAGES).await;
                info!(message_id, "transaction delivered");
                Ok(message_id)
            }
            Err(ChannelError::RecipientUnreachable(reason)) => {
                self.block_user(user_id, &reason).await?;
                if record.send_attempts <= 1 {
                    db::discard_pending(&self.pool, user_id, tx_id)
                        .await
                        .map_err(persistence)?;
                } else {
                    // An earlier attempt may have gone out; keep the spent
                    // attempts so re-authorization cannot send it again.
                    debug!(attempts = record.send_attempts, "keeping unconfirmed delivery");
                }
                Err(DeliveryFailure::RecipientUnreachable(reason))
            }
            Err(err) => {
                warn!(%err, "send failed permanently; marking delivery failed");
                db::mark_failed(&self.pool, user_id, tx_id)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::DELIVERY_FAILURES).await;
                Err(DeliveryFailure::Exhausted(err.to_string()))
            }
        }
    }

    /// Edit the message of an existing delivery to reflect the new content.
    #[instrument(skip_all, fields(user_id = session.user_id, tx_id = changed.txn.id))]
    pub async fn notify_update(
        &self,
        session: &UserSession,
        changed: &Changed,
    ) -> Result<(), DeliveryFailure> {
        let user_id = session.user_id;
        let tx_id = changed.txn.id;

        let Some(message_id) = changed.record.message_id else {
            db::mark_failed(&self.pool, user_id, tx_id)
                .await
                .map_err(persistence)?;
            return Err(DeliveryFailure::MessageGone(
                "delivery has no message id".into(),
            ));
        };

        let text = render_transaction(&changed.txn, &RenderOptions::from(session));
        let edited = with_retry(&self.retry, "edit", || {
            self.channel.edit(user_id, message_id, &text)
        })
        .await;

        match edited {
            Ok(()) => {
                db::update_hash(&self.pool, user_id, tx_id, &changed.hash)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::EDITED_TRANSACTION_MESSAGES).await;
                info!(message_id, "transaction message updated");
                Ok(())
            }
            Err(ChannelError::MessageGone(reason)) => {
                warn!(message_id, %reason, "message gone; marking delivery failed");
                db::mark_failed(&self.pool, user_id, tx_id)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::DELIVERY_FAILURES).await;
                Err(DeliveryFailure::MessageGone(reason))
            }
            Err(ChannelError::RecipientUnreachable(reason)) => {
                self.block_user(user_id, &reason).await?;
                Err(DeliveryFailure::RecipientUnreachable(reason))
            }
            Err(err) => {
                warn!(message_id, %err, "edit failed permanently; marking delivery failed");
                db::mark_failed(&self.pool, user_id, tx_id)
                    .await
                    .map_err(persistence)?;
                self.bump(metric::DELIVERY_FAILURES).await;
                Err(DeliveryFailure::Exhausted(err.to_string()))
            }
        }
    }

    async fn block_user(&self, user_id: i64, reason: &str) -> Result<(), DeliveryFailure> {
        warn!(user_id, reason, "recipient unreachable; blocking session");
        db::set_auth_status(&self.pool, user_id, AuthStatus::Blocked)
            .await
            .map_err(persistence)?;
        self.bump(metric::DELIVERY_FAILURES).await;
        Ok(())
    }
}
