//! Excluding accounts from notifications.

use thiserror::Error;
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::{AccountId, UserId};
use crate::provider::{FinanceProvider, ProviderError};

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("no session for user {0}")]
    UnknownUser(UserId),
    #[error("account {0} is not one of the user's accounts")]
    UnknownAccount(AccountId),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Ignore `account_id` for `user_id` after checking that the provider
/// actually lists it for that user.
#[instrument(skip_all, fields(user_id = user_id, account_id = account_id))]
pub async fn ignore_account(
    pool: &Pool,
    provider: &dyn FinanceProvider,
    user_id: UserId,
    account_id: AccountId,
) -> Result<(), AccountError> {
    let session = db::get_session(pool, user_id)
        .await?
        .ok_or(AccountError::UnknownUser(user_id))?;
    let accounts = provider.list_accounts(&session).await?;
    if !accounts.contains(&account_id) {
        return Err(AccountError::UnknownAccount(account_id));
    }
    db::ignore_account(pool, user_id, account_id).await?;
    info!(known = accounts.len(), "account ignored");
    Ok(())
}
