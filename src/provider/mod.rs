use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{AccountId, Category, ExternalTxId, FetchWindow, RemoteTxn, TxUpdate, UserSession};
use crate::retry::Transient;

pub mod model;

use model::{
    categories_from_dtos, AssetsResp, CategoriesResp, PlaidAccountsResp, TransactionDto,
    TransactionsResp, UpdateResp,
};

const LUNCH_MONEY_API_BASE: &str = "https://dev.lunchmoney.app/";

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The user's token is invalid, expired or revoked.
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    /// Network failure, rate limiting, 5xx or timeout.
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("invalid provider response: {0}")]
    Decode(String),
}

impl Transient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        ProviderError::Transient(format!("timed out after {:?}", after))
    }
}

/// The remote finance provider as seen by the engine.
#[async_trait]
pub trait FinanceProvider: Send + Sync {
    async fn list_transactions(
        &self,
        session: &UserSession,
        window: &FetchWindow,
    ) -> Result<Vec<RemoteTxn>, ProviderError>;

    async fn get_transaction(
        &self,
        session: &UserSession,
        tx_id: ExternalTxId,
    ) -> Result<RemoteTxn, ProviderError>;

    async fn update_transaction(
        &self,
        session: &UserSession,
        tx_id: ExternalTxId,
        update: &TxUpdate,
    ) -> Result<(), ProviderError>;

    async fn list_accounts(&self, session: &UserSession)
        -> Result<HashSet<AccountId>, ProviderError>;

    async fn list_categories(&self, session: &UserSession) -> Result<Vec<Category>, ProviderError>;
}

#[derive(Clone)]
pub struct LunchMoneyClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for LunchMoneyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LunchMoneyClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl LunchMoneyClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_base_url(LUNCH_MONEY_API_BASE)
    }

    pub fn with_base_url(base_url: &str) -> anyhow::Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid provider base URL")?;
        let http = Client::builder()
            .user_agent("tx-watchbot/0.1")
            .build()
            .context("failed to build provider HTTP client")?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url
            .join(path)
            .map_err(|err| ProviderError::Rejected(format!("bad endpoint {}: {}", path, err)))
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        token: &str,
    ) -> Result<T, ProviderError> {
        let res = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| ProviderError::Transient(format!("failed to reach provider: {}", err)))?;

        let status = res.status();
        debug!(%status, url=%res.url(), "provider response");
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body = res
            .text()
            .await
            .map_err(|err| ProviderError::Transient(format!("failed to read provider body: {}", err)))?;
        serde_json::from_str(&body).map_err(|err| ProviderError::Decode(err.to_string()))
    }
}

/// Map a non-success HTTP status onto the provider error taxonomy.
pub fn classify_status(status: StatusCode, body: String) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::Auth(format!("{}: {}", status, body))
        }
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            warn!(%status, "provider rate limited request");
            ProviderError::Transient(format!("{}: {}", status, body))
        }
        s if s.is_server_error() => ProviderError::Transient(format!("{}: {}", status, body)),
        _ => ProviderError::Rejected(format!("{}: {}", status, body)),
    }
}

/// Request body for `PUT v1/transactions/{id}`.
pub fn build_update_body(update: &TxUpdate) -> Value {
    let mut fields = Map::new();
    if let Some(category_id) = update.category_id {
        fields.insert("category_id".into(), json!(category_id));
    }
    if let Some(reviewed) = update.reviewed {
        let status = if reviewed { "cleared" } else { "uncleared" };
        fields.insert("status".into(), json!(status));
    }
    json!({ "transaction": Value::Object(fields) })
}

fn convert(dto: TransactionDto) -> Result<RemoteTxn, ProviderError> {
    dto.into_remote().map_err(ProviderError::Decode)
}

/// Convert a listing row by row. A malformed row is logged and left out so
/// the rest of the batch is still processed.
pub fn decode_transactions(dtos: Vec<TransactionDto>) -> Vec<RemoteTxn> {
    let total = dtos.len();
    let batch: Vec<RemoteTxn> = dtos
        .into_iter()
        .filter_map(|dto| {
            let tx_id = dto.id;
            match convert(dto) {
                Ok(txn) => Some(txn),
                Err(err) => {
                    warn!(tx_id, %err, "skipping undecodable transaction");
                    None
                }
            }
        })
        .collect();
    if batch.len() < total {
        warn!(skipped = total - batch.len(), total, "transaction listing had malformed rows");
    }
    batch
}

#[async_trait]
impl FinanceProvider for LunchMoneyClient {
    async fn list_transactions(
        &self,
        session: &UserSession,
        window: &FetchWindow,
    ) -> Result<Vec<RemoteTxn>, ProviderError> {
        let url = self.endpoint("v1/transactions")?;
        let request = self.http.get(url).query(&[
            ("start_date", window.start.format("%Y-%m-%d").to_string()),
            ("end_date", window.end.format("%Y-%m-%d").to_string()),
            ("pending", window.pending.to_string()),
        ]);
        let resp: TransactionsResp = self.execute(request, &session.provider_token).await?;
        Ok(decode_transactions(resp.transactions))
    }

    async fn get_transaction(
        &self,
        session: &UserSession,
        tx_id: ExternalTxId,
    ) -> Result<RemoteTxn, ProviderError> {
        let url = self.endpoint(&format!("v1/transactions/{}", tx_id))?;
        let dto: TransactionDto = self
            .execute(self.http.get(url), &session.provider_token)
            .await?;
        convert(dto)
    }

    async fn update_transaction(
        &self,
        session: &UserSession,
        tx_id: ExternalTxId,
        update: &TxUpdate,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint(&format!("v1/transactions/{}", tx_id))?;
        let request = self.http.put(url).json(&build_update_body(update));
        let resp: UpdateResp = self.execute(request, &session.provider_token).await?;
        if let Some(error) = resp.error {
            return Err(ProviderError::Rejected(error.to_string()));
        }
        if !resp.updated {
            return Err(ProviderError::Rejected(format!(
                "transaction {} was not updated",
                tx_id
            )));
        }
        Ok(())
    }

    async fn list_accounts(
        &self,
        session: &UserSession,
    ) -> Result<HashSet<AccountId>, ProviderError> {
        let plaid: PlaidAccountsResp = self
            .execute(
                self.http.get(self.endpoint("v1/plaid_accounts")?),
                &session.provider_token,
            )
            .await?;
        let assets: AssetsResp = self
            .execute(
                self.http.get(self.endpoint("v1/assets")?),
                &session.provider_token,
            )
            .await?;
        Ok(plaid
            .plaid_accounts
            .into_iter()
            .chain(assets.assets)
            .map(|a| a.id)
            .collect())
    }

    async fn list_categories(&self, session: &UserSession) -> Result<Vec<Category>, ProviderError> {
        let resp: CategoriesResp = self
            .execute(
                self.http.get(self.endpoint("v1/categories")?),
                &session.provider_token,
            )
            .await?;
        Ok(categories_from_dtos(resp.categories))
    }
}
