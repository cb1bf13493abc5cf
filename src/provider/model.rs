use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::model::{Category, RemoteTxn};

#[derive(Deserialize, Debug)]
pub struct TransactionsResp {
    pub transactions: Vec<TransactionDto>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TagDto {
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct TransactionDto {
    pub id: i64,
    pub date: String,
    #[serde(default)]
    pub payee: Option<String>,
    pub amount: String,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub category_id: Option<i64>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub category_group_name: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub is_pending: Option<bool>,
    #[serde(default)]
    pub recurring_type: Option<String>,
    #[serde(default)]
    pub plaid_account_id: Option<i64>,
    #[serde(default)]
    pub asset_id: Option<i64>,
    #[serde(default)]
    pub plaid_account_display_name: Option<String>,
    #[serde(default)]
    pub account_display_name: Option<String>,
    #[serde(default)]
    pub asset_institution_name: Option<String>,
    #[serde(default)]
    pub tags: Option<Vec<TagDto>>,
    #[serde(default)]
    pub plaid_metadata: Option<Value>,
}

impl TransactionDto {
    pub fn into_remote(self) -> Result<RemoteTxn, String> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
            .map_err(|err| format!("transaction {} has bad date {:?}: {}", self.id, self.date, err))?;
        let amount: f64 = self
            .amount
            .trim()
            .parse()
            .map_err(|err| format!("transaction {} has bad amount {:?}: {}", self.id, self.amount, err))?;

        let metadata_str = |key: &str| -> Option<String> {
            self.plaid_metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let merchant_name = metadata_str("merchant_name");
        let plaid_id = metadata_str("transaction_id");
        let pending_plaid_id = metadata_str("pending_transaction_id");
        let authorized_at = metadata_str("authorized_datetime")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        let account_name = [
            &self.plaid_account_display_name,
            &self.account_display_name,
            &self.asset_institution_name,
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned();

        Ok(RemoteTxn {
            id: self.id,
            date,
            account_id: self.plaid_account_id.or(self.asset_id),
            account_name,
            amount,
            currency: self.currency.unwrap_or_else(|| "usd".to_string()),
            payee: self.payee.unwrap_or_default(),
            category_id: self.category_id,
            category_name: self.category_name,
            category_group_name: self.category_group_name,
            notes: self.notes.filter(|n| !n.trim().is_empty()),
            reviewed: self.status.as_deref() == Some("cleared"),
            is_pending: self.is_pending.unwrap_or(false),
            recurring: self.recurring_type.is_some(),
            tags: self
                .tags
                .unwrap_or_default()
                .into_iter()
                .map(|t| t.name)
                .collect(),
            merchant_name,
            authorized_at,
            plaid_id,
            pending_plaid_id,
        })
    }
}

#[derive(Deserialize, Debug)]
pub struct CategoriesResp {
    pub categories: Vec<CategoryDto>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CategoryDto {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub group_id: Option<i64>,
}

/// Resolve each category's group name from the flat category listing.
pub fn categories_from_dtos(dtos: Vec<CategoryDto>) -> Vec<Category> {
    let names: HashMap<i64, String> = dtos.iter().map(|c| (c.id, c.name.clone())).collect();
    dtos.into_iter()
        .map(|c| Category {
            group_name: c.group_id.and_then(|g| names.get(&g).cloned()),
            id: c.id,
            name: c.name,
            is_group: c.is_group,
        })
        .collect()
}

#[derive(Deserialize, Debug)]
pub struct PlaidAccountsResp {
    pub plaid_accounts: Vec<AccountDto>,
}

#[derive(Deserialize, Debug)]
pub struct AssetsResp {
    pub assets: Vec<AccountDto>,
}

#[derive(Deserialize, Debug)]
pub struct AccountDto {
    pub id: i64,
}

#[derive(Deserialize, Debug)]
pub struct UpdateResp {
    #[serde(default)]
    pub updated: bool,
    #[serde(default)]
    pub error: Option<Value>,
}
