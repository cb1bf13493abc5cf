//! Category suggestions from an OpenAI-compatible chat completions endpoint.

use anyhow::Context;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config;
use crate::model::{Category, CategoryId, RemoteTxn};
use crate::retry::Transient;

static CATEGORY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d+)\b").expect("valid category id pattern"));

#[derive(Debug, Error)]
pub enum CategorizationError {
    #[error("categorization model failed: {0}")]
    Model(String),
    #[error("suggested category {0} does not exist")]
    InvalidCategory(CategoryId),
    #[error("category update rejected: {0}")]
    Rejected(String),
    #[error("model returned no category")]
    NoSuggestion,
}

impl Transient for CategorizationError {
    fn is_transient(&self) -> bool {
        matches!(self, CategorizationError::Model(_))
    }

    fn timed_out(after: Duration) -> Self {
        CategorizationError::Model(format!("timed out after {:?}", after))
    }
}

/// Everything the model sees about one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CategorizationContext {
    pub payee: String,
    pub amount: f64,
    pub currency: String,
    pub merchant_name: Option<String>,
    pub notes: Option<String>,
    pub categories: Vec<Category>,
}

impl CategorizationContext {
    pub fn new(txn: &RemoteTxn, categories: Vec<Category>) -> Self {
        Self {
            payee: txn.payee.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            merchant_name: txn.merchant_name.clone(),
            notes: txn.notes.clone(),
            categories,
        }
    }
}

#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn suggest_category(
        &self,
        ctx: &CategorizationContext,
    ) -> Result<CategoryId, CategorizationError>;
}

/// Categories a transaction may be assigned to; groups are excluded.
pub fn leaf_categories(categories: &[Category]) -> impl Iterator<Item = &Category> {
    categories.iter().filter(|c| !c.is_group)
}

pub fn build_prompt(ctx: &CategorizationContext) -> String {
    let mut tx_info = format!("Payee: {}\nAmount: {} {}\n", ctx.payee, ctx.amount, ctx.currency);
    if let Some(merchant) = &ctx.merchant_name {
        tx_info.push_str(&format!("merchant_name: {}\n", merchant));
    }
    if let Some(notes) = &ctx.notes {
        tx_info.push_str(&format!("notes: {}\n", notes));
    }

    let categories: Vec<String> = leaf_categories(&ctx.categories)
        .map(|c| match &c.group_name {
            Some(group) => format!("{}:{} ({})", c.id, c.name, group),
            None => format!("{}:{}", c.id, c.name),
        })
        .collect();

    format!(
        "This is the transaction information:\n{}\n\
         What of the following categories would you suggest for this transaction?\n\n\
         If the Payee is Amazon, then choose the Amazon category ONLY if the notes of the \
         transaction can't be categorized as a specific non-Amazon category.\n\n\
         Respond with the ID of the category, and only the ID.\n\n\
         These are the available categories (using the format `ID:Category Name`):\n\n{}\n\n\
         Remember to ONLY RESPOND with the ID, and nothing else.\n\n\
         DO NOT EXPLAIN YOURSELF. JUST RESPOND WITH THE ID or null.\n",
        tx_info,
        categories.join("\n")
    )
}

/// Pull the category id out of a model reply such as `"42"` or `"ID: 42"`.
pub fn parse_category_reply(reply: &str) -> Result<CategoryId, CategorizationError> {
    let trimmed = reply.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return Err(CategorizationError::NoSuggestion);
    }
    CATEGORY_ID_RE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<CategoryId>().ok())
        .filter(|id| *id > 0)
        .ok_or(CategorizationError::NoSuggestion)
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiCategorizer {
    http: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl fmt::Debug for OpenAiCategorizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiCategorizer")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiCategorizer {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> anyhow::Result<Self> {
        let http = Client::builder()
            .build()
            .context("failed to build categorizer HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
        })
    }

    /// `None` when categorization is disabled or no API key is configured.
    pub fn from_config(cfg: &config::Categorizer) -> anyhow::Result<Option<Self>> {
        if !cfg.enabled || cfg.api_key.trim().is_empty() {
            return Ok(None);
        }
        Self::new(&cfg.base_url, &cfg.model, &cfg.api_key).map(Some)
    }

    async fn chat_completion(&self, prompt: &str) -> Result<String, CategorizationError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| CategorizationError::Model(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CategorizationError::Model(format!("{}: {}", status, body)));
        }

        let body: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|err| CategorizationError::Model(err.to_string()))?;
        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(CategorizationError::NoSuggestion)
    }
}

#[async_trait]
impl Categorizer for OpenAiCategorizer {
    async fn suggest_category(
        &self,
        ctx: &CategorizationContext,
    ) -> Result<CategoryId, CategorizationError> {
        let prompt = build_prompt(ctx);
        let reply = self.chat_completion(&prompt).await?;
        debug!(reply = %reply.trim(), "categorization reply");
        parse_category_reply(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn categories() -> Vec<Category> {
        vec![
            Category {
                id: 1,
                name: "Shopping".into(),
                group_name: None,
                is_group: true,
            },
            Category {
                id: 2,
                name: "Amazon".into(),
                group_name: Some("Shopping".into()),
                is_group: false,
            },
            Category {
                id: 3,
                name: "Coffee".into(),
                group_name: None,
                is_group: false,
            },
        ]
    }

    #[test]
    fn prompt_lists_leaf_categories_with_parents() {
        let ctx = CategorizationContext {
            payee: "Amazon".into(),
            amount: 12.5,
            currency: "usd".into(),
            merchant_name: Some("AMZN Mktp".into()),
            notes: Some("coffee beans".into()),
            categories: categories(),
        };
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("Payee: Amazon"));
        assert!(prompt.contains("merchant_name: AMZN Mktp"));
        assert!(prompt.contains("notes: coffee beans"));
        assert!(prompt.contains("2:Amazon (Shopping)"));
        assert!(prompt.contains("3:Coffee"));
        assert!(!prompt.contains("1:Shopping"));
        assert!(prompt.contains("choose the Amazon category ONLY"));
    }

    #[test]
    fn reply_parsing() {
        assert_eq!(parse_category_reply(" 42\n").unwrap(), 42);
        assert_eq!(parse_category_reply("ID: 7").unwrap(), 7);
        assert!(matches!(
            parse_category_reply("null"),
            Err(CategorizationError::NoSuggestion)
        ));
        assert!(matches!(
            parse_category_reply("no idea"),
            Err(CategorizationError::NoSuggestion)
        ));
        assert!(matches!(
            parse_category_reply("0"),
            Err(CategorizationError::NoSuggestion)
        ));
    }

    #[test]
    fn disabled_config_wires_nothing() {
        let cfg = config::Categorizer {
            enabled: false,
            base_url: "http://localhost".into(),
            model: "m".into(),
            api_key: "k".into(),
        };
        assert!(OpenAiCategorizer::from_config(&cfg).unwrap().is_none());
    }
}
