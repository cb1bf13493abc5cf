//! Messaging channel abstraction and its Telegram implementation.

use async_trait::async_trait;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId as TgMessageId, ParseMode};
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::debug;

use crate::model::{MessageId, UserId};
use crate::retry::Transient;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The recipient can never be reached again until re-authorized.
    #[error("recipient unreachable: {0}")]
    RecipientUnreachable(String),
    /// The targeted message no longer exists.
    #[error("message gone: {0}")]
    MessageGone(String),
    #[error("transient channel failure: {0}")]
    Transient(String),
}

impl Transient for ChannelError {
    fn is_transient(&self) -> bool {
        matches!(self, ChannelError::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        ChannelError::Transient(format!("timed out after {:?}", after))
    }
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    async fn send(&self, user_id: UserId, content: &str) -> Result<MessageId, ChannelError>;

    async fn edit(
        &self,
        user_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), ChannelError>;
}

#[derive(Clone)]
pub struct TelegramChannel {
    bot: Bot,
}

impl TelegramChannel {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

/// Map a Telegram request failure onto the channel error kinds using the
/// structured API error, never the description text.
pub fn classify_request_error(err: RequestError) -> ChannelError {
    match err {
        RequestError::Api(api) => match api {
            ApiError::BotBlocked
            | ApiError::BotKicked
            | ApiError::BotKickedFromSupergroup
            | ApiError::UserDeactivated
            | ApiError::ChatNotFound
            | ApiError::CantInitiateConversation
            | ApiError::CantTalkWithBots => ChannelError::RecipientUnreachable(api.to_string()),
            ApiError::MessageToEditNotFound | ApiError::MessageIdInvalid => {
                ChannelError::MessageGone(api.to_string())
            }
            other => ChannelError::Transient(other.to_string()),
        },
        other => ChannelError::Transient(other.to_string()),
    }
}

#[async_trait]
impl MessageChannel for TelegramChannel {
    async fn send(&self, user_id: UserId, content: &str) -> Result<MessageId, ChannelError> {
        let msg = self
            .bot
            .send_message(ChatId(user_id), content)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await
            .map_err(classify_request_error)?;
        Ok(msg.id.0)
    }

    async fn edit(
        &self,
        user_id: UserId,
        message_id: MessageId,
        content: &str,
    ) -> Result<(), ChannelError> {
        let res = self
            .bot
            .edit_message_text(ChatId(user_id), TgMessageId(message_id), content)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(true)
            .await;
        match res {
            Ok(_) => Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => {
                debug!(user_id, message_id, "message not modified; treating edit as done");
                Ok(())
            }
            Err(err) => Err(classify_request_error(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_recipient_is_permanent() {
        for api in [
            ApiError::BotBlocked,
            ApiError::BotKicked,
            ApiError::UserDeactivated,
            ApiError::ChatNotFound,
        ] {
            assert!(matches!(
                classify_request_error(RequestError::Api(api)),
                ChannelError::RecipientUnreachable(_)
            ));
        }
    }

    #[test]
    fn missing_message_is_scoped_to_message() {
        assert!(matches!(
            classify_request_error(RequestError::Api(ApiError::MessageToEditNotFound)),
            ChannelError::MessageGone(_)
        ));
    }

    #[test]
    fn other_api_errors_are_transient() {
        let err = classify_request_error(RequestError::Api(ApiError::Unknown(
            "Bad Request: something odd".into(),
        )));
        assert!(err.is_transient());
    }
}
