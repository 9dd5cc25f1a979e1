use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use super::{
    DeliveryReceipt, EventSink, InboundEvent, InboundSource, InstantMessageEvent, OutboundSender,
    Platform,
};
use crate::error::{RelayError, Result};

/// Only the configured chat is relayed; everything else the bot sees is
/// dropped on purpose.
pub fn is_relay_chat(event: &InstantMessageEvent, relay_chat_id: i64) -> bool {
    event.chat_id == relay_chat_id
}

/// Username when set, else first name.
pub fn sender_label(event: &InstantMessageEvent) -> String {
    event
        .username
        .clone()
        .or_else(|| event.first_name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}

fn to_event(msg: &Message) -> InstantMessageEvent {
    let user = msg.from.as_ref();
    InstantMessageEvent {
        chat_id: msg.chat.id.0,
        username: user.and_then(|u| u.username.clone()),
        first_name: user.map(|u| u.first_name.clone()),
        text: msg.text().map(str::to_string),
    }
}

/// Telegram bot connection, polled for updates.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "Telegram bot token cannot be empty".into(),
            ));
        }
        Ok(Self {
            bot: Bot::new(bot_token),
        })
    }

    /// Check the token with `getMe`.
    pub async fn login(&self) -> Result<()> {
        let me = self.bot.get_me().await?;
        info!("Logged in to Telegram as @{}", me.username());
        Ok(())
    }
}

async fn handle_message(msg: Message, sink: EventSink) -> ResponseResult<()> {
    let event = to_event(&msg);
    if let Err(e) = sink.deliver(InboundEvent::InstantMessage(event)).await {
        error!("Dropping Telegram message: {}", e);
    }
    Ok(())
}

#[async_trait]
impl InboundSource for TelegramClient {
    fn platform(&self) -> Platform {
        Platform::InstantMessage
    }

    async fn subscribe(self: Arc<Self>, sink: EventSink) -> Result<()> {
        info!("Starting Telegram polling...");

        let handler = Update::filter_message().endpoint(handle_message);

        Dispatcher::builder(self.bot.clone(), handler)
            .dependencies(dptree::deps![sink])
            .default_handler(|upd| async move {
                warn!("Unhandled update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("Telegram polling error"))
            .build()
            .dispatch()
            .await;

        Ok(())
    }
}

#[async_trait]
impl OutboundSender for TelegramClient {
    fn platform(&self) -> Platform {
        Platform::InstantMessage
    }

    async fn send(&self, destination: &str, text: &str) -> Result<DeliveryReceipt> {
        let chat_id: i64 = destination.parse().map_err(|_| {
            RelayError::InvalidConfig(format!("invalid Telegram chat id `{destination}`"))
        })?;

        let sent = match self.bot.send_message(ChatId(chat_id), text).await {
            Ok(sent) => sent,
            Err(teloxide::RequestError::Api(teloxide::ApiError::ChatNotFound)) => {
                return Err(RelayError::DestinationNotFound {
                    platform: Platform::InstantMessage,
                    destination: destination.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        Ok(DeliveryReceipt {
            platform: Platform::InstantMessage,
            destination: destination.to_string(),
            message_id: sent.id.0.to_string(),
        })
    }
}
