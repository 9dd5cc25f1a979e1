pub mod discord;
pub mod push;
pub mod push_stream;
pub mod telegram;
pub mod wallet;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::error::{RelayError, Result};

/// The three platforms a conversation is mirrored across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// Push Protocol wallet chat
    WalletChat,
    /// Discord guild channel
    Guild,
    /// Telegram chat
    InstantMessage,
}

impl Platform {
    /// Provenance tag placed in front of every relayed message.
    pub fn tag(self) -> &'static str {
        match self {
            Platform::WalletChat => "Push",
            Platform::Guild => "Discord",
            Platform::InstantMessage => "Telegram",
        }
    }

    /// The two platforms a message from `self` is forwarded to, in send order.
    pub fn relay_targets(self) -> [Platform; 2] {
        match self {
            Platform::WalletChat => [Platform::Guild, Platform::InstantMessage],
            Platform::Guild => [Platform::InstantMessage, Platform::WalletChat],
            Platform::InstantMessage => [Platform::Guild, Platform::WalletChat],
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A chat event delivered by the Push stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletChatEvent {
    /// e.g. `chat.message`, `chat.request`, `chat.group.participant.join`
    pub event: String,
    /// `self` when the relay's own wallet authored the message
    #[serde(default)]
    pub origin: String,
    /// CAIP-10 sender, e.g. `eip155:0xabc...`
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub message: WalletChatMessage,
}

/// Message body in Push's wire shape; outbound sends use the same shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletChatMessage {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub message_type: String,
}

fn default_message_type() -> String {
    "Text".to_string()
}

impl WalletChatMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            message_type: default_message_type(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuildMessageEvent {
    pub author_username: String,
    pub author_is_bot: bool,
    pub channel_id: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct InstantMessageEvent {
    pub chat_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    /// `None` for stickers, photos without caption and other non-text updates
    pub text: Option<String>,
}

/// An inbound message from any platform, as queued for the relay hub.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    WalletChat(WalletChatEvent),
    Guild(GuildMessageEvent),
    InstantMessage(InstantMessageEvent),
}

impl InboundEvent {
    pub fn platform(&self) -> Platform {
        match self {
            InboundEvent::WalletChat(_) => Platform::WalletChat,
            InboundEvent::Guild(_) => Platform::Guild,
            InboundEvent::InstantMessage(_) => Platform::InstantMessage,
        }
    }
}

/// Sending half of the hub's single event queue, handed to every source.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<InboundEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the hub drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn deliver(&self, event: InboundEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| RelayError::SinkClosed)
    }

    /// Queue without waiting, for sources that must keep a connection alive
    /// while they read. A full queue drops the event with a warning.
    pub fn try_deliver(&self, event: InboundEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                warn!("Event queue full, dropping {} event", event.platform());
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::SinkClosed),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub platform: Platform,
    pub destination: String,
    pub message_id: String,
}

/// Outbound half of a platform connection.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    fn platform(&self) -> Platform;

    async fn send(&self, destination: &str, text: &str) -> Result<DeliveryReceipt>;
}

/// Inbound half of a platform connection. `subscribe` runs until the source
/// closes, pushing one event per inbound message into `sink`.
#[async_trait]
pub trait InboundSource: Send + Sync {
    fn platform(&self) -> Platform;

    async fn subscribe(self: Arc<Self>, sink: EventSink) -> Result<()>;
}

/// A long-lived connection the hub must close on shutdown.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_targets_never_include_origin() {
        for platform in [Platform::WalletChat, Platform::Guild, Platform::InstantMessage] {
            let targets = platform.relay_targets();
            assert!(!targets.contains(&platform));
            assert_ne!(targets[0], targets[1]);
        }
    }

    #[test]
    fn test_tags() {
        assert_eq!(Platform::WalletChat.tag(), "Push");
        assert_eq!(Platform::Guild.to_string(), "Discord");
        assert_eq!(Platform::InstantMessage.tag(), "Telegram");
    }

    #[test]
    fn test_wallet_chat_message_wire_shape() {
        let value = serde_json::to_value(WalletChatMessage::text("[Discord] [alice]\nhi")).unwrap();
        assert_eq!(value["content"], "[Discord] [alice]\nhi");
        assert_eq!(value["type"], "Text");
    }

    #[test]
    fn test_wallet_chat_event_parses_stream_payload() {
        let raw = r#"{
            "event": "chat.message",
            "origin": "other",
            "timestamp": "1700000000000",
            "chatId": "abc",
            "from": "eip155:0x1234567890abcdef1234",
            "to": ["eip155:0xdead"],
            "message": { "type": "Text", "content": "gm" }
        }"#;
        let event: WalletChatEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.event, "chat.message");
        assert_eq!(event.origin, "other");
        assert_eq!(event.message.content, "gm");
    }

    fn guild_event(content: &str) -> InboundEvent {
        InboundEvent::Guild(GuildMessageEvent {
            author_username: "alice".into(),
            author_is_bot: false,
            channel_id: "1".into(),
            content: content.into(),
        })
    }

    #[tokio::test]
    async fn test_sink_fails_once_receiver_dropped() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        assert!(sink.deliver(guild_event("hi")).await.is_err());
        assert!(matches!(
            sink.try_deliver(guild_event("hi")),
            Err(RelayError::SinkClosed)
        ));
    }

    #[tokio::test]
    async fn test_try_deliver_drops_when_full() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.try_deliver(guild_event("one")).unwrap();
        sink.try_deliver(guild_event("two")).unwrap();

        match rx.recv().await {
            Some(InboundEvent::Guild(event)) => assert_eq!(event.content, "one"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
