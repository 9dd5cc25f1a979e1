use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::error::RelayError;
use crate::platform::{
    discord, push, telegram, GuildMessageEvent, InboundEvent, InstantMessageEvent,
    OutboundSender, Platform, StreamConnection, WalletChatEvent,
};

/// A message on its way from one platform to the other two.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayMessage {
    pub source_platform: Platform,
    pub sender_label: String,
    pub text: String,
}

impl RelayMessage {
    pub fn new(
        source_platform: Platform,
        sender_label: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source_platform,
            sender_label: sender_label.into(),
            text: text.into(),
        }
    }

    /// `[<tag>] [<sender>]\n<text>`, the only thing ever sent onward.
    pub fn formatted_text(&self) -> String {
        format!(
            "[{}] [{}]\n{}",
            self.source_platform.tag(),
            self.sender_label,
            self.text
        )
    }
}

/// Where relayed messages land on each platform. Fixed at startup.
#[derive(Debug, Clone)]
pub struct RelayDestinations {
    pub guild_channel_id: String,
    pub instant_message_chat_id: i64,
    pub wallet_chat_channel: String,
}

impl RelayDestinations {
    pub fn for_platform(&self, platform: Platform) -> String {
        match platform {
            Platform::WalletChat => self.wallet_chat_channel.clone(),
            Platform::Guild => self.guild_channel_id.clone(),
            Platform::InstantMessage => self.instant_message_chat_id.to_string(),
        }
    }
}

/// Fans every inbound message out to the two platforms it did not come from.
pub struct RelayHub {
    wallet_chat: Arc<dyn OutboundSender>,
    guild: Arc<dyn OutboundSender>,
    instant_message: Arc<dyn OutboundSender>,
    destinations: RelayDestinations,
    /// CAIP-10 id of the relay's own wallet, for the echo guard
    own_wallet_did: String,
    /// Taken on shutdown so the stream is closed at most once.
    wallet_chat_stream: Mutex<Option<Arc<dyn StreamConnection>>>,
}

impl RelayHub {
    pub fn new(
        wallet_chat: Arc<dyn OutboundSender>,
        guild: Arc<dyn OutboundSender>,
        instant_message: Arc<dyn OutboundSender>,
        destinations: RelayDestinations,
        own_wallet_did: impl Into<String>,
        wallet_chat_stream: Arc<dyn StreamConnection>,
    ) -> Self {
        Self {
            wallet_chat,
            guild,
            instant_message,
            destinations,
            own_wallet_did: own_wallet_did.into(),
            wallet_chat_stream: Mutex::new(Some(wallet_chat_stream)),
        }
    }

    fn sender_for(&self, platform: Platform) -> &Arc<dyn OutboundSender> {
        match platform {
            Platform::WalletChat => &self.wallet_chat,
            Platform::Guild => &self.guild,
            Platform::InstantMessage => &self.instant_message,
        }
    }

    /// Drain the event queue, running each handler to completion before
    /// taking the next event. Returns once every source has hung up.
    pub async fn run(&self, mut events: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }
        info!("All inbound sources closed");
    }

    pub async fn dispatch(&self, event: InboundEvent) {
        debug!("Dispatching {} event", event.platform());
        match event {
            InboundEvent::WalletChat(ev) => self.on_wallet_chat_message(&ev).await,
            InboundEvent::Guild(ev) => self.on_guild_message(&ev).await,
            InboundEvent::InstantMessage(ev) => self.on_instant_message(&ev).await,
        }
    }

    pub async fn on_wallet_chat_message(&self, event: &WalletChatEvent) {
        debug!(
            "Received Push event {} (origin: {}, from: {})",
            event.event, event.origin, event.from
        );

        if push::is_self_echo(event, &self.own_wallet_did) || !push::is_chat_event(event) {
            return;
        }

        let label = push::shorten_address(push::wallet_address(&event.from));
        let message = RelayMessage::new(Platform::WalletChat, label, event.message.content.clone());
        self.forward(&message).await;
    }

    pub async fn on_guild_message(&self, event: &GuildMessageEvent) {
        info!(
            "Received Discord message from {} in {}: {}",
            event.author_username, event.channel_id, event.content
        );

        if discord::is_bot_author(event) {
            return;
        }

        let message = RelayMessage::new(
            Platform::Guild,
            event.author_username.clone(),
            event.content.clone(),
        );
        self.forward(&message).await;
    }

    pub async fn on_instant_message(&self, event: &InstantMessageEvent) {
        info!(
            "Received Telegram message in chat {} (configured: {}) from {:?}",
            event.chat_id, self.destinations.instant_message_chat_id, event.username
        );

        if !telegram::is_relay_chat(event, self.destinations.instant_message_chat_id) {
            debug!("Message ignored - chat ID mismatch");
            return;
        }

        let Some(text) = event.text.as_ref() else {
            debug!("Ignoring Telegram message without text");
            return;
        };

        let message = RelayMessage::new(
            Platform::InstantMessage,
            telegram::sender_label(event),
            text.clone(),
        );
        self.forward(&message).await;
    }

    /// Send to both relay targets independently. A failure on one side is
    /// logged and does not stop the other.
    async fn forward(&self, message: &RelayMessage) {
        let formatted = message.formatted_text();
        debug!("Relaying: {}", formatted);

        for target in message.source_platform.relay_targets() {
            let destination = self.destinations.for_platform(target);
            match self.sender_for(target).send(&destination, &formatted).await {
                Ok(receipt) => {
                    debug!(
                        "Delivered to {} {} as {}",
                        receipt.platform, receipt.destination, receipt.message_id
                    );
                }
                Err(RelayError::DestinationNotFound { platform, destination }) => {
                    error!("{} destination {} not found, skipping", platform, destination);
                }
                Err(e) => {
                    error!(
                        "Failed to relay {} message to {}: {}",
                        message.source_platform, target, e
                    );
                }
            }
        }
    }

    /// Close the wallet-chat stream. Safe to call more than once; only the
    /// first call disconnects.
    pub async fn shutdown(&self) {
        let stream = self.wallet_chat_stream.lock().await.take();
        if let Some(stream) = stream {
            info!("Cleaning up...");
            if let Err(e) = stream.disconnect().await {
                error!("Failed to disconnect Push stream: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::platform::{push_stream, DeliveryReceipt, WalletChatMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every send; optionally fails them all.
    struct RecordingSender {
        platform: Platform,
        sent: std::sync::Mutex<Vec<(String, String)>>,
        failure: Option<fn(Platform, &str) -> RelayError>,
    }

    impl RecordingSender {
        fn new(platform: Platform) -> Arc<Self> {
            Arc::new(Self {
                platform,
                sent: std::sync::Mutex::new(Vec::new()),
                failure: None,
            })
        }

        fn failing(platform: Platform, failure: fn(Platform, &str) -> RelayError) -> Arc<Self> {
            Arc::new(Self {
                platform,
                sent: std::sync::Mutex::new(Vec::new()),
                failure: Some(failure),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSender for RecordingSender {
        fn platform(&self) -> Platform {
            self.platform
        }

        async fn send(&self, destination: &str, text: &str) -> Result<DeliveryReceipt> {
            self.sent
                .lock()
                .unwrap()
                .push((destination.to_string(), text.to_string()));
            if let Some(failure) = self.failure {
                return Err(failure(self.platform, destination));
            }
            Ok(DeliveryReceipt {
                platform: self.platform,
                destination: destination.to_string(),
                message_id: "1".to_string(),
            })
        }
    }

    #[derive(Default)]
    struct CountingStream {
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl StreamConnection for CountingStream {
        async fn disconnect(&self) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        hub: RelayHub,
        wallet_chat: Arc<RecordingSender>,
        guild: Arc<RecordingSender>,
        instant_message: Arc<RecordingSender>,
        stream: Arc<CountingStream>,
    }

    const OWN_DID: &str = "eip155:0xRelayRelayRelay";

    fn destinations() -> RelayDestinations {
        RelayDestinations {
            guild_channel_id: "9000".to_string(),
            instant_message_chat_id: -100123,
            wallet_chat_channel: "0xgroup".to_string(),
        }
    }

    fn harness_with(
        wallet_chat: Arc<RecordingSender>,
        guild: Arc<RecordingSender>,
        instant_message: Arc<RecordingSender>,
    ) -> Harness {
        let stream = Arc::new(CountingStream::default());
        let hub = RelayHub::new(
            wallet_chat.clone(),
            guild.clone(),
            instant_message.clone(),
            destinations(),
            OWN_DID,
            stream.clone(),
        );
        Harness {
            hub,
            wallet_chat,
            guild,
            instant_message,
            stream,
        }
    }

    fn harness() -> Harness {
        harness_with(
            RecordingSender::new(Platform::WalletChat),
            RecordingSender::new(Platform::Guild),
            RecordingSender::new(Platform::InstantMessage),
        )
    }

    fn push_event(origin: &str, kind: &str, content: &str) -> WalletChatEvent {
        WalletChatEvent {
            event: kind.to_string(),
            origin: origin.to_string(),
            from: "eip155:0x1234567890abcdef1234".to_string(),
            message: WalletChatMessage::text(content),
        }
    }

    fn guild_event(author: &str, is_bot: bool, content: &str) -> GuildMessageEvent {
        GuildMessageEvent {
            author_username: author.to_string(),
            author_is_bot: is_bot,
            channel_id: "9000".to_string(),
            content: content.to_string(),
        }
    }

    fn telegram_event(chat_id: i64, text: Option<&str>) -> InstantMessageEvent {
        InstantMessageEvent {
            chat_id,
            username: Some("bob".to_string()),
            first_name: Some("Bob".to_string()),
            text: text.map(str::to_string),
        }
    }

    #[test]
    fn test_formatted_text() {
        let message = RelayMessage::new(Platform::WalletChat, "0x1234...1234", "gm");
        assert_eq!(message.formatted_text(), "[Push] [0x1234...1234]\ngm");
    }

    #[tokio::test]
    async fn test_wallet_chat_relays_to_guild_and_telegram() {
        let h = harness();
        h.hub
            .on_wallet_chat_message(&push_event("other", "chat.message", "gm"))
            .await;

        let expected = "[Push] [0x1234...1234]\ngm".to_string();
        assert_eq!(h.guild.sent(), vec![("9000".to_string(), expected.clone())]);
        assert_eq!(
            h.instant_message.sent(),
            vec![("-100123".to_string(), expected)]
        );
        assert!(h.wallet_chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_chat_request_is_relayed() {
        let h = harness();
        h.hub
            .on_wallet_chat_message(&push_event("other", "chat.request", "hello"))
            .await;
        assert_eq!(h.guild.sent().len(), 1);
        assert_eq!(h.instant_message.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_self_echo_is_suppressed() {
        let h = harness();
        h.hub
            .on_wallet_chat_message(&push_event("self", "chat.message", "[Discord] [alice]\nhi"))
            .await;
        assert!(h.guild.sent().is_empty());
        assert!(h.instant_message.sent().is_empty());
    }

    #[tokio::test]
    async fn test_own_wallet_echo_without_origin_is_suppressed() {
        let h = harness();
        let payload = serde_json::json!({
            "event": "chat.message",
            "from": "eip155:0xrelayrelayrelay",
            "message": {"type": "Text", "content": "[Discord] [alice]\nhi"}
        });
        let events = push_stream::chat_events(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, "");

        h.hub.on_wallet_chat_message(&events[0]).await;
        assert!(h.guild.sent().is_empty());
        assert!(h.instant_message.sent().is_empty());
    }

    #[tokio::test]
    async fn test_self_message_without_bracket_is_relayed() {
        let h = harness();
        h.hub
            .on_wallet_chat_message(&push_event("self", "chat.message", "typed by hand"))
            .await;
        assert_eq!(h.guild.sent().len(), 1);
        assert_eq!(h.instant_message.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_non_chat_event_is_ignored() {
        let h = harness();
        h.hub
            .on_wallet_chat_message(&push_event("other", "chat.group.participant.join", "x"))
            .await;
        assert!(h.guild.sent().is_empty());
        assert!(h.instant_message.sent().is_empty());
    }

    #[tokio::test]
    async fn test_guild_message_relays_to_telegram_and_push() {
        let h = harness();
        h.hub.on_guild_message(&guild_event("alice", false, "hi")).await;

        let expected = "[Discord] [alice]\nhi".to_string();
        assert_eq!(
            h.instant_message.sent(),
            vec![("-100123".to_string(), expected.clone())]
        );
        assert_eq!(
            h.wallet_chat.sent(),
            vec![("0xgroup".to_string(), expected)]
        );
        assert!(h.guild.sent().is_empty());
    }

    #[tokio::test]
    async fn test_guild_bot_message_is_ignored() {
        let h = harness();
        h.hub.on_guild_message(&guild_event("relay", true, "hi")).await;
        assert!(h.instant_message.sent().is_empty());
        assert!(h.wallet_chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_telegram_message_relays_to_guild_and_push() {
        let h = harness();
        h.hub
            .on_instant_message(&telegram_event(-100123, Some("yo")))
            .await;

        let expected = "[Telegram] [bob]\nyo".to_string();
        assert_eq!(h.guild.sent(), vec![("9000".to_string(), expected.clone())]);
        assert_eq!(
            h.wallet_chat.sent(),
            vec![("0xgroup".to_string(), expected)]
        );
        assert!(h.instant_message.sent().is_empty());
    }

    #[tokio::test]
    async fn test_telegram_other_chat_is_dropped() {
        let h = harness();
        h.hub
            .on_instant_message(&telegram_event(42, Some("[Push] looks like a relay")))
            .await;
        assert!(h.guild.sent().is_empty());
        assert!(h.wallet_chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_telegram_without_text_is_dropped() {
        let h = harness();
        h.hub.on_instant_message(&telegram_event(-100123, None)).await;
        assert!(h.guild.sent().is_empty());
        assert!(h.wallet_chat.sent().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_does_not_block_other_target() {
        let h = harness_with(
            RecordingSender::new(Platform::WalletChat),
            RecordingSender::failing(Platform::Guild, |_, _| RelayError::other("boom")),
            RecordingSender::new(Platform::InstantMessage),
        );

        h.hub
            .on_wallet_chat_message(&push_event("other", "chat.message", "first"))
            .await;
        assert_eq!(h.guild.sent().len(), 1);
        assert_eq!(h.instant_message.sent().len(), 1);

        h.hub.on_guild_message(&guild_event("alice", false, "second")).await;
        assert_eq!(h.instant_message.sent().len(), 2);
        assert_eq!(h.wallet_chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_destination_skips_only_that_send() {
        let h = harness_with(
            RecordingSender::new(Platform::WalletChat),
            RecordingSender::failing(Platform::Guild, |platform, destination| {
                RelayError::DestinationNotFound {
                    platform,
                    destination: destination.to_string(),
                }
            }),
            RecordingSender::new(Platform::InstantMessage),
        );

        h.hub
            .on_instant_message(&telegram_event(-100123, Some("yo")))
            .await;
        assert_eq!(h.wallet_chat.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_run_processes_queue_in_order() {
        let h = harness();
        let (tx, rx) = mpsc::channel(8);
        tx.send(InboundEvent::Guild(guild_event("alice", false, "one")))
            .await
            .unwrap();
        tx.send(InboundEvent::Guild(guild_event("alice", false, "two")))
            .await
            .unwrap();
        drop(tx);

        h.hub.run(rx).await;

        let texts: Vec<String> = h.wallet_chat.sent().into_iter().map(|(_, t)| t).collect();
        assert_eq!(
            texts,
            vec!["[Discord] [alice]\none", "[Discord] [alice]\ntwo"]
        );
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_exactly_once() {
        let h = harness();
        h.hub.shutdown().await;
        h.hub.shutdown().await;
        assert_eq!(h.stream.disconnects.load(Ordering::SeqCst), 1);
    }
}
