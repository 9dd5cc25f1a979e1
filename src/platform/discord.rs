use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

use super::{
    DeliveryReceipt, EventSink, GuildMessageEvent, InboundEvent, InboundSource, OutboundSender,
    Platform,
};
use crate::config::DiscordConfig;
use crate::error::{RelayError, Result};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Loop guard: the relay posts into the guild as a bot, so bot-authored
/// messages are never relayed.
pub fn is_bot_author(event: &GuildMessageEvent) -> bool {
    event.author_is_bot
}

#[derive(Debug, Deserialize)]
struct GatewayEvent {
    op: u8,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    id: String,
    username: String,
}

/// Turn a `MESSAGE_CREATE` payload into a guild event.
pub fn parse_message_create(data: &Value) -> Option<GuildMessageEvent> {
    let author = data.get("author")?;
    Some(GuildMessageEvent {
        author_username: author.get("username")?.as_str()?.to_string(),
        author_is_bot: author
            .get("bot")
            .and_then(|b| b.as_bool())
            .unwrap_or(false),
        channel_id: data.get("channel_id")?.as_str()?.to_string(),
        content: data
            .get("content")
            .and_then(|c| c.as_str())
            .unwrap_or_default()
            .to_string(),
    })
}

/// Discord bot connection: REST for sending, gateway websocket for receiving.
pub struct DiscordClient {
    client: Client,
    config: DiscordConfig,
}

impl DiscordClient {
    pub fn new(config: DiscordConfig, timeout: Duration) -> Result<Self> {
        if config.bot_token.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "Discord bot token cannot be empty".into(),
            ));
        }
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, config })
    }

    fn bot_auth(&self) -> String {
        format!("Bot {}", self.config.bot_token)
    }

    /// Log in over REST to validate the token.
    pub async fn login(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{DISCORD_API_BASE}/users/@me"))
            .header("Authorization", self.bot_auth())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::other(format!(
                "Discord login failed ({status}): {body}"
            )));
        }

        let user: CurrentUser = response.json().await?;
        info!("Logged in to Discord as {} ({})", user.username, user.id);
        Ok(())
    }

    async fn run_gateway(&self, sink: &EventSink) -> Result<()> {
        let (mut ws, _) = connect_async(DISCORD_GATEWAY_URL).await?;
        info!("Connected to Discord Gateway");

        let hello = loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => break text,
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err.into()),
                None => return Err(RelayError::stream("gateway closed before Hello")),
            }
        };
        let hello: GatewayEvent = serde_json::from_str(&hello)?;
        let heartbeat_interval_ms = hello
            .d
            .as_ref()
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(|v| v.as_u64())
            .unwrap_or(41250);

        let identify = json!({
            "op": 2,
            "d": {
                "token": self.config.bot_token,
                "intents": self.config.intents,
                "properties": {
                    "os": "linux",
                    "browser": "omnirelay",
                    "device": "omnirelay"
                }
            }
        });
        ws.send(WsMessage::Text(identify.to_string())).await?;

        let mut sequence: Option<u64> = None;
        let mut heartbeat = interval(Duration::from_millis(heartbeat_interval_ms));
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let hb = json!({ "op": 1, "d": sequence });
                    ws.send(WsMessage::Text(hb.to_string())).await?;
                    debug!("Sent heartbeat");
                }
                frame = ws.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            let event: GatewayEvent = match serde_json::from_str(&text) {
                                Ok(e) => e,
                                Err(err) => {
                                    warn!("Failed to parse gateway event: {}", err);
                                    continue;
                                }
                            };
                            if let Some(s) = event.s {
                                sequence = Some(s);
                            }
                            match event.op {
                                0 => self.handle_dispatch(event.t.as_deref(), event.d.as_ref(), sink)?,
                                1 => {
                                    let hb = json!({ "op": 1, "d": sequence });
                                    ws.send(WsMessage::Text(hb.to_string())).await?;
                                }
                                7 => {
                                    info!("Discord requested reconnect");
                                    return Ok(());
                                }
                                9 => {
                                    warn!("Invalid Discord session, will reconnect");
                                    return Ok(());
                                }
                                11 => debug!("Heartbeat ACK"),
                                op => debug!("Unhandled gateway opcode {}", op),
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Discord gateway closed");
                            return Ok(());
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_dispatch(
        &self,
        event_type: Option<&str>,
        data: Option<&Value>,
        sink: &EventSink,
    ) -> Result<()> {
        match (event_type, data) {
            (Some("READY"), _) => info!("Discord bot is READY"),
            (Some("MESSAGE_CREATE"), Some(d)) => match parse_message_create(d) {
                // never block here: the caller is the heartbeat loop
                Some(event) => sink.try_deliver(InboundEvent::Guild(event))?,
                None => warn!("Malformed MESSAGE_CREATE payload"),
            },
            (t, _) => debug!("Received dispatch event {:?}", t),
        }
        Ok(())
    }
}

#[async_trait]
impl InboundSource for DiscordClient {
    fn platform(&self) -> Platform {
        Platform::Guild
    }

    /// Keep a gateway session open, reconnecting after drops.
    async fn subscribe(self: Arc<Self>, sink: EventSink) -> Result<()> {
        loop {
            match self.run_gateway(&sink).await {
                Ok(()) => info!("Gateway disconnected, reconnecting in 5s..."),
                Err(RelayError::SinkClosed) => return Ok(()),
                Err(err) => error!("Gateway error, reconnecting in 5s: {}", err),
            }
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }
}

#[async_trait]
impl OutboundSender for DiscordClient {
    fn platform(&self) -> Platform {
        Platform::Guild
    }

    async fn send(&self, destination: &str, text: &str) -> Result<DeliveryReceipt> {
        let response = self
            .client
            .post(format!("{DISCORD_API_BASE}/channels/{destination}/messages"))
            .header("Authorization", self.bot_auth())
            .json(&json!({ "content": text }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(RelayError::DestinationNotFound {
                platform: Platform::Guild,
                destination: destination.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::other(format!(
                "Discord send message failed ({status}): {body}"
            )));
        }

        let created: CreatedMessage = response.json().await?;
        Ok(DeliveryReceipt {
            platform: Platform::Guild,
            destination: destination.to_string(),
            message_id: created.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_create() {
        let data = json!({
            "id": "1",
            "channel_id": "9000",
            "content": "hi",
            "author": { "id": "7", "username": "alice" }
        });
        let event = parse_message_create(&data).unwrap();
        assert_eq!(event.author_username, "alice");
        assert_eq!(event.channel_id, "9000");
        assert_eq!(event.content, "hi");
        assert!(!is_bot_author(&event));
    }

    #[test]
    fn test_bot_author_detected() {
        let data = json!({
            "channel_id": "9000",
            "content": "[Telegram] [bob]\nyo",
            "author": { "id": "8", "username": "relay", "bot": true }
        });
        assert!(is_bot_author(&parse_message_create(&data).unwrap()));
    }

    #[test]
    fn test_missing_author_is_rejected() {
        let data = json!({ "channel_id": "9000", "content": "hi" });
        assert!(parse_message_create(&data).is_none());
    }

    #[test]
    fn test_missing_content_is_empty() {
        let data = json!({ "channel_id": "9000", "author": { "username": "alice" } });
        assert_eq!(parse_message_create(&data).unwrap().content, "");
    }

    #[test]
    fn test_empty_token_rejected() {
        let config = DiscordConfig {
            bot_token: String::new(),
            channel_id: "1".into(),
            intents: 33281,
        };
        assert!(DiscordClient::new(config, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_dispatch_does_not_wait_on_full_queue() {
        let client = DiscordClient::new(
            DiscordConfig {
                bot_token: "token".into(),
                channel_id: "9000".into(),
                intents: 33281,
            },
            Duration::from_secs(1),
        )
        .unwrap();
        let (sink, mut rx) = EventSink::channel(1);
        let data = json!({
            "channel_id": "9000",
            "content": "hi",
            "author": { "username": "alice" }
        });

        client.handle_dispatch(Some("MESSAGE_CREATE"), Some(&data), &sink).unwrap();
        client.handle_dispatch(Some("MESSAGE_CREATE"), Some(&data), &sink).unwrap();

        assert!(matches!(rx.recv().await, Some(InboundEvent::Guild(_))));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(matches!(
            client.handle_dispatch(Some("MESSAGE_CREATE"), Some(&data), &sink),
            Err(RelayError::SinkClosed)
        ));
    }
}
