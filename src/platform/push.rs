use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::wallet::Wallet;
use super::{DeliveryReceipt, OutboundSender, Platform, WalletChatEvent, WalletChatMessage};
use crate::config::PushConfig;
use crate::error::{RelayError, Result};

/// Push's name for a `personal_sign` signature.
const SIG_TYPE: &str = "eip191";

/// Stream event kinds that carry a chat message worth relaying.
const CHAT_EVENTS: [&str; 2] = ["chat.request", "chat.message"];

/// Loop guard: a message the relay itself posted comes back on the stream
/// from its own wallet with a `[Platform]` prefix. The sender is compared
/// against `own_did` because the backend does not always fill in `origin`.
///
/// Note this also drops anything the wallet's owner types by hand that starts
/// with `[`; the stream gives no other way to tell relay posts apart.
pub fn is_self_echo(event: &WalletChatEvent, own_did: &str) -> bool {
    let from_self = event.origin == "self"
        || wallet_address(&event.from).eq_ignore_ascii_case(wallet_address(own_did));
    from_self && event.message.content.starts_with('[')
}

pub fn is_chat_event(event: &WalletChatEvent) -> bool {
    CHAT_EVENTS.contains(&event.event.as_str())
}

/// Strip the CAIP prefix from `eip155:0xabc...` (or `eip155:1:0xabc...`).
pub fn wallet_address(from: &str) -> &str {
    from.rsplit(':').next().unwrap_or(from)
}

/// `0x1234567890abcdef1234` -> `0x1234...1234`. Addresses too short to
/// shorten are returned unchanged.
pub fn shorten_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() <= 10 {
        return address.to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest<'a> {
    #[serde(rename = "fromDID")]
    from_did: String,
    #[serde(rename = "toDID")]
    to_did: &'a str,
    message_type: &'a str,
    message_obj: WalletChatMessage,
    signature: String,
    sig_type: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateGroupRequest<'a> {
    group_name: &'a str,
    group_description: &'a str,
    group_image: &'a str,
    members: Vec<String>,
    admins: Vec<String>,
    is_public: bool,
    group_creator: String,
    signature: String,
    sig_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageResponse {
    #[serde(default)]
    cid: Option<String>,
    #[serde(default)]
    link: Option<String>,
}

/// Options for a new Push group.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub description: String,
    /// Base64 image payload
    pub image: String,
    pub is_public: bool,
}

/// REST client for the Push chat API, signing each payload with the
/// relay's wallet.
pub struct PushClient {
    client: Client,
    config: PushConfig,
    wallet: Wallet,
}

impl PushClient {
    pub fn new(config: PushConfig, timeout: Duration) -> Result<Self> {
        if config.private_key.trim().is_empty() {
            return Err(RelayError::InvalidConfig(
                "Push signing key cannot be empty".into(),
            ));
        }
        let wallet = Wallet::from_private_key(&config.private_key)?;
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            config,
            wallet,
        })
    }

    /// EIP-191 signature over the JSON the request commits to.
    fn sign(&self, payload: &Value) -> Result<String> {
        self.wallet.sign_message(payload.to_string().as_bytes())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.effective_api_url().trim_end_matches('/'), path)
    }

    /// POST a JSON body; a 404 means `target` (chat or group) does not exist.
    async fn post(&self, url: &str, body: &impl Serialize, target: &str) -> Result<Value> {
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Err(RelayError::DestinationNotFound {
                platform: Platform::WalletChat,
                destination: target.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::other(format!(
                "Push API error ({status}): {body}"
            )));
        }
        Ok(response.json().await?)
    }

    /// Create a group owned by the relay's wallet; returns the API's JSON.
    pub async fn create_group(&self, name: &str, options: &GroupOptions) -> Result<Value> {
        let creator = self.wallet.did();
        let signature = self.sign(&serde_json::json!({
            "groupName": name,
            "groupDescription": options.description,
            "groupImage": options.image,
            "isPublic": options.is_public,
            "groupCreator": creator,
        }))?;
        let request = CreateGroupRequest {
            group_name: name,
            group_description: &options.description,
            group_image: &options.image,
            members: Vec::new(),
            admins: Vec::new(),
            is_public: options.is_public,
            group_creator: creator,
            signature,
            sig_type: SIG_TYPE,
        };
        self.post(&self.url("/v1/chat/groups"), &request, name).await
    }
}

#[async_trait]
impl OutboundSender for PushClient {
    fn platform(&self) -> Platform {
        Platform::WalletChat
    }

    async fn send(&self, destination: &str, text: &str) -> Result<DeliveryReceipt> {
        let from = self.wallet.did();
        let message = WalletChatMessage::text(text);
        let signature = self.sign(&serde_json::json!({
            "fromDID": from,
            "toDID": destination,
            "messageObj": message,
        }))?;
        let request = SendMessageRequest {
            from_did: from,
            to_did: destination,
            message_type: "Text",
            message_obj: message,
            signature,
            sig_type: SIG_TYPE,
        };

        let value = self
            .post(&self.url("/v1/chat/message"), &request, destination)
            .await?;
        debug!("Push send response: {}", value);

        let parsed: SendMessageResponse = serde_json::from_value(value)?;
        Ok(DeliveryReceipt {
            platform: Platform::WalletChat,
            destination: destination.to_string(),
            message_id: parsed.cid.or(parsed.link).unwrap_or_default(),
        })
    }
}
