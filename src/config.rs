use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::platform::wallet::Wallet;

/// Push Protocol network selector (`PUSH_ENV`).
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushEnv {
    #[default]
    Prod,
    Staging,
    Dev,
}

impl std::fmt::Display for PushEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PushEnv::Prod => write!(f, "prod"),
            PushEnv::Staging => write!(f, "staging"),
            PushEnv::Dev => write!(f, "dev"),
        }
    }
}

impl std::str::FromStr for PushEnv {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Ok(PushEnv::Prod),
            "staging" => Ok(PushEnv::Staging),
            "dev" => Ok(PushEnv::Dev),
            other => anyhow::bail!("unknown Push environment '{}' (expected prod, staging or dev)", other),
        }
    }
}

impl PushEnv {
    fn default_api_url(self) -> &'static str {
        match self {
            PushEnv::Prod => "https://backend.epns.io/apis",
            PushEnv::Staging => "https://backend-staging.epns.io/apis",
            PushEnv::Dev => "https://backend-dev.epns.io/apis",
        }
    }

    fn default_stream_url(self) -> &'static str {
        match self {
            PushEnv::Prod => "wss://backend.epns.io/socket.io/?EIO=4&transport=websocket",
            PushEnv::Staging => "wss://backend-staging.epns.io/socket.io/?EIO=4&transport=websocket",
            PushEnv::Dev => "wss://backend-dev.epns.io/socket.io/?EIO=4&transport=websocket",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub discord: DiscordConfig,
    pub telegram: TelegramConfig,
    pub push: PushConfig,
    pub relay: RelaySettings,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub channel_id: String,
    pub intents: u64,
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: i64,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub private_key: String,
    /// Wallet address the relay chats as, derived from `private_key`
    pub account: String,
    pub channel_address: String,
    pub env: PushEnv,
    pub api_url: String,
    pub stream_url: String,
}

impl PushConfig {
    /// Returns the effective REST base URL: the configured one, or the
    /// canonical URL for the selected environment.
    pub fn effective_api_url(&self) -> &str {
        if !self.api_url.is_empty() {
            return &self.api_url;
        }
        self.env.default_api_url()
    }

    pub fn effective_stream_url(&self) -> &str {
        if !self.stream_url.is_empty() {
            return &self.stream_url;
        }
        self.env.default_stream_url()
    }

    /// CAIP-10 identifier of the relay's own wallet.
    pub fn did(&self) -> String {
        format!("eip155:{}", self.account)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelaySettings {
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// On-disk layout of `config.toml`. Every value is optional here because the
/// environment may supply it instead.
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub discord: DiscordSection,
    #[serde(default)]
    pub telegram: TelegramSection,
    #[serde(default)]
    pub push: PushSection,
    #[serde(default)]
    pub relay: RelaySettings,
}

#[derive(Debug, Deserialize)]
pub struct DiscordSection {
    pub bot_token: Option<String>,
    pub channel_id: Option<String>,
    #[serde(default = "default_discord_intents")]
    pub intents: u64,
}

impl Default for DiscordSection {
    fn default() -> Self {
        Self {
            bot_token: None,
            channel_id: None,
            intents: default_discord_intents(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
    pub chat_id: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PushSection {
    pub private_key: Option<String>,
    pub channel_address: Option<String>,
    pub env: Option<PushEnv>,
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub stream_url: String,
}

/// GUILDS | GUILD_MESSAGES | MESSAGE_CONTENT
fn default_discord_intents() -> u64 {
    1 | 512 | 32768
}

fn default_send_timeout_secs() -> u64 {
    30
}

/// Pick the environment value if set and non-empty, else the file value.
fn pick<F>(env: &F, key: &str, file: Option<&String>) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .filter(|v| !v.trim().is_empty())
        .or_else(|| file.filter(|v| !v.trim().is_empty()).cloned())
        .with_context(|| format!("Missing required setting {}", key))
}

impl FileConfig {
    /// Read `config.toml`; a missing file is not an error since everything
    /// can come from the environment.
    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }
}

impl PushConfig {
    pub fn from_sources<F>(section: &PushSection, env: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let push_env = match env("PUSH_ENV").filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw.parse()?,
            None => section.env.unwrap_or_default(),
        };
        let private_key = pick(env, "PUSH_PRIVATE_KEY", section.private_key.as_ref())?;
        let wallet = Wallet::from_private_key(&private_key).context("Invalid PUSH_PRIVATE_KEY")?;
        Ok(Self {
            account: wallet.address().to_string(),
            private_key,
            channel_address: pick(env, "PUSH_CHANNEL_ADDRESS", section.channel_address.as_ref())?,
            env: push_env,
            api_url: section.api_url.clone(),
            stream_url: section.stream_url.clone(),
        })
    }

    /// Load only the Push settings (used by `create-group`).
    pub fn load(path: &Path) -> Result<Self> {
        let file = FileConfig::read(path)?;
        Self::from_sources(&file.push, &process_env)
    }
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let file = FileConfig::read(path)?;
        Self::from_sources(file, &process_env)
    }

    /// Merge file values with environment lookups; the environment wins.
    pub fn from_sources<F>(file: FileConfig, env: &F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let chat_id_file = file.telegram.chat_id.map(|id| id.to_string());
        let chat_id_raw = pick(env, "TELEGRAM_CHAT_ID", chat_id_file.as_ref())?;
        let chat_id: i64 = chat_id_raw
            .trim()
            .parse()
            .with_context(|| format!("TELEGRAM_CHAT_ID is not a valid chat id: {}", chat_id_raw))?;

        Ok(Self {
            discord: DiscordConfig {
                bot_token: pick(env, "DISCORD_TOKEN", file.discord.bot_token.as_ref())?,
                channel_id: pick(env, "DISCORD_CHANNEL_ID", file.discord.channel_id.as_ref())?,
                intents: file.discord.intents,
            },
            telegram: TelegramConfig {
                bot_token: pick(env, "TELEGRAM_TOKEN", file.telegram.bot_token.as_ref())?,
                chat_id,
            },
            push: PushConfig::from_sources(&file.push, env)?,
            relay: file.relay,
        })
    }
}
