mod config;
mod error;
mod platform;
mod relay;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, PushConfig};
use crate::platform::discord::DiscordClient;
use crate::platform::push::{GroupOptions, PushClient};
use crate::platform::push_stream::PushStream;
use crate::platform::telegram::TelegramClient;
use crate::platform::{EventSink, InboundSource, OutboundSender, StreamConnection};
use crate::relay::{RelayDestinations, RelayHub};

/// Inbound events waiting for the hub.
const EVENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Parser)]
#[command(author, version, about = "Mirror one conversation across Push, Discord and Telegram")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, short, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the relay (default)
    Run,
    /// Create a public Push group owned by the relay's wallet
    CreateGroup {
        #[arg(long, default_value = "Omni Push Group")]
        name: String,
        #[arg(long, default_value = "This is an example group.")]
        description: String,
        /// File whose contents become the group image (base64-encoded)
        #[arg(long, default_value = "pushImage.txt")]
        image: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,omnirelay=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&cli.config).await,
        Command::CreateGroup {
            name,
            description,
            image,
        } => create_group(&cli.config, &name, &description, &image).await,
    };

    if let Err(e) = &outcome {
        error!("omnirelay failed: {:#}", e);
    }
    outcome
}

async fn run(config_path: &Path) -> Result<()> {
    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(config_path)?;

    info!("Configuration loaded successfully");
    info!("  Discord channel: {}", config.discord.channel_id);
    info!("  Telegram chat: {}", config.telegram.chat_id);
    info!("  Push channel: {}", config.push.channel_address);
    info!("  Push environment: {}", config.push.env);

    let timeout = Duration::from_secs(config.relay.send_timeout_secs);

    // Ctrl-C during startup still closes whatever stream is already open.
    let mut connected_stream = None;
    let started = tokio::select! {
        started = start_clients(&config, timeout, &mut connected_stream) => Some(started),
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt signal")?;
            None
        }
    };
    let clients = match started {
        Some(Ok(clients)) => clients,
        Some(Err(e)) => {
            disconnect_stream(connected_stream).await;
            return Err(e);
        }
        None => {
            info!("Interrupted during startup");
            disconnect_stream(connected_stream).await;
            return Ok(());
        }
    };
    let Clients {
        push,
        stream,
        telegram,
        discord,
    } = clients;

    let destinations = RelayDestinations {
        guild_channel_id: config.discord.channel_id.clone(),
        instant_message_chat_id: config.telegram.chat_id,
        wallet_chat_channel: config.push.channel_address.clone(),
    };

    let senders: [Arc<dyn OutboundSender>; 3] = [push, discord.clone(), telegram.clone()];
    for sender in &senders {
        info!("Relaying to {}", sender.platform());
    }
    let [wallet_chat, guild, instant_message] = senders;
    let hub = RelayHub::new(
        wallet_chat,
        guild,
        instant_message,
        destinations,
        config.push.did(),
        stream.clone(),
    );

    let (sink, events) = EventSink::channel(EVENT_QUEUE_CAPACITY);
    spawn_source(stream, sink.clone());
    spawn_source(telegram, sink.clone());
    spawn_source(discord, sink);

    info!("Relay is running");
    tokio::select! {
        _ = hub.run(events) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for interrupt signal")?;
        }
    }

    hub.shutdown().await;
    Ok(())
}

struct Clients {
    push: Arc<PushClient>,
    stream: Arc<PushStream>,
    telegram: Arc<TelegramClient>,
    discord: Arc<DiscordClient>,
}

/// Connect and log in everywhere. Any failure here is fatal: the process
/// exits non-zero. The stream is parked in `connected_stream` as soon as it
/// is open so the caller can close it if a later step is cut short.
async fn start_clients(
    config: &Config,
    timeout: Duration,
    connected_stream: &mut Option<Arc<PushStream>>,
) -> Result<Clients> {
    let push = Arc::new(PushClient::new(config.push.clone(), timeout)?);
    let stream = PushStream::connect(&config.push)
        .await
        .context("Failed to initialize Push Protocol stream")?;
    *connected_stream = Some(stream.clone());

    let telegram = Arc::new(TelegramClient::new(&config.telegram.bot_token)?);
    telegram
        .login()
        .await
        .context("Failed to initialize Telegram bot")?;

    let discord = Arc::new(DiscordClient::new(config.discord.clone(), timeout)?);
    discord
        .login()
        .await
        .context("Failed to log in to Discord")?;

    Ok(Clients {
        push,
        stream,
        telegram,
        discord,
    })
}

async fn disconnect_stream(stream: Option<Arc<PushStream>>) {
    if let Some(stream) = stream {
        info!("Cleaning up...");
        if let Err(e) = stream.disconnect().await {
            error!("Failed to disconnect Push stream: {}", e);
        }
    }
}

fn spawn_source<S>(source: Arc<S>, sink: EventSink)
where
    S: InboundSource + 'static,
{
    let platform = source.platform();
    tokio::spawn(async move {
        if let Err(e) = source.subscribe(sink).await {
            error!("{} event source stopped: {}", platform, e);
        }
    });
}

async fn create_group(
    config_path: &Path,
    name: &str,
    description: &str,
    image: &Path,
) -> Result<()> {
    let config = PushConfig::load(config_path)?;
    let image_bytes = std::fs::read(image)
        .with_context(|| format!("Failed to read group image: {}", image.display()))?;

    let client = PushClient::new(config, Duration::from_secs(30))?;
    let options = GroupOptions {
        description: description.to_string(),
        image: base64::engine::general_purpose::STANDARD.encode(image_bytes),
        is_public: true,
    };

    info!("Creating Push group '{}'", name);
    let group = client
        .create_group(name, &options)
        .await
        .with_context(|| format!("Failed to create Push group '{}'", name))?;

    println!("{}", serde_json::to_string_pretty(&group)?);
    Ok(())
}
