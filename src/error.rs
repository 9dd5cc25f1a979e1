use thiserror::Error;

use crate::platform::Platform;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{platform} destination `{destination}` not found")]
    DestinationNotFound {
        platform: Platform,
        destination: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Telegram request failed: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay hub is no longer receiving events")]
    SinkClosed,

    #[error("stream protocol error: {0}")]
    Stream(String),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream(message.into())
    }
}
