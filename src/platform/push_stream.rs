//! Push chat stream over a Socket.IO (Engine.IO v4) websocket.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{EventSink, InboundEvent, InboundSource, Platform, StreamConnection, WalletChatEvent};
use crate::config::PushConfig;
use crate::error::{RelayError, Result};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type Writer<S> = SplitSink<WebSocketStream<S>, WsMessage>;
type Reader<S> = SplitStream<WebSocketStream<S>>;

/// Opens a fresh websocket to the stream endpoint.
type Dial<S> = Box<dyn Fn() -> BoxFuture<'static, Result<WebSocketStream<S>>> + Send + Sync>;

/// One Engine.IO / Socket.IO packet on the default namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0{...}` handshake from the server
    Open(Value),
    /// `2`
    Ping,
    /// `3`
    Pong,
    /// `40` / `40{...}` namespace connected
    Connect,
    /// `41`
    Disconnect,
    /// `42["name", payload]`
    Event { name: String, payload: Value },
    /// `44{...}` namespace connect refused
    ConnectError(Value),
    Other(String),
}

pub fn parse_packet(frame: &str) -> Packet {
    if let Some(rest) = frame.strip_prefix("42") {
        // Socket.IO allows an ack id between the type and the array
        let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
        if let Ok(Value::Array(mut items)) = serde_json::from_str::<Value>(rest) {
            if let Some(Value::String(_)) = items.first() {
                let name = items.remove(0).as_str().unwrap_or_default().to_string();
                let payload = if items.is_empty() {
                    Value::Null
                } else {
                    items.remove(0)
                };
                return Packet::Event { name, payload };
            }
        }
        return Packet::Other(frame.to_string());
    }
    if frame.starts_with("40") {
        return Packet::Connect;
    }
    if frame.starts_with("41") {
        return Packet::Disconnect;
    }
    if let Some(rest) = frame.strip_prefix("44") {
        return Packet::ConnectError(serde_json::from_str(rest).unwrap_or(Value::Null));
    }
    if let Some(rest) = frame.strip_prefix('0') {
        return Packet::Open(serde_json::from_str(rest).unwrap_or(Value::Null));
    }
    match frame {
        "2" => Packet::Ping,
        "3" => Packet::Pong,
        _ => Packet::Other(frame.to_string()),
    }
}

/// Pull chat events out of a stream event payload. The backend sends either
/// a single event object or a batch in an array.
pub fn chat_events(payload: &Value) -> Vec<WalletChatEvent> {
    let items: Vec<&Value> = match payload {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<WalletChatEvent>(item.clone()) {
            Ok(event) => Some(event),
            Err(err) => {
                debug!("Skipping non-chat stream payload: {}", err);
                None
            }
        })
        .collect()
}

/// What the read loop does with one text frame.
#[derive(Debug)]
pub enum FrameAction {
    /// Write this frame back
    Reply(&'static str),
    Deliver(Vec<WalletChatEvent>),
    /// The server closed the namespace
    Close,
    Ignore,
}

pub fn frame_action(frame: &str) -> FrameAction {
    match parse_packet(frame) {
        Packet::Ping => FrameAction::Reply("3"),
        Packet::Event { name, payload } => {
            debug!("Push stream event {}", name);
            FrameAction::Deliver(chat_events(&payload))
        }
        Packet::Disconnect => FrameAction::Close,
        other => {
            debug!("Unhandled stream packet: {:?}", other);
            FrameAction::Ignore
        }
    }
}

/// Build the connect URL, identifying the relay's wallet to the backend.
fn stream_url(config: &PushConfig) -> String {
    let base = config.effective_stream_url();
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}did={}&mode=chat", base, sep, config.did())
}

/// Read frames until one carries text.
async fn next_packet<S>(reader: &mut Reader<S>) -> Result<Packet>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = reader.next().await {
        match frame? {
            WsMessage::Text(text) => return Ok(parse_packet(&text)),
            WsMessage::Close(frame) => {
                return Err(RelayError::stream(format!("closed by server: {:?}", frame)))
            }
            _ => {}
        }
    }
    Err(RelayError::stream("stream ended before handshake"))
}

/// Complete the Engine.IO open and the namespace connect on a fresh socket.
async fn handshake<S>(ws: WebSocketStream<S>) -> Result<(Writer<S>, Reader<S>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws.split();

    match next_packet(&mut reader).await? {
        Packet::Open(handshake) => debug!("Push stream handshake: {}", handshake),
        other => {
            return Err(RelayError::stream(format!(
                "expected open packet, got {:?}",
                other
            )))
        }
    }

    writer.send(WsMessage::Text("40".to_string())).await?;
    loop {
        match next_packet(&mut reader).await? {
            Packet::Connect => break,
            Packet::Ping => writer.send(WsMessage::Text("3".to_string())).await?,
            Packet::ConnectError(reason) => {
                return Err(RelayError::stream(format!(
                    "stream connection refused: {}",
                    reason
                )))
            }
            other => debug!("Ignoring packet during handshake: {:?}", other),
        }
    }
    Ok((writer, reader))
}

/// The relay's live chat subscription on Push. Reconnects after the server
/// drops it, until `disconnect` is called.
pub struct PushStream<S = MaybeTlsStream<TcpStream>> {
    dial: Dial<S>,
    reconnect_delay: Duration,
    writer: Mutex<Option<Writer<S>>>,
    reader: Mutex<Option<Reader<S>>>,
    closed: watch::Sender<bool>,
}

impl PushStream {
    /// Open the websocket and complete the namespace handshake.
    pub async fn connect(config: &PushConfig) -> Result<Arc<Self>> {
        let url = stream_url(config);
        let dial: Dial<MaybeTlsStream<TcpStream>> = Box::new(move || {
            let url = url.clone();
            async move {
                let (ws, _) = connect_async(url.as_str()).await?;
                Ok::<_, RelayError>(ws)
            }
            .boxed()
        });
        Self::open(dial, RECONNECT_DELAY).await
    }
}

impl<S> PushStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn open(dial: Dial<S>, reconnect_delay: Duration) -> Result<Arc<Self>> {
        let (writer, reader) = handshake(dial().await?).await?;
        info!("Push Protocol stream connected");

        let (closed, _) = watch::channel(false);
        Ok(Arc::new(Self {
            dial,
            reconnect_delay,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            closed,
        }))
    }

    async fn send_frame(&self, frame: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => Ok(w.send(WsMessage::Text(frame.to_string())).await?),
            None => Err(RelayError::stream("stream already disconnected")),
        }
    }

    /// Feed frames into `sink` until the connection ends or `closed` flips.
    /// `Ok` means the connection is gone; the caller decides whether to
    /// redial.
    async fn pump(
        &self,
        reader: &mut Reader<S>,
        sink: &EventSink,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = closed.changed() => return Ok(()),
                frame = reader.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => match frame_action(&text) {
                            FrameAction::Reply(reply) => self.send_frame(reply).await?,
                            FrameAction::Deliver(events) => {
                                for event in events {
                                    // the server drops us if pings go unanswered
                                    sink.try_deliver(InboundEvent::WalletChat(event))?;
                                }
                            }
                            FrameAction::Close => {
                                info!("Push stream namespace closed by server");
                                return Ok(());
                            }
                            FrameAction::Ignore => {}
                        },
                        Some(Ok(WsMessage::Close(frame))) => {
                            info!(?frame, "Push stream closed by server");
                            return Ok(());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Dial until a handshake succeeds. `None` once the stream is closed.
    async fn redial(&self, closed: &mut watch::Receiver<bool>) -> Option<Reader<S>> {
        loop {
            if *closed.borrow() {
                return None;
            }
            tokio::select! {
                _ = closed.changed() => return None,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }

            let connection = match (self.dial)().await {
                Ok(ws) => handshake(ws).await,
                Err(err) => Err(err),
            };
            let (writer, reader) = match connection {
                Ok(parts) => parts,
                Err(err) => {
                    warn!("Push stream reconnect failed: {}", err);
                    continue;
                }
            };

            let mut slot = self.writer.lock().await;
            if *closed.borrow() {
                drop(slot);
                let mut writer = writer;
                writer.close().await.ok();
                return None;
            }
            if let Some(mut stale) = slot.replace(writer) {
                stale.close().await.ok();
            }
            info!("Push Protocol stream reconnected");
            return Some(reader);
        }
    }
}

#[async_trait]
impl<S> InboundSource for PushStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn platform(&self) -> Platform {
        Platform::WalletChat
    }

    async fn subscribe(self: Arc<Self>, sink: EventSink) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| RelayError::stream("stream already subscribed"))?;
        let mut closed = self.closed.subscribe();

        loop {
            if *closed.borrow() {
                break;
            }
            match self.pump(&mut reader, &sink, &mut closed).await {
                Ok(()) => {}
                Err(RelayError::SinkClosed) => return Ok(()),
                Err(err) => warn!("Push stream error: {}", err),
            }
            if *closed.borrow() {
                break;
            }

            info!(
                "Push stream lost, reconnecting in {}s...",
                self.reconnect_delay.as_secs()
            );
            match self.redial(&mut closed).await {
                Some(fresh) => reader = fresh,
                None => break,
            }
        }

        info!("Push Protocol stream disconnected");
        Ok(())
    }
}

#[async_trait]
impl<S> StreamConnection for PushStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn disconnect(&self) -> Result<()> {
        // flip `closed` under the writer lock so a concurrent redial sees it
        let writer = {
            let mut slot = self.writer.lock().await;
            self.closed.send_replace(true);
            slot.take()
        };
        if let Some(mut writer) = writer {
            writer.send(WsMessage::Text("41".to_string())).await.ok();
            writer.close().await?;
        }
        Ok(())
    }
}
