//! Websocket presence channel: `ChannelFactory` over the relay server.
//!
//! Each `connect` opens one socket to `/api/presence` and splits it into a
//! writer task (outbound frames from the sink) and a reader task (relay
//! frames mapped to `LinkEvent`s). The reader always finishes with
//! `LinkEvent::Closed`, whatever ended the socket.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::{ChannelFactory, ChannelLink, LinkEvent, PresenceSink, TransportError};
use crate::frame::{Data, FRAME_MESSAGE, FRAME_PLAYER, FRAME_PLAYERS, Frame, Status};
use crate::model::Player;

pub const SYSCALL_TRACK: &str = "presence:track";
pub const SYSCALL_UNTRACK: &str = "presence:untrack";
pub const SYSCALL_SYNC: &str = "presence:sync";
pub const SYSCALL_CONNECTED: &str = "session:connected";

/// Build the relay URL for `topic`, converting an http(s) base to ws(s).
///
/// # Errors
///
/// Returns `TransportError::Connect` for an unsupported scheme or a topic
/// that is not URL-safe.
pub fn presence_url(base_url: &str, topic: &str, user_key: Uuid) -> Result<String, TransportError> {
    if topic.is_empty()
        || !topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TransportError::Connect(format!("invalid presence topic: {topic:?}")));
    }
    let trimmed = base_url.trim_end_matches('/');
    let base = if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_owned()
    } else {
        return Err(TransportError::Connect(format!("invalid base URL: {base_url}")));
    };
    Ok(format!("{base}/api/presence?topic={topic}&user_id={user_key}"))
}

/// Map one relay frame to a link event. Frames the link does not care
/// about map to `None`.
pub(crate) fn link_event_from_frame(frame: &Frame) -> Option<LinkEvent> {
    if frame.status == Status::Error {
        let message = frame
            .data
            .get(FRAME_MESSAGE)
            .and_then(|v| v.as_str())
            .unwrap_or("presence relay error");
        return Some(LinkEvent::Error(message.to_owned()));
    }
    match frame.syscall.as_str() {
        SYSCALL_SYNC => {
            let players = frame.data.get(FRAME_PLAYERS).cloned().unwrap_or_default();
            match serde_json::from_value::<Vec<Player>>(players) {
                Ok(players) => Some(LinkEvent::Sync(players)),
                Err(e) => Some(LinkEvent::Error(format!("malformed presence snapshot: {e}"))),
            }
        }
        SYSCALL_CONNECTED => {
            debug!(from = ?frame.data.get("client_id"), "presence relay session connected");
            None
        }
        _ => None,
    }
}

fn link_event_from_text(text: &str) -> Option<LinkEvent> {
    match serde_json::from_str::<Frame>(text) {
        Ok(frame) => link_event_from_frame(&frame),
        Err(e) => Some(LinkEvent::Error(format!("invalid relay frame: {e}"))),
    }
}

// =============================================================================
// FACTORY
// =============================================================================

pub struct WsChannelFactory {
    base_url: String,
}

impl WsChannelFactory {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }
}

enum Outbound {
    Frame(Frame),
    Close,
}

#[async_trait::async_trait]
impl ChannelFactory for WsChannelFactory {
    async fn connect(&self, topic: &str, user_key: Uuid) -> Result<ChannelLink, TransportError> {
        let url = presence_url(&self.base_url, topic, user_key)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        info!(topic, %user_key, "presence relay connected");
        let (mut write, mut read) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(error = %e, "presence frame serialize failed");
                                continue;
                            }
                        };
                        if write.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let reader_topic = topic.to_owned();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = link_event_from_text(text.as_str())
                            && event_tx.send(event).is_err()
                        {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(topic = %reader_topic, error = %e, "presence relay read failed");
                        break;
                    }
                }
            }
            debug!(topic = %reader_topic, "presence relay socket closed");
            let _ = event_tx.send(LinkEvent::Closed);
        });

        let sink = WsSink { outbound: out_tx, topic: topic.to_owned() };
        Ok(ChannelLink { sink: std::sync::Arc::new(sink), events: event_rx })
    }
}

struct WsSink {
    outbound: mpsc::UnboundedSender<Outbound>,
    topic: String,
}

impl WsSink {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound
            .send(Outbound::Frame(frame.with_topic(self.topic.clone())))
            .map_err(|_| TransportError::Closed)
    }
}

impl PresenceSink for WsSink {
    fn track(&self, player: &Player) -> Result<(), TransportError> {
        let payload = serde_json::to_value(player).map_err(|e| TransportError::Channel(e.to_string()))?;
        self.send(Frame::request(SYSCALL_TRACK, Data::new()).with_data(FRAME_PLAYER, payload))
    }

    fn untrack(&self) -> Result<(), TransportError> {
        self.send(Frame::request(SYSCALL_UNTRACK, Data::new()))
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}
