//! Control-channel link from the studio to the broadcast gateway.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::DEFAULT_HEARTBEAT_INTERVAL;
use crate::engine::EncodedChunk;
use crate::error::LinkError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_HEARTBEAT_ACK: u8 = 6;

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);
const MAX_BACKOFF: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Event names the studio sends.
pub struct ClientEvent;

impl ClientEvent {
    pub const JOIN_AS_BROADCASTER: &'static str = "join-as-broadcaster";
    pub const BROADCAST_AUDIO: &'static str = "broadcast-audio";
    pub const ADD_AUDIO_SOURCE: &'static str = "add-audio-source";
    pub const UPDATE_AUDIO_SOURCE: &'static str = "update-audio-source";
    pub const REMOVE_AUDIO_SOURCE: &'static str = "remove-audio-source";
}

const BROADCASTER_READY: &str = "broadcaster-ready";
const ERROR: &str = "error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    /// Connection lost; retrying with backoff. Control events are tracked
    /// and replayed on reconnect, audio is dropped.
    Degraded,
    Closed,
}

/// A dispatch received from the gateway.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    pub name: String,
    pub data: Value,
}

#[derive(Serialize)]
struct OutgoingFrame<'a> {
    op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    t: Option<&'a str>,
    d: &'a Value,
}

#[derive(Deserialize)]
struct IncomingFrame {
    op: u8,
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    d: Value,
}

fn encode_event(event: &str, data: &Value) -> Result<String, LinkError> {
    Ok(serde_json::to_string(&OutgoingFrame {
        op: OP_DISPATCH,
        t: Some(event),
        d: data,
    })?)
}

/// Outbound side of the control channel as seen by the studio.
pub trait SessionLink: Send + Sync {
    fn status(&self) -> LinkStatus;

    fn send_event(&self, event: &str, data: Value) -> Result<(), LinkError>;

    /// Forward one encoded chunk as `broadcast-audio`.
    fn send_audio(&self, chunk: &EncodedChunk) -> Result<(), LinkError> {
        let data = serde_json::json!({
            "audio": BASE64_STANDARD.encode(&chunk.data),
            "timestamp": chunk.timestamp_ms,
            "metrics": serde_json::to_value(chunk.metrics)?,
        });
        self.send_event(ClientEvent::BROADCAST_AUDIO, data)
    }

    fn close(&self);
}

enum Outbound {
    Text(String),
    Close,
}

struct Shared {
    status: Mutex<LinkStatus>,
    /// Mirrored audio sources keyed by id, replayed after a reconnect.
    sources: Mutex<BTreeMap<String, Value>>,
    events: broadcast::Sender<ServerEvent>,
    last_seq: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: LinkStatus) {
        *self.status.lock() = status;
    }

    fn track(&self, event: &str, data: &Value) {
        let Some(source_id) = data.get("sourceId").and_then(Value::as_str) else {
            return;
        };
        let mut sources = self.sources.lock();
        match event {
            ClientEvent::ADD_AUDIO_SOURCE => {
                sources.insert(source_id.to_string(), data.clone());
            }
            ClientEvent::UPDATE_AUDIO_SOURCE => {
                if let (Some(Value::Object(existing)), Value::Object(patch)) =
                    (sources.get_mut(source_id), data)
                {
                    for (key, value) in patch {
                        existing.insert(key.clone(), value.clone());
                    }
                }
            }
            ClientEvent::REMOVE_AUDIO_SOURCE => {
                sources.remove(source_id);
            }
            _ => {}
        }
    }

    fn replay_frames(&self) -> Vec<String> {
        self.sources
            .lock()
            .values()
            .filter_map(|data| encode_event(ClientEvent::ADD_AUDIO_SOURCE, data).ok())
            .collect()
    }

    /// Parse one text frame; dispatches are published and returned.
    fn handle_frame(&self, text: &str) -> Option<ServerEvent> {
        let frame: IncomingFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "unparseable gateway frame");
                return None;
            }
        };
        match frame.op {
            OP_DISPATCH => {
                if let Some(seq) = frame.s {
                    self.last_seq.store(seq, Ordering::Relaxed);
                }
                let event = ServerEvent {
                    name: frame.t.unwrap_or_default(),
                    data: frame.d,
                };
                if event.name == ERROR {
                    tracing::warn!(
                        event = %event.data["event"],
                        code = %event.data["code"],
                        message = %event.data["message"],
                        "gateway rejected an event"
                    );
                }
                // No subscribers is fine.
                let _ = self.events.send(event.clone());
                Some(event)
            }
            OP_HEARTBEAT_ACK => {
                tracing::trace!("heartbeat acknowledged");
                None
            }
            op => {
                tracing::debug!(op, "ignoring gateway frame");
                None
            }
        }
    }
}

/// WebSocket link to `/gateway` that joins as the broadcast's broadcaster.
///
/// The first connection attempt must succeed. After that, a dropped
/// connection is retried with exponential backoff while the status reads
/// [`LinkStatus::Degraded`]; on reconnect the link re-joins and replays every
/// mirrored audio source.
pub struct GatewayLink {
    outbound: mpsc::UnboundedSender<Outbound>,
    shared: Arc<Shared>,
}

impl GatewayLink {
    pub async fn connect(
        url: &str,
        broadcast_id: &str,
        broadcaster_info: Value,
        heartbeat: Duration,
    ) -> Result<Arc<Self>, LinkError> {
        let heartbeat = if heartbeat.is_zero() {
            tracing::warn!("zero heartbeat interval, using default");
            DEFAULT_HEARTBEAT_INTERVAL
        } else {
            heartbeat
        };
        let (events, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            status: Mutex::new(LinkStatus::Connecting),
            sources: Mutex::new(BTreeMap::new()),
            events,
            last_seq: AtomicU64::new(0),
        });

        let join = encode_event(
            ClientEvent::JOIN_AS_BROADCASTER,
            &serde_json::json!({
                "broadcastId": broadcast_id,
                "broadcasterInfo": broadcaster_info,
            }),
        )?;
        let ws = open(url, &join, Vec::new(), &shared).await?;
        shared.set_status(LinkStatus::Connected);
        tracing::info!(%url, %broadcast_id, "gateway link connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = LinkTask {
            url: url.to_string(),
            join,
            heartbeat,
            shared: Arc::clone(&shared),
            outbound: outbound_rx,
        };
        tokio::spawn(task.run(ws));

        Ok(Arc::new(Self { outbound, shared }))
    }

    /// Dispatches from the gateway, including `error` replies.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.shared.events.subscribe()
    }
}

impl SessionLink for GatewayLink {
    fn status(&self) -> LinkStatus {
        *self.shared.status.lock()
    }

    fn send_event(&self, event: &str, data: Value) -> Result<(), LinkError> {
        self.shared.track(event, &data);
        match self.status() {
            LinkStatus::Connected => {
                let text = encode_event(event, &data)?;
                self.outbound
                    .send(Outbound::Text(text))
                    .map_err(|_| LinkError::Closed)
            }
            LinkStatus::Connecting | LinkStatus::Degraded => {
                tracing::debug!(event, "gateway link degraded, event not sent");
                Ok(())
            }
            LinkStatus::Closed => Err(LinkError::Closed),
        }
    }

    fn close(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl Drop for GatewayLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connect, send the join and wait for `broadcaster-ready`.
async fn open(url: &str, join: &str, replay: Vec<String>, shared: &Shared) -> Result<WsStream, LinkError> {
    let (mut ws, _) = time::timeout(HANDSHAKE_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| LinkError::Connect(format!("timed out connecting to {url}")))?
        .map_err(|e| LinkError::Connect(e.to_string()))?;

    ws.send(Message::Text(join.to_owned().into()))
        .await
        .map_err(|e| LinkError::Connect(e.to_string()))?;

    let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let frame = time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| LinkError::Connect("gateway did not answer the join".into()))?;
        match frame {
            Some(Ok(Message::Text(text))) => match shared.handle_frame(&text) {
                Some(event) if event.name == BROADCASTER_READY => break,
                Some(event) if event.name == ERROR => {
                    let reason = event.data["message"].as_str().unwrap_or("join rejected");
                    return Err(LinkError::Connect(reason.to_string()));
                }
                _ => {}
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(LinkError::Connect("gateway closed the connection".into()));
            }
            Some(Err(e)) => return Err(LinkError::Connect(e.to_string())),
            Some(Ok(_)) => {}
        }
    }

    for text in replay {
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| LinkError::Connect(e.to_string()))?;
    }
    Ok(ws)
}

enum PumpEnd {
    /// Closed on request; do not reconnect.
    Closed,
    Dropped,
}

struct LinkTask {
    url: String,
    join: String,
    heartbeat: Duration,
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl LinkTask {
    async fn run(mut self, mut ws: WsStream) {
        loop {
            let (write, read) = ws.split();
            if let PumpEnd::Closed = self.pump(write, read).await {
                break;
            }

            self.shared.set_status(LinkStatus::Degraded);
            tracing::warn!(url = %self.url, "gateway connection lost, reconnecting");
            match self.reconnect().await {
                Some(next) => ws = next,
                None => break,
            }
            self.shared.set_status(LinkStatus::Connected);
            tracing::info!(url = %self.url, "gateway link restored");
        }
        self.shared.set_status(LinkStatus::Closed);
        tracing::info!(url = %self.url, "gateway link closed");
    }

    async fn pump(
        &mut self,
        mut write: SplitSink<WsStream, Message>,
        mut read: SplitStream<WsStream>,
    ) -> PumpEnd {
        let mut heartbeat = time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);

        loop {
            tokio::select! {
                msg = self.outbound.recv() => match msg {
                    Some(Outbound::Text(text)) => {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            return PumpEnd::Dropped;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        let _ = write.send(Message::Close(None)).await;
                        return PumpEnd::Closed;
                    }
                },

                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.shared.handle_frame(&text);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(?frame, "gateway closed the link");
                        return PumpEnd::Dropped;
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "gateway read failed");
                        return PumpEnd::Dropped;
                    }
                    None => return PumpEnd::Dropped,
                    Some(Ok(_)) => {}
                },

                _ = heartbeat.tick() => {
                    let seq = self.shared.last_seq.load(Ordering::Relaxed);
                    let beat = serde_json::json!({ "seq": seq });
                    let frame = OutgoingFrame { op: OP_HEARTBEAT, t: None, d: &beat };
                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                    if write.send(Message::Text(text.into())).await.is_err() {
                        return PumpEnd::Dropped;
                    }
                }
            }
        }
    }

    /// Retry with backoff until connected or asked to close.
    async fn reconnect(&mut self) -> Option<WsStream> {
        let mut delay = INITIAL_BACKOFF;
        loop {
            let sleep = time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    msg = self.outbound.recv() => match msg {
                        // Stale while disconnected; the replay covers sources.
                        Some(Outbound::Text(_)) => {}
                        Some(Outbound::Close) | None => return None,
                    },
                }
            }

            match open(&self.url, &self.join, self.shared.replay_frames(), &self.shared).await {
                Ok(mut ws) => {
                    while let Ok(msg) = self.outbound.try_recv() {
                        if let Outbound::Close = msg {
                            let _ = ws.close(None).await;
                            return None;
                        }
                    }
                    return Some(ws);
                }
                Err(err) => {
                    tracing::warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "gateway reconnect failed");
                    delay = (delay * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
