//! Fanout of gateway dispatches to connected clients.
//!
//! Two `tokio::sync::broadcast` channels: one for control events and one for
//! `audio-stream` chunks. Each connection subscribes to both and filters
//! events locally against the payload's recipient list. Registry operations
//! dispatch while holding the session lock, so every subscriber observes a
//! session's control events in mutation order.
//!
//! Audio is lossy: a receiver that falls behind skips chunks. A flood of
//! audio never displaces control events.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use super::connection::ConnectionRole;
use super::events::EventName;

/// Capacity of the control channel. A receiver that lags this far behind
/// has lost session state and is disconnected.
const CONTROL_CAPACITY: usize = 4096;

/// Capacity of the audio channel. Slow receivers skip chunks.
const AUDIO_CAPACITY: usize = 256;

/// Who should receive a dispatched event.
#[derive(Debug, Clone)]
pub enum Recipients {
    /// An explicit set of connection IDs, resolved under the session lock.
    Connections(HashSet<String>),
    /// Every connection currently holding the given role, server-wide.
    Role(ConnectionRole),
}

impl Recipients {
    pub fn one(connection_id: &str) -> Self {
        Self::Connections(HashSet::from([connection_id.to_string()]))
    }

    pub fn includes(&self, connection_id: &str, role: ConnectionRole) -> bool {
        match self {
            Self::Connections(ids) => ids.contains(connection_id),
            Self::Role(r) => *r == role,
        }
    }
}

/// A payload broadcast to all connected gateway clients.
#[derive(Debug, Clone)]
pub struct BroadcastPayload {
    pub recipients: Recipients,
    /// The dispatch event name (e.g. "listener-count").
    pub event_name: String,
    pub data: Value,
}

/// Process-wide fanout shared through `AppState`.
#[derive(Clone)]
pub struct GatewayBroadcast {
    control: broadcast::Sender<Arc<BroadcastPayload>>,
    audio: broadcast::Sender<Arc<BroadcastPayload>>,
}

impl GatewayBroadcast {
    pub fn new() -> Self {
        let (control, _) = broadcast::channel(CONTROL_CAPACITY);
        let (audio, _) = broadcast::channel(AUDIO_CAPACITY);
        Self { control, audio }
    }

    /// Subscribe to control events. Each connection should call this once
    /// to get its own receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.control.subscribe()
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<Arc<BroadcastPayload>> {
        self.audio.subscribe()
    }

    /// Dispatch an event to its recipients.
    pub fn dispatch(&self, recipients: Recipients, event_name: &str, data: Value) {
        Self::send(&self.control, recipients, event_name, data);
    }

    /// Dispatch an `audio-stream` chunk on the lossy audio channel.
    pub fn dispatch_audio(&self, recipients: Recipients, data: Value) {
        Self::send(&self.audio, recipients, EventName::AUDIO_STREAM, data);
    }

    fn send(
        sender: &broadcast::Sender<Arc<BroadcastPayload>>,
        recipients: Recipients,
        event_name: &str,
        data: Value,
    ) {
        if let Recipients::Connections(ids) = &recipients {
            if ids.is_empty() {
                return;
            }
        }
        // No subscribers means nobody is connected.
        let _ = sender.send(Arc::new(BroadcastPayload {
            recipients,
            event_name: event_name.to_string(),
            data,
        }));
    }

    /// Dispatch to a single connection.
    pub fn send_to(&self, connection_id: &str, event_name: &str, data: Value) {
        self.dispatch(Recipients::one(connection_id), event_name, data);
    }
}

impl Default for GatewayBroadcast {
    fn default() -> Self {
        Self::new()
    }
}
