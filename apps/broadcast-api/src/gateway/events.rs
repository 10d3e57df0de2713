//! Gateway opcodes, event names, and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAsBroadcasterPayload {
    pub broadcast_id: String,
    #[serde(default)]
    pub broadcaster_info: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBroadcastPayload {
    pub broadcast_id: String,
    #[serde(default)]
    pub listener_info: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastAudioPayload {
    /// Base64-encoded chunk, forwarded verbatim.
    pub audio: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub metrics: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestCallPayload {
    #[serde(default)]
    pub caller_info: CallerInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallIdPayload {
    pub call_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceIdPayload {
    pub source_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPayload {
    #[serde(default)]
    pub broadcast_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

/// Event names received from clients.
pub struct ClientEvent;

impl ClientEvent {
    pub const JOIN_AS_BROADCASTER: &'static str = "join-as-broadcaster";
    pub const JOIN_BROADCAST: &'static str = "join-broadcast";
    pub const BROADCAST_AUDIO: &'static str = "broadcast-audio";
    pub const ADD_AUDIO_SOURCE: &'static str = "add-audio-source";
    pub const UPDATE_AUDIO_SOURCE: &'static str = "update-audio-source";
    pub const REMOVE_AUDIO_SOURCE: &'static str = "remove-audio-source";
    pub const REQUEST_CALL: &'static str = "request-call";
    pub const ACCEPT_CALL: &'static str = "accept-call";
    pub const REJECT_CALL: &'static str = "reject-call";
    pub const END_CALL: &'static str = "end-call";
    pub const GET_BROADCAST_STATS: &'static str = "get-broadcast-stats";
    pub const GET_CALL_QUEUE: &'static str = "get-call-queue";
}

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const BROADCASTER_READY: &'static str = "broadcaster-ready";
    pub const BROADCAST_INFO: &'static str = "broadcast-info";
    pub const LISTENER_COUNT: &'static str = "listener-count";
    pub const AUDIO_STREAM: &'static str = "audio-stream";
    pub const AUDIO_SOURCE_ADDED: &'static str = "audio-source-added";
    pub const AUDIO_SOURCE_UPDATED: &'static str = "audio-source-updated";
    pub const AUDIO_SOURCE_REMOVED: &'static str = "audio-source-removed";
    pub const INCOMING_CALL: &'static str = "incoming-call";
    pub const CALL_QUEUE_UPDATED: &'static str = "call-queue-updated";
    pub const CALL_PENDING: &'static str = "call-pending";
    pub const CALL_ACCEPTED: &'static str = "call-accepted";
    pub const CALL_REJECTED: &'static str = "call-rejected";
    pub const CALL_TIMEOUT: &'static str = "call-timeout";
    pub const CALL_ENDED: &'static str = "call-ended";
    pub const BROADCAST_ENDED: &'static str = "broadcast-ended";
    pub const BROADCAST_STATS: &'static str = "broadcast-stats";
    pub const CALL_QUEUE: &'static str = "call-queue";
    pub const SERVER_STATS: &'static str = "server-stats";
    pub const ERROR: &'static str = "error";
}
