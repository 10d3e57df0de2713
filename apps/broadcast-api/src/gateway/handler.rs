//! Control-event routing.
//!
//! Each event is validated, applied to the registry, and either answered
//! through the fanout hub by the registry itself or, for snapshot lookups,
//! with a direct reply to the sender.

use base64::Engine;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::broadcast::session::{AudioSourcePatch, NewAudioSource};
use crate::error::SessionError;
use crate::AppState;

use super::connection::{Connection, ConnectionRole};
use super::events::{
    BroadcastAudioPayload, CallIdPayload, ClientEvent, EventName, JoinAsBroadcasterPayload,
    JoinBroadcastPayload, RequestCallPayload, SnapshotPayload, SourceIdPayload,
};
use super::session::GatewaySession;

/// A dispatch addressed only to the sending connection.
#[derive(Debug)]
pub struct DirectReply {
    pub event_name: &'static str,
    pub data: Value,
}

/// Apply one client event. Errors are reported back to the sender by the
/// caller and never close the socket.
pub fn handle_event(
    state: &AppState,
    session: &GatewaySession,
    event: &str,
    data: Value,
) -> Result<Option<DirectReply>, SessionError> {
    let connection_id = session.connection_id.as_str();

    match event {
        ClientEvent::JOIN_AS_BROADCASTER => {
            let payload: JoinAsBroadcasterPayload = parse(data)?;
            ensure_unclassified(state, connection_id)?;
            state.registry.join_as_broadcaster(
                &payload.broadcast_id,
                connection_id,
                payload.broadcaster_info,
            )?;
            let conn = state.connections.assign(
                connection_id,
                ConnectionRole::Broadcaster,
                &payload.broadcast_id,
            )?;
            session.set_role(conn.role);
            Ok(None)
        }
        ClientEvent::JOIN_BROADCAST => {
            let payload: JoinBroadcastPayload = parse(data)?;
            ensure_unclassified(state, connection_id)?;
            state.registry.join_as_listener(
                &payload.broadcast_id,
                connection_id,
                payload.listener_info,
            )?;
            let conn = state.connections.assign(
                connection_id,
                ConnectionRole::Listener,
                &payload.broadcast_id,
            )?;
            session.set_role(conn.role);
            Ok(None)
        }
        ClientEvent::BROADCAST_AUDIO => {
            let payload: BroadcastAudioPayload = parse(data)?;
            base64::engine::general_purpose::STANDARD
                .decode(&payload.audio)
                .map_err(|e| SessionError::InvalidPayload(format!("audio is not base64: {e}")))?;
            let bid = joined_broadcast(state, connection_id)?;
            state.registry.relay_audio(&bid, connection_id, payload)?;
            Ok(None)
        }
        ClientEvent::ADD_AUDIO_SOURCE => {
            let new: NewAudioSource = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state.registry.add_audio_source(&bid, connection_id, new)?;
            Ok(None)
        }
        ClientEvent::UPDATE_AUDIO_SOURCE => {
            let patch: AudioSourcePatch = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state.registry.update_audio_source(&bid, connection_id, patch)?;
            Ok(None)
        }
        ClientEvent::REMOVE_AUDIO_SOURCE => {
            let payload: SourceIdPayload = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state
                .registry
                .remove_audio_source(&bid, connection_id, &payload.source_id)?;
            Ok(None)
        }
        ClientEvent::REQUEST_CALL => {
            let payload: RequestCallPayload = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state
                .registry
                .request_call(&bid, connection_id, payload.caller_info)?;
            let conn = state.connections.promote_to_caller(connection_id)?;
            session.set_role(conn.role);
            Ok(None)
        }
        ClientEvent::ACCEPT_CALL => {
            let payload: CallIdPayload = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state.registry.accept_call(&bid, connection_id, &payload.call_id)?;
            Ok(None)
        }
        ClientEvent::REJECT_CALL => {
            let payload: CallIdPayload = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state
                .registry
                .reject_call(&bid, connection_id, &payload.call_id, payload.reason)?;
            Ok(None)
        }
        ClientEvent::END_CALL => {
            let payload: CallIdPayload = parse(data)?;
            let bid = joined_broadcast(state, connection_id)?;
            state.registry.end_call(&bid, connection_id, &payload.call_id)?;
            Ok(None)
        }
        ClientEvent::GET_BROADCAST_STATS => {
            let payload: SnapshotPayload = parse_or_default(data)?;
            let bid = match payload.broadcast_id {
                Some(bid) => bid,
                None => joined_broadcast(state, connection_id)?,
            };
            let stats = state.registry.stats(&bid)?;
            Ok(Some(DirectReply {
                event_name: EventName::BROADCAST_STATS,
                data: json!(stats),
            }))
        }
        ClientEvent::GET_CALL_QUEUE => {
            let bid = joined_broadcast(state, connection_id)?;
            let queue = state.registry.call_queue(&bid, connection_id)?;
            Ok(Some(DirectReply {
                event_name: EventName::CALL_QUEUE,
                data: json!({ "broadcastId": bid, "queue": queue }),
            }))
        }
        other => Err(SessionError::InvalidPayload(format!("unknown event {other}"))),
    }
}

/// Build the `error` dispatch body for a rejected event.
pub fn error_reply(event: &str, err: &SessionError) -> DirectReply {
    DirectReply {
        event_name: EventName::ERROR,
        data: json!({
            "event": event,
            "code": err.code(),
            "message": err.to_string(),
        }),
    }
}

fn parse<T: DeserializeOwned>(data: Value) -> Result<T, SessionError> {
    serde_json::from_value(data).map_err(|e| SessionError::InvalidPayload(e.to_string()))
}

fn parse_or_default<T: DeserializeOwned + Default>(data: Value) -> Result<T, SessionError> {
    if data.is_null() {
        return Ok(T::default());
    }
    parse(data)
}

fn connection(state: &AppState, connection_id: &str) -> Result<Connection, SessionError> {
    state
        .connections
        .get(connection_id)
        .ok_or(SessionError::NotJoined)
}

/// A connection's role is fixed by its first join.
fn ensure_unclassified(state: &AppState, connection_id: &str) -> Result<(), SessionError> {
    let conn = connection(state, connection_id)?;
    if conn.role != ConnectionRole::Unset {
        return Err(SessionError::RoleAlreadySet(conn.role.to_string()));
    }
    Ok(())
}

fn joined_broadcast(state: &AppState, connection_id: &str) -> Result<String, SessionError> {
    connection(state, connection_id)?
        .broadcast_id
        .ok_or(SessionError::NotJoined)
}
