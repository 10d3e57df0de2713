//! Authoritative registry of live broadcasts.
//!
//! Each session sits behind its own `parking_lot::Mutex` inside a `DashMap`,
//! so operations on one broadcast serialize in arrival order while different
//! broadcasts never contend on a shared lock. Every notification is
//! dispatched while the session lock is held, after the mutation, so
//! participants only ever observe post-mutation state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::config::Config;
use crate::error::SessionError;
use crate::gateway::connection::{Connection, ConnectionRole};
use crate::gateway::events::{BroadcastAudioPayload, CallerInfo, EventName};
use crate::gateway::fanout::{GatewayBroadcast, Recipients};

use super::calls::{CallRequest, CallStatus};
use super::session::{
    caller_source_id, AudioSource, AudioSourcePatch, BroadcastSession, BroadcastStats,
    NewAudioSource, SourceKind,
};

const DEFAULT_REJECT_REASON: &str = "The host is unable to take your call right now";
const ON_AIR_INSTRUCTIONS: &str =
    "You are live! Turn down any radios or speakers near you and speak clearly.";

/// Aggregate statistics across every live broadcast.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub active_sessions: usize,
    pub total_connections: usize,
    pub total_listeners: usize,
    pub total_active_calls: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct BroadcastRegistry {
    sessions: DashMap<String, Mutex<BroadcastSession>>,
    config: Arc<Config>,
    fanout: GatewayBroadcast,
}

impl BroadcastRegistry {
    pub fn new(config: Arc<Config>, fanout: GatewayBroadcast) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            fanout,
        }
    }

    /// Run a client-originated mutation against an existing session.
    fn with_session<T>(
        &self,
        broadcast_id: &str,
        f: impl FnOnce(&mut BroadcastSession) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let entry = self
            .sessions
            .get(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        let mut session = entry.lock();
        session.stats.total_messages += 1;
        f(&mut session)
    }

    fn require_broadcaster(session: &BroadcastSession, connection_id: &str) -> Result<(), SessionError> {
        if session.is_broadcaster(connection_id) {
            Ok(())
        } else {
            Err(SessionError::NotBroadcaster)
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open a session without a broadcaster, or return the existing one.
    pub fn open(&self, broadcast_id: &str) -> BroadcastStats {
        let entry = self
            .sessions
            .entry(broadcast_id.to_string())
            .or_insert_with(|| {
                tracing::info!(%broadcast_id, "broadcast session opened");
                Mutex::new(BroadcastSession::new(broadcast_id))
            })
            .downgrade();
        let session = entry.lock();
        session.snapshot()
    }

    pub fn join_as_broadcaster(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        broadcaster_info: Value,
    ) -> Result<BroadcastStats, SessionError> {
        let entry = self
            .sessions
            .entry(broadcast_id.to_string())
            .or_insert_with(|| {
                tracing::info!(%broadcast_id, "broadcast session created");
                Mutex::new(BroadcastSession::new(broadcast_id))
            })
            .downgrade();
        let mut session = entry.lock();

        if session.broadcaster_connection_id.is_some() {
            return Err(SessionError::BroadcasterConflict(broadcast_id.to_string()));
        }
        session.broadcaster_connection_id = Some(connection_id.to_string());
        session.stats.total_messages += 1;

        let stats = session.snapshot();
        self.fanout.send_to(
            connection_id,
            EventName::BROADCASTER_READY,
            json!({
                "broadcastId": broadcast_id,
                "broadcasterInfo": broadcaster_info,
                "stats": stats,
                "audioSources": session.sources_snapshot(),
                "callQueue": session.queue_snapshot(),
                "config": {
                    "maxHosts": self.config.max_hosts,
                    "maxGuests": self.config.max_guests,
                    "maxCallers": self.config.max_callers,
                    "maxAudioSources": self.config.max_audio_sources,
                    "sampleRate": self.config.sample_rate,
                    "channels": self.config.channels,
                    "bitrate": self.config.bitrate,
                    "heartbeatInterval": self.config.heartbeat_interval_ms,
                },
            }),
        );

        tracing::info!(%broadcast_id, %connection_id, "broadcaster attached");
        Ok(stats)
    }

    pub fn join_as_listener(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        listener_info: Value,
    ) -> Result<BroadcastStats, SessionError> {
        self.with_session(broadcast_id, |session| {
            session.add_listener(connection_id);
            let stats = session.snapshot();

            self.fanout.send_to(
                connection_id,
                EventName::BROADCAST_INFO,
                json!({
                    "broadcastId": broadcast_id,
                    "isLive": session.is_live,
                    "listenerInfo": listener_info,
                    "audioSources": session.sources_snapshot(),
                    "stats": stats,
                }),
            );
            self.notify_listener_count(session);

            tracing::debug!(%broadcast_id, %connection_id, listeners = session.listeners.len(), "listener joined");
            Ok(stats)
        })
    }

    /// Forward an encoded chunk from the broadcaster to every listener.
    pub fn relay_audio(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        payload: BroadcastAudioPayload,
    ) -> Result<(), SessionError> {
        let entry = self
            .sessions
            .get(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        let mut session = entry.lock();
        Self::require_broadcaster(&session, connection_id)?;

        if !session.is_live {
            session.is_live = true;
            tracing::info!(%broadcast_id, "broadcast is live");
        }

        self.fanout.dispatch_audio(
            session.audience(),
            json!({
                "broadcastId": broadcast_id,
                "audio": payload.audio,
                "timestamp": payload.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
                "metrics": payload.metrics,
            }),
        );
        Ok(())
    }

    /// Tear down a session on administrative request.
    pub fn end_broadcast(&self, broadcast_id: &str, reason: &str) -> Result<BroadcastStats, SessionError> {
        let (_, session) = self
            .sessions
            .remove(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        Ok(self.teardown(session.into_inner(), reason))
    }

    /// Role-specific teardown for a closed connection.
    pub fn disconnect(&self, conn: &Connection) {
        let Some(broadcast_id) = conn.broadcast_id.as_deref() else {
            return;
        };
        let connection_id = conn.connection_id.as_str();

        match conn.role {
            ConnectionRole::Unset => {}
            ConnectionRole::Broadcaster => {
                let removed = self
                    .sessions
                    .remove_if(broadcast_id, |_, s| s.lock().is_broadcaster(connection_id));
                if let Some((_, session)) = removed {
                    self.teardown(session.into_inner(), "The broadcaster disconnected");
                }
            }
            ConnectionRole::Listener | ConnectionRole::Caller => {
                let Some(entry) = self.sessions.get(broadcast_id) else {
                    return;
                };
                let mut session = entry.lock();

                if let Some(call) = session.call_queue.remove_by_caller(connection_id) {
                    tracing::debug!(%broadcast_id, call_id = %call.call_id, "queued caller hung up");
                    self.notify_queue(&session);
                }
                self.finish_call(&mut session, connection_id, "The caller disconnected");

                for source_id in session.remove_sources_owned_by(connection_id) {
                    self.notify_source_removed(&session, &source_id);
                }
                if session.listeners.remove(connection_id) {
                    self.notify_listener_count(&session);
                }
            }
        }
    }

    fn teardown(&self, mut session: BroadcastSession, reason: &str) -> BroadcastStats {
        let callers: Vec<String> = session.active_calls.keys().cloned().collect();
        for caller in callers {
            self.finish_call(&mut session, &caller, reason);
        }

        let pending: Vec<CallRequest> = session.call_queue.drain().collect();
        for call in pending {
            self.fanout.send_to(
                &call.caller_connection_id,
                EventName::CALL_REJECTED,
                json!({ "callId": call.call_id, "reason": reason }),
            );
        }

        let stats = session.snapshot();
        self.fanout.dispatch(
            session.everyone(),
            EventName::BROADCAST_ENDED,
            json!({
                "broadcastId": session.broadcast_id,
                "reason": reason,
                "stats": stats,
            }),
        );

        tracing::info!(
            broadcast_id = %session.broadcast_id,
            listeners = session.listeners.len(),
            peak_listeners = stats.peak_listeners,
            %reason,
            "broadcast session destroyed"
        );
        stats
    }

    // -----------------------------------------------------------------------
    // Audio sources
    // -----------------------------------------------------------------------

    pub fn add_audio_source(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        new: NewAudioSource,
    ) -> Result<AudioSource, SessionError> {
        self.with_session(broadcast_id, |session| {
            Self::require_broadcaster(session, connection_id)?;
            if session.audio_sources.contains_key(&new.source_id) {
                return Err(SessionError::InvalidPayload(format!(
                    "audio source {} already exists",
                    new.source_id
                )));
            }
            if session.audio_sources.len() >= self.config.max_audio_sources {
                return Err(SessionError::SourceCapacityExceeded(self.config.max_audio_sources));
            }

            let source = AudioSource::from_new(new, connection_id);
            session.audio_sources.insert(source.id.clone(), source.clone());
            self.fanout.dispatch(
                session.everyone(),
                EventName::AUDIO_SOURCE_ADDED,
                json!({ "broadcastId": broadcast_id, "source": source }),
            );
            Ok(source)
        })
    }

    pub fn update_audio_source(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        patch: AudioSourcePatch,
    ) -> Result<AudioSource, SessionError> {
        self.with_session(broadcast_id, |session| {
            let is_broadcaster = session.is_broadcaster(connection_id);
            let source = session
                .audio_sources
                .get_mut(&patch.source_id)
                .ok_or_else(|| SessionError::SourceNotFound(patch.source_id.clone()))?;
            if !is_broadcaster && source.owner_connection_id != connection_id {
                return Err(SessionError::NotBroadcaster);
            }

            source.apply(patch);
            let updated = source.clone();
            self.fanout.dispatch(
                session.everyone(),
                EventName::AUDIO_SOURCE_UPDATED,
                json!({ "broadcastId": broadcast_id, "source": updated }),
            );
            Ok(updated)
        })
    }

    pub fn remove_audio_source(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        source_id: &str,
    ) -> Result<AudioSource, SessionError> {
        self.with_session(broadcast_id, |session| {
            let owner = session
                .audio_sources
                .get(source_id)
                .map(|s| s.owner_connection_id.clone())
                .ok_or_else(|| SessionError::SourceNotFound(source_id.to_string()))?;
            if !session.is_broadcaster(connection_id) && owner != connection_id {
                return Err(SessionError::NotBroadcaster);
            }

            let removed = session
                .audio_sources
                .remove(source_id)
                .ok_or_else(|| SessionError::SourceNotFound(source_id.to_string()))?;
            self.notify_source_removed(session, source_id);
            Ok(removed)
        })
    }

    pub fn audio_sources(&self, broadcast_id: &str) -> Result<Vec<AudioSource>, SessionError> {
        let entry = self
            .sessions
            .get(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        let session = entry.lock();
        Ok(session.sources_snapshot())
    }

    // -----------------------------------------------------------------------
    // Call admission
    // -----------------------------------------------------------------------

    /// Append a call request to the tail of the queue. Returns the request and
    /// its advisory 1-based queue position.
    pub fn request_call(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        caller_info: CallerInfo,
    ) -> Result<(CallRequest, usize), SessionError> {
        self.with_session(broadcast_id, |session| {
            if !session.listeners.contains(connection_id) {
                return Err(SessionError::NotJoined);
            }
            if session.has_call_for(connection_id) {
                return Err(SessionError::CallAlreadyPending);
            }

            let call = CallRequest::new(connection_id, caller_info.name, caller_info.location);
            let position = session.call_queue.push(call.clone());
            session.stats.total_calls += 1;

            self.fanout.send_to(
                connection_id,
                EventName::CALL_PENDING,
                json!({
                    "callId": call.call_id,
                    "position": position,
                    "queueLength": session.call_queue.len(),
                    "message": format!("You are number {position} in line. Please hold."),
                }),
            );
            self.fanout.dispatch(
                session.broadcaster(),
                EventName::INCOMING_CALL,
                json!({ "call": call, "position": position }),
            );
            self.notify_queue(session);

            tracing::info!(%broadcast_id, call_id = %call.call_id, position, "call requested");
            Ok((call, position))
        })
    }

    /// Move a pending call on air and create its caller audio source.
    pub fn accept_call(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        call_id: &str,
    ) -> Result<AudioSource, SessionError> {
        self.with_session(broadcast_id, |session| {
            Self::require_broadcaster(session, connection_id)?;
            if !session.call_queue.iter().any(|c| c.call_id == call_id) {
                return Err(SessionError::CallNotFound(call_id.to_string()));
            }
            if session.active_calls.len() >= self.config.max_callers {
                return Err(SessionError::CallerCapacityExceeded(self.config.max_callers));
            }
            if session.audio_sources.len() >= self.config.max_audio_sources {
                return Err(SessionError::SourceCapacityExceeded(self.config.max_audio_sources));
            }

            let mut call = session
                .call_queue
                .remove(call_id)
                .ok_or_else(|| SessionError::CallNotFound(call_id.to_string()))?;
            call.status = CallStatus::Active;

            let source = AudioSource {
                id: caller_source_id(&call.caller_connection_id),
                kind: SourceKind::Caller,
                display_name: call.caller_name.clone(),
                volume: 1.0,
                muted: false,
                active: true,
                priority: 0,
                owner_connection_id: call.caller_connection_id.clone(),
            };
            session.audio_sources.insert(source.id.clone(), source.clone());
            session
                .active_calls
                .insert(call.caller_connection_id.clone(), call.clone());

            self.fanout.send_to(
                &call.caller_connection_id,
                EventName::CALL_ACCEPTED,
                json!({
                    "callId": call.call_id,
                    "sourceId": source.id,
                    "message": ON_AIR_INSTRUCTIONS,
                }),
            );
            self.fanout.dispatch(
                session.everyone(),
                EventName::AUDIO_SOURCE_ADDED,
                json!({ "broadcastId": broadcast_id, "source": source }),
            );
            self.notify_queue(session);

            tracing::info!(%broadcast_id, %call_id, source_id = %source.id, "call accepted");
            Ok(source)
        })
    }

    pub fn reject_call(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        call_id: &str,
        reason: Option<String>,
    ) -> Result<CallRequest, SessionError> {
        self.with_session(broadcast_id, |session| {
            Self::require_broadcaster(session, connection_id)?;
            let mut call = session
                .call_queue
                .remove(call_id)
                .ok_or_else(|| SessionError::CallNotFound(call_id.to_string()))?;
            call.status = CallStatus::Rejected;

            let reason = reason.unwrap_or_else(|| DEFAULT_REJECT_REASON.to_string());
            self.fanout.send_to(
                &call.caller_connection_id,
                EventName::CALL_REJECTED,
                json!({ "callId": call.call_id, "reason": reason }),
            );
            self.notify_queue(session);

            tracing::info!(%broadcast_id, %call_id, %reason, "call rejected");
            Ok(call)
        })
    }

    /// End an active call. Either the broadcaster or the caller may hang up.
    pub fn end_call(
        &self,
        broadcast_id: &str,
        connection_id: &str,
        call_id: &str,
    ) -> Result<CallRequest, SessionError> {
        self.with_session(broadcast_id, |session| {
            let caller = session
                .find_active_call(call_id)
                .map(|c| c.caller_connection_id.clone())
                .ok_or_else(|| SessionError::CallNotActive(call_id.to_string()))?;

            let reason = if session.is_broadcaster(connection_id) {
                "The host ended the call"
            } else if caller == connection_id {
                "The caller hung up"
            } else {
                return Err(SessionError::NotBroadcaster);
            };

            self.finish_call(session, &caller, reason)
                .ok_or_else(|| SessionError::CallNotActive(call_id.to_string()))
        })
    }

    /// End the active call held by `caller_connection_id`, if any.
    fn finish_call(
        &self,
        session: &mut BroadcastSession,
        caller_connection_id: &str,
        reason: &str,
    ) -> Option<CallRequest> {
        let mut call = session.active_calls.remove(caller_connection_id)?;
        call.status = CallStatus::Ended;

        let source_id = caller_source_id(caller_connection_id);
        if session.audio_sources.remove(&source_id).is_some() {
            self.notify_source_removed(session, &source_id);
        }

        let mut parties = session.broadcaster();
        if let Recipients::Connections(ids) = &mut parties {
            ids.insert(caller_connection_id.to_string());
        }
        self.fanout.dispatch(
            parties,
            EventName::CALL_ENDED,
            json!({ "callId": call.call_id, "sourceId": source_id, "reason": reason }),
        );

        tracing::info!(broadcast_id = %session.broadcast_id, call_id = %call.call_id, %reason, "call ended");
        Some(call)
    }

    pub fn call_queue(&self, broadcast_id: &str, connection_id: &str) -> Result<Vec<CallRequest>, SessionError> {
        let entry = self
            .sessions
            .get(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        let session = entry.lock();
        Self::require_broadcaster(&session, connection_id)?;
        Ok(session.queue_snapshot())
    }

    // -----------------------------------------------------------------------
    // Housekeeping & statistics
    // -----------------------------------------------------------------------

    /// Expire pending calls older than `max_age` across every session.
    /// Returns the number of calls expired.
    pub fn expire_stale_calls(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut total = 0;

        for entry in self.sessions.iter() {
            let mut session = entry.value().lock();
            let expired = session.call_queue.drain_expired(now, max_age);
            if expired.is_empty() {
                continue;
            }

            for mut call in expired {
                call.status = CallStatus::TimedOut;
                self.fanout.send_to(
                    &call.caller_connection_id,
                    EventName::CALL_TIMEOUT,
                    json!({
                        "callId": call.call_id,
                        "reason": "Nobody picked up in time. Please try again later.",
                    }),
                );
                tracing::info!(broadcast_id = %session.broadcast_id, call_id = %call.call_id, "call request timed out");
                total += 1;
            }
            self.notify_queue(&session);
        }

        total
    }

    pub fn stats(&self, broadcast_id: &str) -> Result<BroadcastStats, SessionError> {
        let entry = self
            .sessions
            .get(broadcast_id)
            .ok_or_else(|| SessionError::BroadcastNotFound(broadcast_id.to_string()))?;
        let session = entry.lock();
        Ok(session.snapshot())
    }

    pub fn server_stats(&self, total_connections: usize) -> ServerStats {
        let mut stats = ServerStats {
            active_sessions: 0,
            total_connections,
            total_listeners: 0,
            total_active_calls: 0,
            timestamp: Utc::now(),
        };
        for entry in self.sessions.iter() {
            let session = entry.value().lock();
            stats.active_sessions += 1;
            stats.total_listeners += session.listeners.len();
            stats.total_active_calls += session.active_calls.len();
        }
        stats
    }

    pub fn contains(&self, broadcast_id: &str) -> bool {
        self.sessions.contains_key(broadcast_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // -----------------------------------------------------------------------
    // Notifications
    // -----------------------------------------------------------------------

    fn notify_listener_count(&self, session: &BroadcastSession) {
        self.fanout.dispatch(
            session.everyone(),
            EventName::LISTENER_COUNT,
            json!({
                "broadcastId": session.broadcast_id,
                "count": session.listeners.len(),
                "peak": session.stats.peak_listeners,
            }),
        );
    }

    fn notify_queue(&self, session: &BroadcastSession) {
        self.fanout.dispatch(
            session.broadcaster(),
            EventName::CALL_QUEUE_UPDATED,
            json!({
                "broadcastId": session.broadcast_id,
                "queue": session.queue_snapshot(),
            }),
        );
    }

    fn notify_source_removed(&self, session: &BroadcastSession, source_id: &str) {
        self.fanout.dispatch(
            session.everyone(),
            EventName::AUDIO_SOURCE_REMOVED,
            json!({ "broadcastId": session.broadcast_id, "sourceId": source_id }),
        );
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::broadcast;

    use super::*;
    use crate::gateway::fanout::BroadcastPayload;

    type Rx = broadcast::Receiver<Arc<BroadcastPayload>>;

    fn setup() -> (BroadcastRegistry, Rx) {
        let fanout = GatewayBroadcast::new();
        let rx = fanout.subscribe();
        (BroadcastRegistry::new(Arc::new(Config::default()), fanout), rx)
    }

    fn drain(rx: &mut Rx) -> Vec<Arc<BroadcastPayload>> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p);
        }
        out
    }

    fn events_for<'a>(events: &'a [Arc<BroadcastPayload>], conn: &str, role: ConnectionRole) -> Vec<&'a BroadcastPayload> {
        events
            .iter()
            .filter(|p| p.recipients.includes(conn, role))
            .map(|p| p.as_ref())
            .collect()
    }

    fn conn(id: &str, role: ConnectionRole, broadcast_id: &str) -> Connection {
        Connection {
            connection_id: id.to_string(),
            broadcast_id: Some(broadcast_id.to_string()),
            role,
            connected_at: Utc::now(),
        }
    }

    /// bid-1 with broadcaster "b" and listeners "c1", "c2".
    fn live_session(reg: &BroadcastRegistry) {
        reg.join_as_broadcaster("bid-1", "b", Value::Null).unwrap();
        reg.join_as_listener("bid-1", "c1", Value::Null).unwrap();
        reg.join_as_listener("bid-1", "c2", Value::Null).unwrap();
    }

    fn caller(name: &str) -> CallerInfo {
        CallerInfo {
            name: Some(name.to_string()),
            location: Some("Lagos".to_string()),
        }
    }

    #[test]
    fn broadcaster_join_creates_session_and_replies_ready() {
        let (reg, mut rx) = setup();
        reg.join_as_broadcaster("bid-1", "b", json!({"name": "Studio A"})).unwrap();

        assert!(reg.contains("bid-1"));
        let events = drain(&mut rx);
        let mine = events_for(&events, "b", ConnectionRole::Broadcaster);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].event_name, EventName::BROADCASTER_READY);
        assert_eq!(mine[0].data["config"]["maxCallers"], 2);
        assert_eq!(mine[0].data["broadcasterInfo"]["name"], "Studio A");
    }

    #[test]
    fn second_broadcaster_is_rejected_not_stolen() {
        let (reg, _rx) = setup();
        reg.join_as_broadcaster("bid-1", "b", Value::Null).unwrap();

        let err = reg.join_as_broadcaster("bid-1", "intruder", Value::Null).unwrap_err();
        assert_eq!(err, SessionError::BroadcasterConflict("bid-1".into()));

        // The intruder disconnecting must not tear down the real session.
        reg.disconnect(&conn("intruder", ConnectionRole::Broadcaster, "bid-1"));
        assert!(reg.contains("bid-1"));
    }

    #[test]
    fn broadcaster_reattaches_to_open_session() {
        let (reg, _rx) = setup();
        let opened = reg.open("bid-1");
        assert!(!opened.has_broadcaster);

        let stats = reg.join_as_broadcaster("bid-1", "b", Value::Null).unwrap();
        assert!(stats.has_broadcaster);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn listener_join_requires_session() {
        let (reg, _rx) = setup();
        let err = reg.join_as_listener("nope", "l", Value::Null).unwrap_err();
        assert_eq!(err, SessionError::BroadcastNotFound("nope".into()));
    }

    #[test]
    fn listener_count_reflects_post_mutation_state() {
        let (reg, mut rx) = setup();
        reg.join_as_broadcaster("bid-1", "b", Value::Null).unwrap();
        drain(&mut rx);

        reg.join_as_listener("bid-1", "l1", Value::Null).unwrap();
        let events = drain(&mut rx);
        let to_broadcaster = events_for(&events, "b", ConnectionRole::Broadcaster);
        assert_eq!(to_broadcaster.len(), 1);
        assert_eq!(to_broadcaster[0].event_name, EventName::LISTENER_COUNT);
        assert_eq!(to_broadcaster[0].data["count"], 1);

        let to_listener = events_for(&events, "l1", ConnectionRole::Listener);
        assert_eq!(to_listener[0].event_name, EventName::BROADCAST_INFO);
        assert_eq!(to_listener[1].event_name, EventName::LISTENER_COUNT);
    }

    #[test]
    fn peak_listeners_is_monotonic_across_joins_and_leaves() {
        let (reg, _rx) = setup();
        reg.join_as_broadcaster("bid-1", "b", Value::Null).unwrap();

        let mut last_peak = 0;
        for round in 0..3 {
            for i in 0..=round {
                let id = format!("l{round}_{i}");
                reg.join_as_listener("bid-1", &id, Value::Null).unwrap();
                let peak = reg.stats("bid-1").unwrap().peak_listeners;
                assert!(peak >= last_peak);
                last_peak = peak;
            }
            for i in 0..=round {
                let id = format!("l{round}_{i}");
                reg.disconnect(&conn(&id, ConnectionRole::Listener, "bid-1"));
                let stats = reg.stats("bid-1").unwrap();
                assert!(stats.peak_listeners >= last_peak);
                last_peak = stats.peak_listeners;
            }
        }
        assert_eq!(last_peak, 3);
        assert_eq!(reg.stats("bid-1").unwrap().listener_count, 0);
    }

    #[test]
    fn queue_positions_are_ordered_by_arrival() {
        let (reg, _rx) = setup();
        live_session(&reg);

        let (_, p1) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        let (_, p2) = reg.request_call("bid-1", "c2", caller("Two")).unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn accepting_later_call_first_leaves_earlier_pending() {
        let (reg, mut rx) = setup();
        live_session(&reg);

        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        let (r2, _) = reg.request_call("bid-1", "c2", caller("Two")).unwrap();
        drain(&mut rx);

        let source = reg.accept_call("bid-1", "b", &r2.call_id).unwrap();
        assert_eq!(source.id, "caller_c2");
        assert_eq!(source.kind, SourceKind::Caller);

        let queue = reg.call_queue("bid-1", "b").unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].call_id, r1.call_id);
        assert_eq!(queue[0].status, CallStatus::Pending);

        let events = drain(&mut rx);
        let to_c2 = events_for(&events, "c2", ConnectionRole::Caller);
        assert_eq!(to_c2[0].event_name, EventName::CALL_ACCEPTED);
        assert_eq!(to_c2[0].data["sourceId"], "caller_c2");
        assert!(to_c2[0].data["message"].as_str().unwrap().contains("live"));
    }

    #[test]
    fn accepting_a_non_pending_call_fails_without_side_effects() {
        let (reg, _rx) = setup();
        live_session(&reg);

        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        reg.accept_call("bid-1", "b", &r1.call_id).unwrap();
        let sources_before = reg.audio_sources("bid-1").unwrap().len();

        let err = reg.accept_call("bid-1", "b", &r1.call_id).unwrap_err();
        assert_eq!(err, SessionError::CallNotFound(r1.call_id.clone()));
        assert_eq!(reg.audio_sources("bid-1").unwrap().len(), sources_before);

        let err = reg.accept_call("bid-1", "b", "call_unknown").unwrap_err();
        assert_eq!(err, SessionError::CallNotFound("call_unknown".into()));
    }

    #[test]
    fn rejected_call_cannot_be_accepted() {
        let (reg, mut rx) = setup();
        live_session(&reg);

        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        drain(&mut rx);
        reg.reject_call("bid-1", "b", &r1.call_id, Some("Lines are full".into())).unwrap();

        let events = drain(&mut rx);
        let to_c1 = events_for(&events, "c1", ConnectionRole::Caller);
        assert_eq!(to_c1[0].event_name, EventName::CALL_REJECTED);
        assert_eq!(to_c1[0].data["reason"], "Lines are full");

        assert!(matches!(
            reg.accept_call("bid-1", "b", &r1.call_id),
            Err(SessionError::CallNotFound(_))
        ));
        assert!(reg.audio_sources("bid-1").unwrap().is_empty());
    }

    #[test]
    fn only_broadcaster_may_accept() {
        let (reg, _rx) = setup();
        live_session(&reg);
        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();

        let err = reg.accept_call("bid-1", "c2", &r1.call_id).unwrap_err();
        assert_eq!(err, SessionError::NotBroadcaster);
        assert_eq!(reg.call_queue("bid-1", "b").unwrap().len(), 1);
    }

    #[test]
    fn duplicate_request_is_rejected() {
        let (reg, _rx) = setup();
        live_session(&reg);
        reg.request_call("bid-1", "c1", caller("One")).unwrap();
        assert_eq!(
            reg.request_call("bid-1", "c1", caller("One")).unwrap_err(),
            SessionError::CallAlreadyPending
        );
    }

    #[test]
    fn caller_capacity_is_enforced() {
        let (reg, _rx) = setup();
        live_session(&reg);
        reg.join_as_listener("bid-1", "c3", Value::Null).unwrap();

        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        let (r2, _) = reg.request_call("bid-1", "c2", caller("Two")).unwrap();
        let (r3, _) = reg.request_call("bid-1", "c3", caller("Three")).unwrap();
        reg.accept_call("bid-1", "b", &r1.call_id).unwrap();
        reg.accept_call("bid-1", "b", &r2.call_id).unwrap();

        let err = reg.accept_call("bid-1", "b", &r3.call_id).unwrap_err();
        assert_eq!(err, SessionError::CallerCapacityExceeded(2));
        // Still pending, can be accepted once a line frees up.
        assert_eq!(reg.call_queue("bid-1", "b").unwrap()[0].call_id, r3.call_id);
    }

    #[test]
    fn stale_call_times_out_and_cannot_be_accepted() {
        let (reg, mut rx) = setup();
        live_session(&reg);
        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        drain(&mut rx);

        // Nothing is five minutes old yet.
        assert_eq!(reg.expire_stale_calls(Duration::from_secs(300)), 0);

        assert_eq!(reg.expire_stale_calls(Duration::ZERO), 1);
        let events = drain(&mut rx);
        let to_c1 = events_for(&events, "c1", ConnectionRole::Caller);
        assert_eq!(to_c1[0].event_name, EventName::CALL_TIMEOUT);
        assert_eq!(to_c1[0].data["callId"], r1.call_id);

        assert_eq!(
            reg.accept_call("bid-1", "b", &r1.call_id).unwrap_err(),
            SessionError::CallNotFound(r1.call_id.clone())
        );
    }

    #[test]
    fn end_call_removes_source_and_notifies_both_parties() {
        let (reg, mut rx) = setup();
        live_session(&reg);
        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        reg.accept_call("bid-1", "b", &r1.call_id).unwrap();
        drain(&mut rx);

        let ended = reg.end_call("bid-1", "c1", &r1.call_id).unwrap();
        assert_eq!(ended.status, CallStatus::Ended);
        assert!(reg.audio_sources("bid-1").unwrap().is_empty());

        let events = drain(&mut rx);
        for (id, role) in [("b", ConnectionRole::Broadcaster), ("c1", ConnectionRole::Caller)] {
            assert!(events_for(&events, id, role)
                .iter()
                .any(|p| p.event_name == EventName::CALL_ENDED));
        }

        assert_eq!(
            reg.end_call("bid-1", "b", &r1.call_id).unwrap_err(),
            SessionError::CallNotActive(r1.call_id.clone())
        );
    }

    #[test]
    fn caller_disconnect_cleans_up_every_registration() {
        let (reg, _rx) = setup();
        live_session(&reg);
        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        reg.request_call("bid-1", "c2", caller("Two")).unwrap();
        reg.accept_call("bid-1", "b", &r1.call_id).unwrap();

        reg.disconnect(&conn("c1", ConnectionRole::Caller, "bid-1"));
        reg.disconnect(&conn("c2", ConnectionRole::Caller, "bid-1"));

        let stats = reg.stats("bid-1").unwrap();
        assert_eq!(stats.active_calls, 0);
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.listener_count, 0);
        assert!(reg
            .audio_sources("bid-1")
            .unwrap()
            .iter()
            .all(|s| s.owner_connection_id != "c1" && s.owner_connection_id != "c2"));
    }

    #[test]
    fn broadcaster_disconnect_tears_down_everything() {
        let (reg, mut rx) = setup();
        live_session(&reg);
        reg.join_as_listener("bid-1", "l3", Value::Null).unwrap();
        let (r1, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        reg.request_call("bid-1", "c2", caller("Two")).unwrap();
        reg.accept_call("bid-1", "b", &r1.call_id).unwrap();
        drain(&mut rx);

        reg.disconnect(&conn("b", ConnectionRole::Broadcaster, "bid-1"));

        assert!(!reg.contains("bid-1"));
        assert_eq!(reg.server_stats(0).total_active_calls, 0);

        let events = drain(&mut rx);
        for listener in ["c1", "c2", "l3"] {
            assert!(
                events_for(&events, listener, ConnectionRole::Listener)
                    .iter()
                    .any(|p| p.event_name == EventName::BROADCAST_ENDED),
                "{listener} was not told the broadcast ended"
            );
        }
        assert!(events_for(&events, "c1", ConnectionRole::Caller)
            .iter()
            .any(|p| p.event_name == EventName::CALL_ENDED));

        // Late teardown from a listener is a no-op.
        reg.disconnect(&conn("l3", ConnectionRole::Listener, "bid-1"));
        assert!(reg.is_empty());
    }

    #[test]
    fn audio_sources_respect_ownership_and_capacity() {
        let (reg, _rx) = setup();
        live_session(&reg);

        let new = |id: &str| NewAudioSource {
            source_id: id.to_string(),
            kind: SourceKind::Music,
            display_name: None,
            volume: Some(0.5),
            muted: false,
            active: None,
            priority: 0,
        };

        assert_eq!(
            reg.add_audio_source("bid-1", "c1", new("bed")).unwrap_err(),
            SessionError::NotBroadcaster
        );
        reg.add_audio_source("bid-1", "b", new("bed")).unwrap();
        assert!(matches!(
            reg.add_audio_source("bid-1", "b", new("bed")),
            Err(SessionError::InvalidPayload(_))
        ));

        let updated = reg
            .update_audio_source(
                "bid-1",
                "b",
                AudioSourcePatch {
                    source_id: "bed".into(),
                    muted: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(updated.muted);
        assert_eq!(updated.volume, 0.5);

        for i in 1..Config::default().max_audio_sources {
            reg.add_audio_source("bid-1", "b", new(&format!("fx{i}"))).unwrap();
        }
        assert_eq!(
            reg.add_audio_source("bid-1", "b", new("one-too-many")).unwrap_err(),
            SessionError::SourceCapacityExceeded(16)
        );

        reg.remove_audio_source("bid-1", "b", "bed").unwrap();
        assert_eq!(
            reg.remove_audio_source("bid-1", "b", "bed").unwrap_err(),
            SessionError::SourceNotFound("bed".into())
        );
    }

    #[test]
    fn audio_relay_marks_live_and_reaches_listeners_only() {
        let fanout = GatewayBroadcast::new();
        let mut rx = fanout.subscribe();
        let mut audio = fanout.subscribe_audio();
        let reg = BroadcastRegistry::new(Arc::new(Config::default()), fanout);
        live_session(&reg);
        drain(&mut rx);

        assert_eq!(
            reg.relay_audio(
                "bid-1",
                "c1",
                BroadcastAudioPayload { audio: "AAAA".into(), timestamp: None, metrics: Value::Null },
            )
            .unwrap_err(),
            SessionError::NotBroadcaster
        );

        reg.relay_audio(
            "bid-1",
            "b",
            BroadcastAudioPayload { audio: "AAAA".into(), timestamp: Some(42), metrics: Value::Null },
        )
        .unwrap();
        assert!(reg.stats("bid-1").unwrap().is_live);
        assert!(drain(&mut rx).is_empty());

        let events = drain(&mut audio);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_name, EventName::AUDIO_STREAM);
        assert!(events[0].recipients.includes("c1", ConnectionRole::Listener));
        assert!(!events[0].recipients.includes("b", ConnectionRole::Broadcaster));
        assert_eq!(events[0].data["timestamp"], 42);
    }

    #[test]
    fn audio_from_another_broadcast_never_drops_control_events() {
        let (reg, mut rx) = setup();
        live_session(&reg);
        let (request, _) = reg.request_call("bid-1", "c1", caller("One")).unwrap();
        reg.join_as_broadcaster("bid-2", "b2", Value::Null).unwrap();
        reg.join_as_listener("bid-2", "l2", Value::Null).unwrap();
        drain(&mut rx);

        reg.accept_call("bid-1", "b", &request.call_id).unwrap();
        for _ in 0..5_000 {
            reg.relay_audio(
                "bid-2",
                "b2",
                BroadcastAudioPayload { audio: "AAAA".into(), timestamp: None, metrics: Value::Null },
            )
            .unwrap();
        }

        let events = drain(&mut rx);
        let accepted = events_for(&events, "c1", ConnectionRole::Caller);
        assert!(accepted.iter().any(|p| p.event_name == EventName::CALL_ACCEPTED));
        assert!(events.iter().all(|p| p.event_name != EventName::AUDIO_STREAM));
    }

    #[test]
    fn end_broadcast_reports_final_stats() {
        let (reg, _rx) = setup();
        live_session(&reg);
        reg.request_call("bid-1", "c1", caller("One")).unwrap();

        let stats = reg.end_broadcast("bid-1", "Show is over").unwrap();
        assert_eq!(stats.total_calls, 1);
        assert_eq!(stats.peak_listeners, 2);
        assert!(!reg.contains("bid-1"));
        assert!(matches!(
            reg.end_broadcast("bid-1", "again"),
            Err(SessionError::BroadcastNotFound(_))
        ));
    }
}
