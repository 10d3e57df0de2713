//! State of one live broadcast: audio sources, listeners, calls and stats.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::gateway::fanout::Recipients;

use super::calls::{CallQueue, CallRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Host,
    Guest,
    Caller,
    Music,
    Effects,
}

/// One contributor to a broadcast's mix.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AudioSource {
    pub id: String,
    pub kind: SourceKind,
    pub display_name: String,
    pub volume: f32,
    pub muted: bool,
    pub active: bool,
    pub priority: i32,
    pub owner_connection_id: String,
}

/// Fields sent with `add-audio-source`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAudioSource {
    pub source_id: String,
    pub kind: SourceKind,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub volume: Option<f32>,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub priority: i32,
}

/// Partial update sent with `update-audio-source`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSourcePatch {
    pub source_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub volume: Option<f32>,
    #[serde(default)]
    pub muted: Option<bool>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub priority: Option<i32>,
}

impl AudioSource {
    pub fn from_new(new: NewAudioSource, owner_connection_id: &str) -> Self {
        Self {
            display_name: new.display_name.unwrap_or_else(|| new.source_id.clone()),
            id: new.source_id,
            kind: new.kind,
            volume: new.volume.unwrap_or(1.0).clamp(0.0, 1.0),
            muted: new.muted,
            active: new.active.unwrap_or(true),
            priority: new.priority,
            owner_connection_id: owner_connection_id.to_string(),
        }
    }

    pub fn apply(&mut self, patch: AudioSourcePatch) {
        if let Some(name) = patch.display_name {
            self.display_name = name;
        }
        if let Some(volume) = patch.volume {
            self.volume = volume.clamp(0.0, 1.0);
        }
        if let Some(muted) = patch.muted {
            self.muted = muted;
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
    }
}

/// Source ID for an accepted caller. Always derived from the caller's
/// current connection, so a reconnecting caller gets a fresh source.
pub fn caller_source_id(caller_connection_id: &str) -> String {
    format!("caller_{caller_connection_id}")
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub start_time: DateTime<Utc>,
    pub peak_listeners: usize,
    pub total_calls: u64,
    pub total_messages: u64,
}

/// Read-only statistics snapshot for one broadcast.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastStats {
    pub broadcast_id: String,
    pub is_live: bool,
    pub has_broadcaster: bool,
    pub listener_count: usize,
    pub peak_listeners: usize,
    pub total_calls: u64,
    pub total_messages: u64,
    pub active_calls: usize,
    pub queue_length: usize,
    pub audio_sources: usize,
    pub start_time: DateTime<Utc>,
    pub uptime_seconds: i64,
}

pub struct BroadcastSession {
    pub broadcast_id: String,
    pub broadcaster_connection_id: Option<String>,
    pub is_live: bool,
    pub listeners: HashSet<String>,
    pub audio_sources: BTreeMap<String, AudioSource>,
    pub call_queue: CallQueue,
    /// Active calls keyed by caller connection ID.
    pub active_calls: HashMap<String, CallRequest>,
    pub stats: SessionStats,
}

impl BroadcastSession {
    pub fn new(broadcast_id: &str) -> Self {
        Self {
            broadcast_id: broadcast_id.to_string(),
            broadcaster_connection_id: None,
            is_live: false,
            listeners: HashSet::new(),
            audio_sources: BTreeMap::new(),
            call_queue: CallQueue::new(),
            active_calls: HashMap::new(),
            stats: SessionStats {
                start_time: Utc::now(),
                peak_listeners: 0,
                total_calls: 0,
                total_messages: 0,
            },
        }
    }

    pub fn add_listener(&mut self, connection_id: &str) {
        self.listeners.insert(connection_id.to_string());
        self.stats.peak_listeners = self.stats.peak_listeners.max(self.listeners.len());
    }

    pub fn is_broadcaster(&self, connection_id: &str) -> bool {
        self.broadcaster_connection_id.as_deref() == Some(connection_id)
    }

    pub fn find_active_call(&self, call_id: &str) -> Option<&CallRequest> {
        self.active_calls.values().find(|c| c.call_id == call_id)
    }

    pub fn has_call_for(&self, connection_id: &str) -> bool {
        self.active_calls.contains_key(connection_id) || self.call_queue.contains_caller(connection_id)
    }

    /// Remove every audio source owned by `connection_id`, returning their IDs.
    pub fn remove_sources_owned_by(&mut self, connection_id: &str) -> Vec<String> {
        let owned: Vec<String> = self
            .audio_sources
            .values()
            .filter(|s| s.owner_connection_id == connection_id)
            .map(|s| s.id.clone())
            .collect();
        for id in &owned {
            self.audio_sources.remove(id);
        }
        owned
    }

    pub fn broadcaster(&self) -> Recipients {
        Recipients::Connections(self.broadcaster_connection_id.iter().cloned().collect())
    }

    pub fn audience(&self) -> Recipients {
        Recipients::Connections(self.listeners.clone())
    }

    /// Broadcaster plus every listener.
    pub fn everyone(&self) -> Recipients {
        let mut ids = self.listeners.clone();
        ids.extend(self.broadcaster_connection_id.iter().cloned());
        Recipients::Connections(ids)
    }

    pub fn queue_snapshot(&self) -> Vec<CallRequest> {
        self.call_queue.iter().cloned().collect()
    }

    pub fn sources_snapshot(&self) -> Vec<AudioSource> {
        self.audio_sources.values().cloned().collect()
    }

    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            broadcast_id: self.broadcast_id.clone(),
            is_live: self.is_live,
            has_broadcaster: self.broadcaster_connection_id.is_some(),
            listener_count: self.listeners.len(),
            peak_listeners: self.stats.peak_listeners,
            total_calls: self.stats.total_calls,
            total_messages: self.stats.total_messages,
            active_calls: self.active_calls.len(),
            queue_length: self.call_queue.len(),
            audio_sources: self.audio_sources.len(),
            start_time: self.stats.start_time,
            uptime_seconds: (Utc::now() - self.stats.start_time).num_seconds(),
        }
    }
}
