//! Call requests and the strict-FIFO admission queue.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use onair_common::id::{prefix, PrefixedId};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    Pending,
    Active,
    Rejected,
    TimedOut,
    Ended,
}

/// One admission attempt by a caller.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub call_id: String,
    pub caller_connection_id: String,
    pub caller_name: String,
    pub caller_location: String,
    pub request_time: DateTime<Utc>,
    pub status: CallStatus,
}

impl PrefixedId for CallRequest {
    const PREFIX: &'static str = prefix::CALL;
}

impl CallRequest {
    pub fn new(caller_connection_id: &str, caller_name: Option<String>, caller_location: Option<String>) -> Self {
        Self {
            call_id: Self::generate(),
            caller_connection_id: caller_connection_id.to_string(),
            caller_name: caller_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| "Anonymous".to_string()),
            caller_location: caller_location.unwrap_or_default(),
            request_time: Utc::now(),
            status: CallStatus::Pending,
        }
    }
}

/// Pending call requests in arrival order.
///
/// Entries are removed by `call_id`, never by position, so a caller hanging
/// up mid-queue leaves the relative order of everyone else intact.
#[derive(Debug, Default)]
pub struct CallQueue {
    entries: VecDeque<CallRequest>,
}

impl CallQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail and return the 1-based position.
    pub fn push(&mut self, call: CallRequest) -> usize {
        self.entries.push_back(call);
        self.entries.len()
    }

    pub fn remove(&mut self, call_id: &str) -> Option<CallRequest> {
        let idx = self.entries.iter().position(|c| c.call_id == call_id)?;
        self.entries.remove(idx)
    }

    pub fn remove_by_caller(&mut self, connection_id: &str) -> Option<CallRequest> {
        let idx = self
            .entries
            .iter()
            .position(|c| c.caller_connection_id == connection_id)?;
        self.entries.remove(idx)
    }

    pub fn contains_caller(&self, connection_id: &str) -> bool {
        self.entries
            .iter()
            .any(|c| c.caller_connection_id == connection_id)
    }

    /// Remove every entry requested longer than `max_age` before `now`.
    pub fn drain_expired(&mut self, now: DateTime<Utc>, max_age: Duration) -> Vec<CallRequest> {
        let mut expired = Vec::new();
        self.entries.retain(|c| {
            // Negative ages (clock skew) never expire.
            let age = (now - c.request_time).to_std().unwrap_or(Duration::ZERO);
            if age >= max_age && now >= c.request_time {
                expired.push(c.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &CallRequest> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = CallRequest> + '_ {
        self.entries.drain(..)
    }
}
