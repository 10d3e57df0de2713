//! Per-socket connection bookkeeping.
//!
//! A `Connection` is set once by the first role-establishing event and is
//! otherwise immutable; the only permitted change is a listener promoting
//! itself to caller. Disconnect teardown is driven entirely by this record.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::error::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Unset,
    Broadcaster,
    Listener,
    Caller,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unset => "unset",
            Self::Broadcaster => "broadcaster",
            Self::Listener => "listener",
            Self::Caller => "caller",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: String,
    pub broadcast_id: Option<String>,
    pub role: ConnectionRole,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            broadcast_id: None,
            role: ConnectionRole::Unset,
            connected_at: Utc::now(),
        }
    }
}

/// Table of every open control-channel connection.
pub struct ConnectionTable {
    inner: DashMap<String, Connection>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn open(&self, connection_id: &str) -> Connection {
        let conn = Connection::new(connection_id.to_string());
        self.inner.insert(connection_id.to_string(), conn.clone());
        conn
    }

    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.inner.get(connection_id).map(|c| c.clone())
    }

    /// Set the role and broadcast of an unclassified connection.
    pub fn assign(
        &self,
        connection_id: &str,
        role: ConnectionRole,
        broadcast_id: &str,
    ) -> Result<Connection, SessionError> {
        let mut entry = self
            .inner
            .get_mut(connection_id)
            .ok_or(SessionError::NotJoined)?;
        if entry.role != ConnectionRole::Unset {
            return Err(SessionError::RoleAlreadySet(entry.role.to_string()));
        }
        entry.role = role;
        entry.broadcast_id = Some(broadcast_id.to_string());
        Ok(entry.clone())
    }

    /// Promote a listener to caller. Idempotent for connections that are
    /// already callers.
    pub fn promote_to_caller(&self, connection_id: &str) -> Result<Connection, SessionError> {
        let mut entry = self
            .inner
            .get_mut(connection_id)
            .ok_or(SessionError::NotJoined)?;
        match entry.role {
            ConnectionRole::Listener | ConnectionRole::Caller => {
                entry.role = ConnectionRole::Caller;
                Ok(entry.clone())
            }
            ConnectionRole::Unset => Err(SessionError::NotJoined),
            ConnectionRole::Broadcaster => {
                Err(SessionError::RoleAlreadySet(entry.role.to_string()))
            }
        }
    }

    /// Remove the record, returning it for teardown.
    pub fn close(&self, connection_id: &str) -> Option<Connection> {
        self.inner.remove(connection_id).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
