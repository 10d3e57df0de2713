//! Per-socket gateway session state.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::connection::ConnectionRole;

/// State owned by a single WebSocket event loop.
pub struct GatewaySession {
    /// `conn_` prefixed ULID, also the key in the connection table.
    pub connection_id: String,
    /// Cached role used to filter role-addressed fanout events.
    role: Mutex<ConnectionRole>,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl GatewaySession {
    pub fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            role: Mutex::new(ConnectionRole::Unset),
            seq: AtomicU64::new(0),
        }
    }

    /// Get the next sequence number for a dispatch event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn role(&self) -> ConnectionRole {
        *self.role.lock()
    }

    pub fn set_role(&self, role: ConnectionRole) {
        *self.role.lock() = role;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_starts_at_one_and_increases() {
        let session = GatewaySession::new("conn_1".into());
        assert_eq!(session.next_seq(), 1);
        assert_eq!(session.next_seq(), 2);
        assert_eq!(session.role(), ConnectionRole::Unset);

        session.set_role(ConnectionRole::Caller);
        assert_eq!(session.role(), ConnectionRole::Caller);
    }
}
