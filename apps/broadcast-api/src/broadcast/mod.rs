//! Broadcast sessions, call admission and the session registry.

pub mod calls;
pub mod registry;
pub mod session;

pub use registry::{BroadcastRegistry, ServerStats};
