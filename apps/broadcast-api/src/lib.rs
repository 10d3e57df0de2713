pub mod broadcast;
pub mod config;
pub mod error;
pub mod gateway;
pub mod housekeeping;
pub mod routes;

use std::sync::Arc;

use broadcast::BroadcastRegistry;
use config::Config;
use gateway::connection::ConnectionTable;
use gateway::fanout::GatewayBroadcast;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<BroadcastRegistry>,
    pub connections: Arc<ConnectionTable>,
    pub broadcast: GatewayBroadcast,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config.validated());
        let broadcast = GatewayBroadcast::new();
        Self {
            registry: Arc::new(BroadcastRegistry::new(config.clone(), broadcast.clone())),
            connections: Arc::new(ConnectionTable::new()),
            broadcast,
            config,
        }
    }
}
