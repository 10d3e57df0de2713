//! Periodic background work: stale-call expiry and server statistics.

use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::broadcast::BroadcastRegistry;
use crate::config::Config;
use crate::gateway::connection::{ConnectionRole, ConnectionTable};
use crate::gateway::events::EventName;
use crate::gateway::fanout::{GatewayBroadcast, Recipients};

/// Run one statistics report: log it and push it to every broadcaster.
pub fn report_stats(
    registry: &BroadcastRegistry,
    connections: &ConnectionTable,
    fanout: &GatewayBroadcast,
) {
    let stats = registry.server_stats(connections.len());
    tracing::info!(
        active_sessions = stats.active_sessions,
        total_connections = stats.total_connections,
        total_listeners = stats.total_listeners,
        total_active_calls = stats.total_active_calls,
        "server stats"
    );
    fanout.dispatch(
        Recipients::Role(ConnectionRole::Broadcaster),
        EventName::SERVER_STATS,
        json!(stats),
    );
}

/// Spawn the housekeeping task. It runs until the runtime shuts down.
pub fn spawn(
    config: Arc<Config>,
    registry: Arc<BroadcastRegistry>,
    connections: Arc<ConnectionTable>,
    fanout: GatewayBroadcast,
) -> JoinHandle<()> {
    let config = Arc::new(Config::clone(&config).validated());
    tokio::spawn(async move {
        let mut sweep = time::interval(config.call_sweep_interval);
        let mut report = time::interval(config.stats_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        report.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Both intervals fire immediately; skip that.
        sweep.tick().await;
        report.tick().await;

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    let expired = registry.expire_stale_calls(config.call_timeout);
                    if expired > 0 {
                        tracing::info!(expired, "expired stale call requests");
                    }
                }
                _ = report.tick() => {
                    report_stats(&registry, &connections, &fanout);
                }
            }
        }
    })
}
