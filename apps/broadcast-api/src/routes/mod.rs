pub mod broadcasts;
pub mod health;

use axum::Router;
use utoipa::OpenApi;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(crate::gateway::server::router())
        .nest("/api/v1", broadcasts::router())
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Broadcast API",
        description = "Live broadcast sessions, call admission and statistics. \
                       Real-time control runs over the WebSocket gateway at /gateway.",
    ),
    paths(
        // Health
        health::health,
        // Broadcasts
        broadcasts::start_broadcast,
        broadcasts::end_broadcast,
        broadcasts::broadcast_stats,
        broadcasts::list_sources,
        broadcasts::server_stats,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            // Session types
            crate::broadcast::session::BroadcastStats,
            crate::broadcast::session::AudioSource,
            crate::broadcast::session::SourceKind,
            crate::broadcast::calls::CallRequest,
            crate::broadcast::calls::CallStatus,
            crate::broadcast::ServerStats,
            // Route response types
            health::HealthResponse,
        )
    ),
    tags(
        (name = "Health", description = "Liveness probe"),
        (name = "Broadcasts", description = "Broadcast session lifecycle"),
        (name = "Server", description = "Server-wide statistics"),
    ),
)]
pub struct ApiDoc;
