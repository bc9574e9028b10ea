use axum::{
    routing::{any, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::ws::ws_handler;
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let camera_routes = Router::new()
        .route("/cameras", get(handlers::list_cameras))
        .route("/cameras/:id", get(handlers::get_camera))
        .route("/cameras/:id/viewers", post(handlers::register_viewer))
        .route("/cameras/:id/degraded", post(handlers::mark_degraded))
        // WHEP (raw SDP in/out)
        .route("/cameras/:id/whep", post(handlers::whep));

    let session_routes = Router::new()
        .route("/sessions", get(handlers::list_sessions))
        .route(
            "/sessions/:id",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/:id/offer", post(handlers::session_offer))
        .route("/sessions/:id/drop", post(handlers::session_drop));

    let system_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/stats", get(handlers::stats))
        .route("/relay/paths", get(handlers::relay_paths))
        .route(
            "/config",
            get(handlers::get_config).post(handlers::update_config),
        )
        // WebSocket endpoint for real-time events
        .route("/ws", any(ws_handler));

    let api_routes = Router::new()
        .merge(camera_routes)
        .merge(session_routes)
        .merge(system_routes);

    Router::new()
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
