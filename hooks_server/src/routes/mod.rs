//! HTTP routes — webhook intake, event history API, realtime socket.

pub mod api;
pub mod webhook;
pub mod websocket;

use std::path::Path;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::services::broadcast_hub::BroadcastHub;
use crate::services::event_store::EventStore;
use crate::services::pipeline::BuildPipeline;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct HooksState {
    pub store: Arc<EventStore>,
    pub hub: Arc<BroadcastHub>,
    pub pipeline: Arc<BuildPipeline>,
}

/// Build the application router (everything lives under `/webhook`).
pub fn hooks_router(state: HooksState, static_dir: &Path) -> Router {
    Router::new()
        .route(
            "/webhook",
            get(api::recent_events).post(webhook::handle_webhook),
        )
        .route("/webhook/api/events", get(api::list_events))
        .route("/webhook/api/events/{event_id}", get(api::get_event))
        .route("/webhook/realtime", get(websocket::realtime))
        .nest_service("/webhook/static", ServeDir::new(static_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
