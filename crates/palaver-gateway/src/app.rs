use std::sync::Arc;
use std::time::Instant;

use axum::{
    routing::{get, post},
    Router,
};
use palaver_core::{CommandSink, PalaverConfig};
use palaver_ipc::IpcCommandRouter;
use palaver_pipeline::MessageLifecyclePipeline;

use crate::telnet::TelnetClient;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: Arc<PalaverConfig>,
    pub pipeline: Arc<MessageLifecyclePipeline>,
    pub router: Arc<IpcCommandRouter>,
    /// Queue consumed by the command router; webhooks enqueue here.
    pub commands: CommandSink,
    pub telnet: Option<Arc<TelnetClient>>,
    pub started_at: Instant,
}

/// Assemble the HTTP surface.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/webhooks/{source}", post(crate::http::webhooks::webhook_handler))
        .route("/ipc/{command}", post(crate::http::ipc::ipc_handler))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
