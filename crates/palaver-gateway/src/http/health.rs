use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe, returns runtime metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let platforms: Vec<Value> = state
        .pipeline
        .dispatcher()
        .statuses()
        .into_iter()
        .map(|(platform, status)| json!({"platform": platform, "status": status}))
        .collect();

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "platforms": platforms,
        "commands": state.router.commands(),
        "conversations": state.pipeline.store().conversation_count(),
        "telnet_connections": state.telnet.as_ref().map(|t| t.connection_count()).unwrap_or(0),
    }))
}
