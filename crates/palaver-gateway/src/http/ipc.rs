//! Direct command endpoint: POST /ipc/{command}.
//!
//! Runs the command synchronously and returns the handler's result. No
//! authentication; bind the gateway to a trusted interface.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::app::AppState;
use crate::http::{error::ApiError, push_command};

pub async fn ipc_handler(
    State(state): State<Arc<AppState>>,
    Path(command): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(palaver_core::PalaverError::from)?
    };

    info!(command = %command, "ipc command received over http");
    let result = state.router.dispatch(push_command(&command, payload)).await?;
    Ok(Json(json!({"ok": true, "result": result})))
}
