//! Webhook ingress endpoint: POST /webhooks/{source}.
//!
//! Accepts JSON payloads from any push provider. Each source is
//! authenticated independently according to its `auth_mode` in
//! `[webhooks]`, then queued as the source's IPC command with a push
//! trigger.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::http::push_command;
use palaver_core::config::WebhookAuthMode;

type HmacSha256 = Hmac<Sha256>;

// ── Public handler ────────────────────────────────────────────────────────────

/// POST /webhooks/{source}
///
/// Verifies the request signature/token and queues the configured command.
/// Returns 202 + receipt ID on success, 401 on auth failure, 503 when the
/// command queue is full.
pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let cfg = &state.config.webhooks;

    if !cfg.enabled {
        warn!(source = %source, "webhook received but subsystem is disabled");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "webhook subsystem is disabled", "code": "WEBHOOKS_DISABLED"})),
        ));
    }

    let source_cfg = cfg
        .sources
        .iter()
        .find(|s| s.name == source)
        .ok_or_else(|| {
            warn!(source = %source, "unknown webhook source");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown webhook source", "code": "UNKNOWN_SOURCE"})),
            )
        })?;

    info!(source = %source, bytes = body.len(), "webhook arrived");

    // Authenticate the request according to the configured mode.
    match &source_cfg.auth_mode {
        WebhookAuthMode::HmacSha256 => {
            verify_hmac_sha256(&headers, &body, source_cfg.secret.as_deref())
                .map_err(|e| auth_error(&e))?;
        }
        WebhookAuthMode::BearerToken => {
            verify_bearer_token(&headers, source_cfg.secret.as_deref())
                .map_err(|e| auth_error(&e))?;
        }
        WebhookAuthMode::None => {}
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(source = %source, error = %e, "invalid JSON in webhook body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body", "code": "INVALID_JSON"})),
        )
    })?;

    let receipt_id = uuid::Uuid::new_v4().to_string();
    let command = push_command(&source_cfg.command, payload);
    if !state.commands.enqueue(command) {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "command queue is full", "code": "BUSY"})),
        ));
    }

    info!(source = %source, command = %source_cfg.command, receipt_id = %receipt_id, "webhook accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"ok": true, "receipt_id": receipt_id, "command": source_cfg.command})),
    ))
}

// ── Auth helpers ──────────────────────────────────────────────────────────────

/// Verify GitHub-style HMAC-SHA256: `sha256=<hex>` in X-Hub-Signature-256.
fn verify_hmac_sha256(
    headers: &HeaderMap,
    body: &Bytes,
    secret: Option<&str>,
) -> Result<(), String> {
    let secret = secret.ok_or_else(|| "no HMAC secret configured for this source".to_string())?;

    let sig_header = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing X-Hub-Signature-256 header".to_string())?;

    let sig_hex = sig_header
        .strip_prefix("sha256=")
        .ok_or_else(|| "malformed X-Hub-Signature-256 header".to_string())?;

    let expected =
        hex::decode(sig_hex).map_err(|_| "X-Hub-Signature-256 is not valid hex".to_string())?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| "invalid HMAC key length".to_string())?;
    mac.update(body);

    mac.verify_slice(&expected)
        .map_err(|_| "HMAC signature mismatch".to_string())
}

/// Verify a static bearer token in the `Authorization: Bearer <token>` header.
fn verify_bearer_token(headers: &HeaderMap, secret: Option<&str>) -> Result<(), String> {
    let expected =
        secret.ok_or_else(|| "no bearer token configured for this source".to_string())?;

    let auth_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| "missing Authorization header".to_string())?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| "Authorization header must use Bearer scheme".to_string())?;

    if token == expected {
        Ok(())
    } else {
        Err("bearer token mismatch".to_string())
    }
}

// ── Error helpers ─────────────────────────────────────────────────────────────

fn auth_error(reason: &str) -> (StatusCode, Json<Value>) {
    warn!(reason = %reason, "webhook authentication failed");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "authentication failed", "code": "AUTH_FAILED", "reason": reason})),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn hmac_accepts_matching_signature() {
        let body = Bytes::from_static(br#"{"text":"hi"}"#);
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature-256",
            HeaderValue::from_str(&sign("s3cret", &body)).unwrap(),
        );
        assert!(verify_hmac_sha256(&headers, &body, Some("s3cret")).is_ok());
        assert!(verify_hmac_sha256(&headers, &body, Some("other")).is_err());
    }

    #[test]
    fn hmac_requires_header_and_secret() {
        let body = Bytes::from_static(b"{}");
        assert!(verify_hmac_sha256(&HeaderMap::new(), &body, Some("s")).is_err());

        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", HeaderValue::from_static("deadbeef"));
        assert!(verify_hmac_sha256(&headers, &body, Some("s")).is_err());
        assert!(verify_hmac_sha256(&headers, &body, None).is_err());
    }

    #[test]
    fn bearer_token_must_match() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert!(verify_bearer_token(&headers, Some("tok")).is_ok());
        assert!(verify_bearer_token(&headers, Some("nope")).is_err());

        headers.insert("authorization", HeaderValue::from_static("Basic tok"));
        assert!(verify_bearer_token(&headers, Some("tok")).is_err());
    }
}
