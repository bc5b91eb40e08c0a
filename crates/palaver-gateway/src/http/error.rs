use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use palaver_core::PalaverError;
use serde_json::json;

/// JSON error body: `{"error": "...", "code": "BUSY"}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl From<PalaverError> for ApiError {
    fn from(e: PalaverError) -> Self {
        let status = match &e {
            PalaverError::UnknownCommand { .. } => StatusCode::NOT_FOUND,
            PalaverError::Busy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PalaverError::Cancelled { .. } => StatusCode::CONFLICT,
            PalaverError::Serialization(_) => StatusCode::BAD_REQUEST,
            PalaverError::Extension { .. } | PalaverError::Completion(_) | PalaverError::Send { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"error": self.message, "code": self.code})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_maps_to_503_with_code() {
        let e = ApiError::from(PalaverError::Busy {
            conversation: "c1".into(),
            depth: 8,
        });
        assert_eq!(e.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(e.code, "BUSY");
    }

    #[test]
    fn unknown_command_maps_to_404() {
        let e = ApiError::from(PalaverError::UnknownCommand {
            command: "nope".into(),
        });
        assert_eq!(e.status, StatusCode::NOT_FOUND);
        assert_eq!(e.code, "UNKNOWN_COMMAND");
    }
}
