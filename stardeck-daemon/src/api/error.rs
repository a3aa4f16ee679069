use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use stardeck_core::StardeckError;
use tracing::warn;

/// Error returned by HTTP handlers; renders as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    BadRequest(String),
    Core(StardeckError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Core(err) => status_for(err),
        }
    }
}

/// HTTP status for a core error, looking through step wrappers to the cause.
pub fn status_for(err: &StardeckError) -> StatusCode {
    match err.root() {
        StardeckError::NotFound { .. } => StatusCode::NOT_FOUND,
        StardeckError::Conflict { .. } => StatusCode::CONFLICT,
        StardeckError::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
        StardeckError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        StardeckError::EngineUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StardeckError> for ApiError {
    fn from(err: StardeckError) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::Unauthorized(msg) | ApiError::BadRequest(msg) => msg,
            ApiError::Core(err) => {
                if status.is_server_error() {
                    warn!(error = %err, "request failed");
                }
                err.to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
