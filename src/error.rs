use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// No live (or starting) stream to negotiate against
    #[error("Camera unavailable: {0}")]
    CameraUnavailable(String),

    /// The media relay answered the offer with a non-success status
    #[error("Relay rejected negotiation ({status}): {reason}")]
    RelayRejected { status: u16, reason: String },

    /// The media relay did not answer within the negotiation window
    #[error("Negotiation timed out after {timeout_ms}ms")]
    NegotiationTimeout { timeout_ms: u64 },

    #[error("Upstream start failed for camera {camera_id}: {reason}")]
    UpstreamStartFailed { camera_id: String, reason: String },

    /// Terminal for a viewer session: reconnection gave up
    #[error("Unable to connect: session {session_id} gave up after {attempts} attempts")]
    RetryBudgetExhausted { session_id: String, attempts: u32 },

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Error response body (unified success format)
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    /// Stable machine-readable error kind for clients
    pub kind: &'static str,
}

impl AppError {
    /// Stable identifier of the error kind, used by clients to pick a UI state
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::CameraUnavailable(_) => "camera_unavailable",
            AppError::RelayRejected { .. } => "relay_rejected",
            AppError::NegotiationTimeout { .. } => "negotiation_timeout",
            AppError::UpstreamStartFailed { .. } => "upstream_start_failed",
            AppError::RetryBudgetExhausted { .. } => "retry_budget_exhausted",
            AppError::ServiceUnavailable(_) => "service_unavailable",
            AppError::Database(_) => "database",
            AppError::Http(_) => "http",
            AppError::Internal(_) => "internal",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Serialization(_) => "serialization",
        }
    }

    /// Whether a viewer may retry the failed operation later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::CameraUnavailable(_)
                | AppError::RelayRejected { .. }
                | AppError::NegotiationTimeout { .. }
                | AppError::UpstreamStartFailed { .. }
                | AppError::ServiceUnavailable(_)
                | AppError::Http(_)
        )
    }

    /// HTTP status for endpoints that speak raw protocol bodies (WHEP)
    pub fn http_status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::CameraUnavailable(_)
            | AppError::UpstreamStartFailed { .. }
            | AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RelayRejected { .. } | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            AppError::NegotiationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::RetryBudgetExhausted { .. } => StatusCode::GONE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn status_code(&self) -> StatusCode {
        // Always return 200 OK - success/failure is indicated by the success field
        StatusCode::OK
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            success: false,
            message: self.to_string(),
            kind: self.kind(),
        };

        tracing::error!(
            error_kind = body.kind,
            error_message = %body.message,
            "Request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
