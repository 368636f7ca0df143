//! Control-plane HTTP surface and process wiring.

pub mod http;
pub mod metrics;
pub mod state;

pub use http::create_router;
pub use metrics::init_metrics;
pub use state::AppState;

use thiserror::Error;

/// Server errors, mapped to HTTP statuses at the boundary.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

impl From<voicebridge_pipeline::SessionError> for ServerError {
    fn from(err: voicebridge_pipeline::SessionError) -> Self {
        use voicebridge_pipeline::SessionError;
        match err {
            SessionError::NotFound(id) => ServerError::NotFound(id),
            SessionError::WrongState(message) => ServerError::Conflict(message),
            SessionError::Store(e) => ServerError::Unavailable(e.to_string()),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        use axum::http::StatusCode;
        match err {
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
