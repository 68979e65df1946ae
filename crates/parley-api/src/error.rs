use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::media::MediaError;

/// Failure taxonomy for request handlers. Everything a handler can fail
/// with is caught at the request boundary and turned into an HTTP response;
/// nothing is allowed to crash the connection-handling process.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Rejected before any side effect took place.
    #[error("{0}")]
    Validation(String),

    /// The media collaborator failed; the enclosing send was aborted with
    /// nothing persisted and nothing pushed.
    #[error("upload failed: {0}")]
    Upload(#[from] MediaError),

    #[error("unauthorized")]
    Unauthorized,

    /// A referenced user does not exist. An *offline* peer is never an
    /// error anywhere — this is only for unknown identities.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("username already taken")]
    UsernameTaken,

    /// Store unavailable or corrupt. Surfaced as a generic failure; the
    /// operation is fully abortable and re-issuable by the caller.
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upload(_) => StatusCode::BAD_GATEWAY,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::UsernameTaken => StatusCode::CONFLICT,
            ApiError::Persistence(e) => {
                error!("internal error: {e:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let message = match &self {
            ApiError::Persistence(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
