use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use thiserror::Error;
use tracing::error;

use crucible_core::CoreErr;
use crucible_protocol::ErrorBody;

/// API-level failures, each mapping onto one HTTP status. Error bodies are
/// always `{"detail": ...}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreErr),

    #[error("API key required")]
    ApiKeyRequired,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("Stream not found")]
    StreamNotFound,

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Core(err) => match err {
                CoreErr::SessionExists(_) => StatusCode::CONFLICT,
                CoreErr::SessionNotFound(_)
                | CoreErr::SessionGone(_)
                | CoreErr::ArtifactNotFound(_) => StatusCode::NOT_FOUND,
                CoreErr::PathEscape(_) => StatusCode::FORBIDDEN,
                CoreErr::PluginLoadFailed { .. } | CoreErr::InvalidFileName(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoreErr::KernelStartFailed(_) | CoreErr::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            ApiError::ApiKeyRequired | ApiError::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ApiError::StreamNotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Infrastructure faults are logged server-side and returned with a
        // generic detail; everything else carries its diagnostic.
        let detail = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {self}");
            match &self {
                ApiError::Core(CoreErr::KernelStartFailed(_)) => self.to_string(),
                _ => "internal server error".to_string(),
            }
        } else {
            self.to_string()
        };
        (status, Json(ErrorBody { detail })).into_response()
    }
}
