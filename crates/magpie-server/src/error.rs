use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use magpie_store::StoreError;

/// API failure modes, rendered as the `{success:false, error:{code,...}}`
/// envelope.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("missing or invalid identity")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn code(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::Validation(_) => ("VALIDATION_ERROR", StatusCode::BAD_REQUEST),
            ApiError::Unauthorized => ("UNAUTHORIZED", StatusCode::UNAUTHORIZED),
            ApiError::Forbidden => ("FORBIDDEN", StatusCode::FORBIDDEN),
            ApiError::NotFound(_) => ("NOT_FOUND", StatusCode::NOT_FOUND),
            ApiError::Conflict(_) => ("CONFLICT", StatusCode::CONFLICT),
            ApiError::RateLimited => ("RATE_LIMIT", StatusCode::TOO_MANY_REQUESTS),
            ApiError::Internal(_) => ("INTERNAL", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::IllegalTransition { from, to } => ApiError::Conflict(format!(
                "cannot move session from {} to {}",
                from.as_str(),
                to.as_str()
            )),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code();
        let message = match &self {
            // internal details stay in the logs
            ApiError::Internal(err) => {
                tracing::error!("internal error: {err:#}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({
            "success": false,
            "error": {"code": code, "message": message},
        }));
        (status, body).into_response()
    }
}
