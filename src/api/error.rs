use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::queue::QueueError;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    /// Backing storage is unreachable. Worth polling again later
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] QueueError),
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self::Unavailable(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
