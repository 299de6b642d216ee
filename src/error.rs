//! 统一的 API 错误类型与转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use tracing::error;

use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Forbidden(String),
    NotFound(String),
    PayloadTooLarge(u64),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::PayloadTooLarge(limit) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("upload exceeds the {limit} byte limit"),
            )
                .into_response(),
            ApiError::Internal(detail) => {
                error!(detail, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidName => ApiError::BadRequest("invalid file name".into()),
            StorageError::PathTraversal(_) => ApiError::Forbidden("access denied".into()),
            StorageError::NotFound(_) => ApiError::NotFound("file not found".into()),
            StorageError::CollisionExhausted(name) => {
                ApiError::Internal(format!("no free file name for {name}"))
            }
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("file not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
