//! # Runtime Error Rendering
//!
//! The single place an [`AppError`] becomes an HTTP response. Every error
//! body in the system has the shape:
//!
//! ```json
//! { "success": false, "code": "NOT_FOUND", "message": "...", "data": {...} }
//! ```
//!
//! with `data` omitted when absent. Status codes come from the error kind;
//! codes are opaque uppercase identifiers clients can switch on.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use buntime_core::error::{AppError, ErrorKind};
use serde_json::json;

/// Newtype so the gateway can implement axum's `IntoResponse` for the shared
/// carrier.
#[derive(Debug, Clone)]
pub struct RuntimeError(pub AppError);

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self(AppError::new(kind, message))
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self(AppError::not_found(message))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self(AppError::forbidden(message))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self(AppError::validation(message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self(AppError::internal(message))
    }
}

impl From<AppError> for RuntimeError {
    fn from(err: AppError) -> Self {
        Self(err)
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for RuntimeError {}

impl IntoResponse for RuntimeError {
    fn into_response(self) -> Response {
        error_response(&self.0)
    }
}

/// Render the error envelope. Also used by the dispatcher when it holds an
/// `AppError` by reference.
pub fn error_response(err: &AppError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "success": false,
        "code": err.code,
        "message": err.message,
    });
    if let Some(data) = &err.data {
        body["data"] = data.clone();
    }
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn envelope_shape() {
        let response = RuntimeError::not_found("no such app").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["code"], "NOT_FOUND");
        assert_eq!(body["message"], "no such app");
        assert!(body.get("data").is_none());
    }

    #[tokio::test]
    async fn data_payload_is_included() {
        let err = AppError::new(ErrorKind::RateLimited, "slow down")
            .with_data(json!({"retryAfter": 12}));
        let response = RuntimeError(err).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["data"]["retryAfter"], 12);
    }
}
