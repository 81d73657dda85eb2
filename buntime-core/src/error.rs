//! # Error Model
//!
//! Shared error carrier for the Buntime runtime and its plugins.
//!
//! Every failure that can surface to a client is expressed as an [`AppError`]:
//! a tagged [`ErrorKind`], an opaque uppercase code, a human-readable message
//! and optional structured data. The gateway owns the single place where an
//! `AppError` becomes an HTTP response envelope; nothing else in the codebase
//! formats error bodies.
//!
//! ## Error Categories
//!
//! - **NotFound / Validation / Forbidden / AuthRequired**: admission-level
//!   failures returned directly to the client.
//! - **RateLimited / BodyTooLarge**: resource guards.
//! - **DeadlineExceeded / WorkerSpawnFailed / WorkerReplaced**: worker pool
//!   failures surfaced after the pool's own retry policy ran its course.
//! - **Internal / ServiceUnavailable**: everything else.

use serde_json::Value;
use thiserror::Error;

/// Classification of a runtime failure.
///
/// Kinds are deliberately coarse: plugins and the pool attach detail through
/// the message and `data` payload, not by growing this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No route, app or resource matched the request
    NotFound,
    /// Request shape or configuration input failed validation
    Validation,
    /// An authorization policy denied the request
    Forbidden,
    /// Authentication is required and was not supplied
    AuthRequired,
    /// Admission control rejected the request
    RateLimited,
    /// Request body exceeded the effective size limit
    BodyTooLarge,
    /// The per-request deadline elapsed before the worker responded
    DeadlineExceeded,
    /// Worker could not be spawned after retry
    WorkerSpawnFailed,
    /// The worker serving this request was preempted by pool pressure
    WorkerReplaced,
    /// Temporarily unable to serve (shutdown drain, overload)
    ServiceUnavailable,
    /// Unclassified internal failure
    Internal,
}

impl ErrorKind {
    /// Default opaque code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::AuthRequired => "AUTH_REQUIRED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::BodyTooLarge => "BODY_TOO_LARGE",
            ErrorKind::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorKind::WorkerSpawnFailed => "WORKER_SPAWN_FAILED",
            ErrorKind::WorkerReplaced => "WORKER_REPLACED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status the gateway renders for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::Validation => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::AuthRequired => 401,
            ErrorKind::RateLimited => 429,
            ErrorKind::BodyTooLarge => 413,
            ErrorKind::DeadlineExceeded => 504,
            ErrorKind::WorkerSpawnFailed => 502,
            ErrorKind::WorkerReplaced => 502,
            ErrorKind::ServiceUnavailable => 503,
            ErrorKind::Internal => 500,
        }
    }
}

/// Common error carrier: kind, code, message, optional data.
#[derive(Error, Debug, Clone)]
#[error("{code}: {message}")]
pub struct AppError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Opaque uppercase identifier; defaults to the kind's code
    pub code: String,
    /// Human-readable description
    pub message: String,
    /// Optional structured payload rendered into the response envelope
    pub data: Option<Value>,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code().to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// Override the default code while keeping the kind's status mapping.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}
