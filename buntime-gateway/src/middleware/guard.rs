//! # Entry Guards
//!
//! Two layers applied ahead of the dispatcher:
//!
//! - **Request id**: every request carries an `x-request-id` (the client's,
//!   or a fresh UUID) and every response echoes it.
//! - **CSRF + body size**: state-changing methods must arrive on trusted
//!   transport (`X-Buntime-Internal`) or carry an `Origin` that parses as a
//!   credential-free http(s) URL whose authority (host and port) equals the
//!   `Host` header. A
//!   `Content-Length` past the global maximum is rejected before any body
//!   byte is read; bodies without a length are counted (and capped) when the
//!   dispatcher buffers them.

use crate::headers::{X_BUNTIME_INTERNAL, X_REQUEST_ID};
use crate::runtime_error::RuntimeError;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use buntime_core::error::ErrorKind;
use uuid::Uuid;

/// State for the entry guard layer.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Absolute body cap; per-app limits are enforced later by the pool
    pub max_body_size: u64,
}

/// Stamp `x-request-id` onto the request and echo it on the response.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response {
    let id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(X_REQUEST_ID, value.clone());
        let mut response = next.run(req).await;
        response.headers_mut().insert(X_REQUEST_ID, value);
        response
    } else {
        next.run(req).await
    }
}

/// CSRF and global body-size admission checks.
pub async fn guard_middleware(
    State(config): State<GuardConfig>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
    {
        if length > config.max_body_size {
            return RuntimeError::new(
                ErrorKind::BodyTooLarge,
                format!(
                    "request body of {length} bytes exceeds the {} byte limit",
                    config.max_body_size
                ),
            )
            .into_response();
        }
    }

    if state_changing(req.method()) && !csrf_allowed(&req) {
        return RuntimeError::forbidden("cross-origin request rejected").into_response();
    }

    next.run(req).await
}

fn state_changing(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

fn csrf_allowed(req: &Request<Body>) -> bool {
    if req.headers().contains_key(X_BUNTIME_INTERNAL) {
        return true;
    }
    let Some(origin) = req.headers().get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    let Some(origin_host) = parse_origin_host(origin) else {
        return false;
    };
    let Some(host) = req.headers().get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    // the full authority must match: a different port is a different origin
    origin_host.eq_ignore_ascii_case(host.trim())
}

/// Extract the host from an `Origin` value, accepting only http(s) URLs
/// without embedded credentials.
fn parse_origin_host(origin: &str) -> Option<String> {
    let rest = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))?;
    // authority ends at the first path separator
    let authority = rest.split(['/', '?', '#']).next()?;
    if authority.is_empty() || authority.contains('@') {
        return None;
    }
    Some(authority.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;
    use tower::util::ServiceExt;

    fn app() -> Router {
        let config = GuardConfig {
            max_body_size: 10 * 1024 * 1024,
        };
        Router::new()
            .route("/{*path}", any(|| async { "forwarded" }))
            .layer(axum::middleware::from_fn_with_state(config, guard_middleware))
            .layer(axum::middleware::from_fn(request_id_middleware))
    }

    async fn send(req: Request<Body>) -> Response {
        app().oneshot(req).await.unwrap()
    }

    fn post(host: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri("/submit")
            .header(header::HOST, host)
    }

    #[tokio::test]
    async fn post_without_origin_is_rejected() {
        let response = send(post("localhost").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn post_with_matching_origin_is_forwarded() {
        let response = send(
            post("localhost")
                .header(header::ORIGIN, "http://localhost")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn put_with_foreign_origin_is_rejected() {
        let response = send(
            Request::builder()
                .method("PUT")
                .uri("/submit")
                .header(header::HOST, "localhost")
                .header(header::ORIGIN, "http://evil.com")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn non_http_origin_is_rejected() {
        let response = send(
            post("localhost")
                .header(header::ORIGIN, "file://localhost")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn origin_with_credentials_is_rejected() {
        let response = send(
            post("localhost")
                .header(header::ORIGIN, "http://user:pw@localhost")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn internal_header_bypasses_csrf() {
        let response = send(
            post("localhost")
                .header(X_BUNTIME_INTERNAL, "true")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn get_without_origin_is_forwarded() {
        let response = send(
            Request::builder()
                .uri("/anything")
                .header(header::HOST, "localhost")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn matching_port_is_same_origin() {
        let response = send(
            post("example.com:3000")
                .header(header::ORIGIN, "http://example.com:3000")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 200);
    }

    #[tokio::test]
    async fn mismatched_port_is_cross_origin() {
        let response = send(
            post("example.com:3000")
                .header(header::ORIGIN, "http://example.com:4999")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 403);
    }

    #[tokio::test]
    async fn oversized_content_length_is_rejected_up_front() {
        let response = send(
            post("localhost")
                .header(X_BUNTIME_INTERNAL, "true")
                .header(header::CONTENT_LENGTH, "1073741824")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), 413);
    }

    #[tokio::test]
    async fn request_id_is_generated_and_echoed() {
        let response = send(
            Request::builder()
                .uri("/x")
                .header(header::HOST, "localhost")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert!(response.headers().contains_key(X_REQUEST_ID));
    }

    #[tokio::test]
    async fn client_request_id_is_preserved() {
        let response = send(
            Request::builder()
                .uri("/x")
                .header(header::HOST, "localhost")
                .header(X_REQUEST_ID, "client-supplied-id")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(
            response.headers().get(X_REQUEST_ID).unwrap(),
            "client-supplied-id"
        );
    }
}
