//! # Main Dispatcher
//!
//! The per-request state machine behind the gateway's fallback handler.
//! Ordering is normative:
//!
//! 1. entry guards (middleware: CSRF, body size, request id)
//! 2. virtual-host match — straight to the worker pool, only `on_response`
//!    hooks afterwards
//! 3. shell pre-emption for top-level navigations on claimed paths
//! 4. plugin `server_fetch` chain (per-plugin public routes decide whether
//!    the `on_request` chain runs first)
//! 5. global `on_request` chain, if step 4 did not already run it
//! 6. plugin routes, longest base first; 404 falls through
//! 7. plugin-served apps via the pool
//! 8. regular worker apps via the pool
//! 9. shell-rendered 404 fallback
//! 10. `on_response` chain (forward topological order)
//!
//! Hooks receive the request by value and hand back a modified one;
//! modifications are cumulative along the chain. A hook failure is isolated
//! to its request: logged with the request id, rendered as a 500, the next
//! request is unaffected.

use crate::config::{resolve_app_dir, Visibility, WorkerConfig};
use crate::headers::{
    X_BASE, X_BUNTIME_INTERNAL, X_FRAGMENT_ROUTE, X_IDENTITY, X_NOT_FOUND, X_REQUEST_ID,
    X_VHOST_TENANT,
};
use crate::metrics;
use crate::plugins::{base_owns_path, strip_base, HookOutcome};
use crate::pool::{WorkerRequest, WorkerResponse};
use crate::runtime_error::RuntimeError;
use crate::server::Runtime;
use crate::vhost::VirtualHostMatch;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use buntime_core::error::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tower::util::ServiceExt;

/// Buffered request threaded through the pipeline. Holding the body as
/// bytes lets a step that declines a request (plugin route 404, server
/// fetch pass) hand it to the next step intact.
struct PipelineRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl PipelineRequest {
    async fn buffer(req: Request<Body>, cap: u64) -> Result<Self, RuntimeError> {
        let (parts, body) = req.into_parts();
        let cap_usize = usize::try_from(cap).unwrap_or(usize::MAX);
        let body = axum::body::to_bytes(body, cap_usize).await.map_err(|_| {
            RuntimeError::new(
                ErrorKind::BodyTooLarge,
                format!("request body exceeds the {cap} byte limit"),
            )
        })?;
        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
        })
    }

    fn path(&self) -> &str {
        self.uri.path()
    }

    fn request_id(&self) -> &str {
        self.headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
    }

    fn to_request(&self) -> Request<Body> {
        self.request_with_uri(self.uri.clone())
    }

    fn into_request(self) -> Request<Body> {
        let mut req = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .body(Body::from(self.body))
            .expect("request rebuild");
        *req.headers_mut() = self.headers;
        req
    }

    fn request_with_uri(&self, uri: Uri) -> Request<Body> {
        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(Body::from(self.body.clone()))
            .expect("request rebuild");
        *req.headers_mut() = self.headers.clone();
        req
    }

    /// Path rewritten for the target, original query preserved.
    fn rewritten(&self, path: &str) -> String {
        match self.uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }

    fn worker_request(&self, path_and_query: String) -> WorkerRequest {
        WorkerRequest {
            method: self.method.clone(),
            path_and_query,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

enum Chain {
    Continue(PipelineRequest),
    Respond(Response),
}

/// The single composed handler the router falls back to.
pub async fn dispatch(State(runtime): State<Arc<Runtime>>, req: Request<Body>) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let metrics_path = req.uri().path().to_string();

    let response = dispatch_inner(&runtime, req).await;

    metrics::record_request(
        method.as_str(),
        &metrics_path,
        response.status().as_u16(),
        started.elapsed(),
    )
    .await;
    response
}

async fn dispatch_inner(rt: &Runtime, req: Request<Body>) -> Response {
    let mut preq = match PipelineRequest::buffer(req, rt.config.body_size.max).await {
        Ok(preq) => preq,
        Err(err) => return err.into_response(),
    };

    // 2. virtual hosts bypass the plugin pipeline entirely
    if let Some(vhost) = host_match(rt, &preq) {
        let response = vhost_dispatch(rt, &preq, vhost).await;
        return run_on_response_chain(rt, response).await;
    }

    // 3. top-level navigations onto claimed paths go to the shell
    if let Some((shell_base, shell_dir)) = rt.shell_target() {
        if is_navigation(&preq.headers) && path_claimed(rt, preq.path(), &shell_base) {
            match run_on_request_chain(rt, preq).await {
                Chain::Respond(response) => return run_on_response_chain(rt, response).await,
                Chain::Continue(preq) => {
                    let fragment = preq.path().to_string();
                    let response = dispatch_worker(
                        rt,
                        &shell_dir,
                        &preq,
                        "/",
                        Some(shell_base.as_str()),
                        &[(X_FRAGMENT_ROUTE, fragment)],
                    )
                    .await;
                    return run_on_response_chain(rt, response).await;
                }
            }
        }
    }

    // 4. server_fetch chain; a plugin's non-public paths pull the
    // on_request chain forward
    let mut on_request_ran = false;
    for entry in rt.registry.server_fetch_plugins() {
        let public = entry
            .descriptor
            .public_routes
            .is_public(preq.path(), preq.method.as_str());
        if !public && !on_request_ran {
            match run_on_request_chain(rt, preq).await {
                Chain::Respond(response) => return run_on_response_chain(rt, response).await,
                Chain::Continue(next) => {
                    preq = next;
                    on_request_ran = true;
                }
            }
        }
        let probe = preq.to_request();
        match entry.plugin.server_fetch(&probe).await {
            Ok(Some(response)) if response.status() != StatusCode::NOT_FOUND => {
                return run_on_response_chain(rt, response).await;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(
                    plugin = %entry.descriptor.name,
                    request_id = preq.request_id(),
                    "server_fetch failed: {err}"
                );
                let response = RuntimeError::internal("plugin failure").into_response();
                return run_on_response_chain(rt, response).await;
            }
        }
    }

    // 5. global on_request chain
    if !on_request_ran {
        match run_on_request_chain(rt, preq).await {
            Chain::Respond(response) => return run_on_response_chain(rt, response).await,
            Chain::Continue(next) => preq = next,
        }
    }

    // 6. plugin routes, longest base first; 404 falls through
    if let Some(entry) = rt.registry.route_owner(preq.path()) {
        let base = entry.descriptor.base.as_deref().unwrap_or("/");
        let relative = preq.rewritten(&strip_base(base, preq.path()));
        let uri: Uri = relative.parse().unwrap_or_else(|_| Uri::from_static("/"));
        let router = entry.router.clone().expect("route owner has a router");
        let response = router
            .oneshot(preq.request_with_uri(uri))
            .await
            .unwrap_or_else(|_| RuntimeError::internal("plugin route failure").into_response());
        if response.status() != StatusCode::NOT_FOUND {
            return run_on_response_chain(rt, response).await;
        }
    }

    // 7. plugin-served apps
    if let Some(app) = rt.registry.resolve_plugin_app(preq.path()) {
        let base = app.base.to_string();
        let dir = app.dir.clone();
        let relative = strip_base(&base, preq.path());
        let response = dispatch_worker(rt, &dir, &preq, &relative, Some(base.as_str()), &[]).await;
        let response = shell_404_fallback(rt, &preq, response).await;
        return run_on_response_chain(rt, response).await;
    }

    // 8. regular worker apps by first path segment
    let response = worker_app_dispatch(rt, &preq).await;
    let response = shell_404_fallback(rt, &preq, response).await;
    run_on_response_chain(rt, response).await
}

fn host_match(rt: &Runtime, preq: &PipelineRequest) -> Option<VirtualHostMatch> {
    let host = preq.headers.get(header::HOST)?.to_str().ok()?;
    let matched = rt.vhosts.matches(host)?;
    if let Some(prefix) = &matched.path_prefix {
        if !preq.path().starts_with(prefix.as_str()) {
            return None;
        }
    }
    Some(matched)
}

async fn vhost_dispatch(rt: &Runtime, preq: &PipelineRequest, vhost: VirtualHostMatch) -> Response {
    let Some(dir) = resolve_app_dir(&rt.config.worker_dirs, &vhost.app) else {
        return RuntimeError::not_found(format!("unknown app {:?}", vhost.app)).into_response();
    };
    let mut extra = Vec::new();
    if let Some(tenant) = &vhost.tenant {
        extra.push((X_VHOST_TENANT, tenant.clone()));
    }
    dispatch_worker(rt, &dir, preq, preq.path(), Some("/"), &extra).await
}

fn is_navigation(headers: &HeaderMap) -> bool {
    headers
        .get("sec-fetch-mode")
        .and_then(|v| v.to_str().ok())
        .map(|mode| mode.eq_ignore_ascii_case("navigate"))
        .unwrap_or(false)
}

fn path_claimed(rt: &Runtime, path: &str, shell_base: &str) -> bool {
    if base_owns_path(shell_base, path) {
        return true;
    }
    rt.registry.ordered().iter().any(|entry| {
        entry
            .descriptor
            .base
            .as_deref()
            .map(|base| base_owns_path(base, path))
            .unwrap_or(false)
    })
}

async fn run_on_request_chain(rt: &Runtime, preq: PipelineRequest) -> Chain {
    let cap = rt.config.body_size.max;
    let request_id = preq.request_id().to_string();
    let mut req = preq.into_request();
    for entry in rt.registry.on_request_hooks() {
        match entry.plugin.on_request(req).await {
            Ok(HookOutcome::Continue(next)) => req = next,
            Ok(HookOutcome::Respond(response)) => return Chain::Respond(response),
            Err(err) => {
                tracing::error!(
                    plugin = %entry.descriptor.name,
                    request_id = %request_id,
                    "on_request hook failed: {err}"
                );
                return Chain::Respond(RuntimeError::internal("plugin failure").into_response());
            }
        }
    }
    // the body is a single buffered chunk, so re-buffering is free unless a
    // hook swapped it out
    match PipelineRequest::buffer(req, cap).await {
        Ok(preq) => Chain::Continue(preq),
        Err(err) => Chain::Respond(err.into_response()),
    }
}

async fn run_on_response_chain(rt: &Runtime, mut response: Response) -> Response {
    for entry in rt.registry.on_response_hooks() {
        match entry.plugin.on_response(response).await {
            Ok(next) => response = next,
            Err(err) => {
                tracing::error!(
                    plugin = %entry.descriptor.name,
                    "on_response hook failed: {err}"
                );
                return RuntimeError::internal("plugin failure").into_response();
            }
        }
    }
    response
}

async fn worker_app_dispatch(rt: &Runtime, preq: &PipelineRequest) -> Response {
    let trimmed = preq.path().trim_start_matches('/');
    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, rest),
        None => (trimmed, ""),
    };

    let (app_name, relative) = if first.is_empty() {
        match &rt.config.homepage_app {
            Some(app) => (app.as_str(), "/".to_string()),
            None => {
                return RuntimeError::not_found("no route matched the request").into_response()
            }
        }
    } else {
        (first, format!("/{rest}"))
    };

    let Some(dir) = resolve_app_dir(&rt.config.worker_dirs, app_name) else {
        return RuntimeError::not_found(format!("unknown app {app_name:?}")).into_response();
    };

    let base = format!("/{app_name}");
    dispatch_worker(rt, &dir, preq, &relative, Some(base.as_str()), &[]).await
}

async fn dispatch_worker(
    rt: &Runtime,
    app_dir: &Path,
    preq: &PipelineRequest,
    path: &str,
    base: Option<&str>,
    extra: &[(&'static str, String)],
) -> Response {
    let config = match WorkerConfig::load(app_dir, &rt.config.body_size, &rt.config.caps) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(app = %app_dir.display(), "worker manifest rejected: {err}");
            return RuntimeError::internal("worker configuration invalid").into_response();
        }
    };

    match config.visibility {
        Visibility::Internal if !preq.headers.contains_key(X_BUNTIME_INTERNAL) => {
            // internal apps are indistinguishable from absent ones
            return RuntimeError::not_found("no route matched the request").into_response();
        }
        Visibility::Protected
            if !preq.headers.contains_key(X_IDENTITY)
                && !config.public_routes.is_public(path, preq.method.as_str()) =>
        {
            return RuntimeError::new(ErrorKind::AuthRequired, "authentication required")
                .into_response();
        }
        _ => {}
    }

    let mut wreq = preq.worker_request(preq.rewritten(path));
    if config.inject_base {
        if let Some(base) = base {
            if let Ok(value) = HeaderValue::from_str(base) {
                wreq.headers.insert(X_BASE, value);
            }
        }
    }
    for (name, value) in extra {
        if let Ok(value) = HeaderValue::from_str(value) {
            wreq.headers.insert(*name, value);
        }
    }

    match rt.pool.dispatch(app_dir, &config, wreq).await {
        Ok(response) => worker_response(response),
        Err(err) => {
            tracing::warn!(
                app = %app_dir.display(),
                request_id = preq.request_id(),
                code = %err.code,
                "worker dispatch failed: {err}"
            );
            RuntimeError(err).into_response()
        }
    }
}

/// Step 9: a 404 re-dispatches to the shell so it can render its own
/// not-found page inside the chrome.
async fn shell_404_fallback(rt: &Runtime, preq: &PipelineRequest, response: Response) -> Response {
    if response.status() != StatusCode::NOT_FOUND {
        return response;
    }
    let Some((shell_base, shell_dir)) = rt.shell_target() else {
        return response;
    };
    let shell_response = dispatch_worker(
        rt,
        &shell_dir,
        preq,
        "/",
        Some(shell_base.as_str()),
        &[(X_NOT_FOUND, "true".to_string())],
    )
    .await;
    if shell_response.status().is_server_error() {
        // broken shell must not mask the original outcome
        return response;
    }
    shell_response
}

fn worker_response(wresp: WorkerResponse) -> Response {
    let mut response = Response::builder()
        .status(wresp.status)
        .body(Body::from(wresp.body))
        .expect("worker response rebuild");
    *response.headers_mut() = wresp.headers;
    response
}
