//! # Metrics Plugin
//!
//! Counts requests and response classes as they pass through the hook
//! chain and exposes a JSON snapshot under the plugin base: its own
//! counters, the worker pool's, and the process-wide request aggregate
//! (latency percentiles, error rate) from [`crate::metrics`].

use crate::config::PluginManifest;
use crate::plugins::{HookOutcome, HookSet, Plugin, PluginDescriptor};
use crate::pool::WorkerPool;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::routing::get;
use axum::{extract::State, Json, Router};
use buntime_core::error::AppError;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct HttpCounters {
    requests: AtomicU64,
    responses_2xx: AtomicU64,
    responses_3xx: AtomicU64,
    responses_4xx: AtomicU64,
    responses_5xx: AtomicU64,
}

struct Shared {
    pool: Arc<WorkerPool>,
    http: HttpCounters,
    started: Instant,
}

pub struct MetricsPlugin {
    manifest: PluginManifest,
    shared: Arc<Shared>,
}

impl MetricsPlugin {
    pub fn from_manifest(manifest: &PluginManifest, pool: Arc<WorkerPool>) -> anyhow::Result<Self> {
        Ok(Self {
            manifest: manifest.clone(),
            shared: Arc::new(Shared {
                pool,
                http: HttpCounters::default(),
                started: Instant::now(),
            }),
        })
    }
}

#[async_trait]
impl Plugin for MetricsPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = PluginDescriptor::named("metrics");
        descriptor.base = Some(
            self.manifest
                .base
                .clone()
                .unwrap_or_else(|| "/metrics".to_string()),
        );
        descriptor.public_routes = self
            .manifest
            .compiled_public_routes()
            .unwrap_or_default();
        descriptor.hooks = HookSet {
            on_request: true,
            on_response: true,
            server_fetch: false,
        };
        descriptor
    }

    async fn on_request(&self, req: Request<Body>) -> Result<HookOutcome, AppError> {
        self.shared.http.requests.fetch_add(1, Ordering::Relaxed);
        Ok(HookOutcome::Continue(req))
    }

    async fn on_response(&self, resp: Response) -> Result<Response, AppError> {
        let counter = match resp.status().as_u16() {
            200..=299 => &self.shared.http.responses_2xx,
            300..=399 => &self.shared.http.responses_3xx,
            400..=499 => &self.shared.http.responses_4xx,
            _ => &self.shared.http.responses_5xx,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(resp)
    }

    fn routes(&self) -> Option<Router> {
        Some(
            Router::new()
                .route("/api/snapshot", get(snapshot))
                .with_state(self.shared.clone()),
        )
    }
}

async fn snapshot(State(shared): State<Arc<Shared>>) -> Json<serde_json::Value> {
    let aggregate = crate::metrics::aggregated().await;
    Json(json!({
        "pool": shared.pool.metrics(),
        "http": {
            "requests": shared.http.requests.load(Ordering::Relaxed),
            "responses": {
                "2xx": shared.http.responses_2xx.load(Ordering::Relaxed),
                "3xx": shared.http.responses_3xx.load(Ordering::Relaxed),
                "4xx": shared.http.responses_4xx.load(Ordering::Relaxed),
                "5xx": shared.http.responses_5xx.load(Ordering::Relaxed),
            },
        },
        "aggregate": aggregate,
        "uptimeSeconds": shared.started.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BodySizeConfig;
    use crate::testing::MemoryLauncher;
    use axum::http::StatusCode;
    use tower::util::ServiceExt;

    fn plugin() -> MetricsPlugin {
        let pool = Arc::new(WorkerPool::new(
            2,
            BodySizeConfig {
                default: 1024,
                max: 4096,
            },
            Arc::new(MemoryLauncher::new()),
        ));
        let manifest = PluginManifest {
            name: "metrics".to_string(),
            base: Some("/metrics".to_string()),
            enabled: true,
            dependencies: vec![],
            optional_dependencies: vec![],
            public_routes: None,
            dir: Default::default(),
            config: Default::default(),
        };
        MetricsPlugin::from_manifest(&manifest, pool).unwrap()
    }

    #[tokio::test]
    async fn counts_requests_and_response_classes() {
        let plugin = plugin();
        let req = Request::builder().uri("/x").body(Body::empty()).unwrap();
        plugin.on_request(req).await.unwrap();
        plugin
            .on_response(Response::builder().status(200).body(Body::empty()).unwrap())
            .await
            .unwrap();
        plugin
            .on_response(Response::builder().status(404).body(Body::empty()).unwrap())
            .await
            .unwrap();

        let router = plugin.routes().unwrap();
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/api/snapshot")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["http"]["requests"], 1);
        assert_eq!(body["http"]["responses"]["2xx"], 1);
        assert_eq!(body["http"]["responses"]["4xx"], 1);
        assert_eq!(body["pool"]["requestCount"], 0);
        // the process-wide aggregate is shared across tests, so only its
        // shape is stable here
        assert!(body["aggregate"]["totalRequests"].is_number());
        assert!(body["aggregate"]["errorRate"].is_number());
    }
}
