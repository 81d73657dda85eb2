//! # Test Support
//!
//! In-memory worker launcher for exercising the pool and dispatcher without
//! real subprocesses. Instances echo the request they received (app name,
//! path, method, headers) as JSON so tests can assert on exactly what a
//! worker would have seen.

use crate::config::WorkerConfig;
use crate::pool::handle::{WorkerInstance, WorkerLauncher, WorkerRequest, WorkerResponse};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, StatusCode};
use buntime_core::error::{AppError, ErrorKind};
use dashmap::DashMap;
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-app behavior overrides.
#[derive(Debug, Clone, Default)]
pub struct MemoryAppSpec {
    /// Fixed status; default 200
    pub status: Option<u16>,
    /// Fixed body instead of the JSON echo
    pub body: Option<String>,
    /// Artificial handling latency
    pub delay: Duration,
    pub multiplexing: bool,
}

#[derive(Default)]
struct AppState {
    spec: MemoryAppSpec,
    launches: AtomicU32,
    failures_remaining: AtomicU32,
    terminations: AtomicU32,
}

/// Launcher whose workers live in memory.
#[derive(Default)]
pub struct MemoryLauncher {
    apps: DashMap<String, Arc<AppState>>,
}

impl MemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, app: &str) -> Arc<AppState> {
        self.apps
            .entry(app.to_string())
            .or_insert_with(|| Arc::new(AppState::default()))
            .clone()
    }

    pub fn set_spec(&self, app: &str, spec: MemoryAppSpec) {
        let state = self.state(app);
        // replace the stored state wholesale so counters keep going
        self.apps.insert(
            app.to_string(),
            Arc::new(AppState {
                spec,
                launches: AtomicU32::new(state.launches.load(Ordering::Relaxed)),
                failures_remaining: AtomicU32::new(
                    state.failures_remaining.load(Ordering::Relaxed),
                ),
                terminations: AtomicU32::new(state.terminations.load(Ordering::Relaxed)),
            }),
        );
    }

    pub fn set_delay(&self, app: &str, delay: Duration) {
        let mut spec = self.spec_for(app);
        spec.delay = delay;
        self.set_spec(app, spec);
    }

    pub fn set_response(&self, app: &str, status: u16, body: &str) {
        let mut spec = self.spec_for(app);
        spec.status = Some(status);
        spec.body = Some(body.to_string());
        self.set_spec(app, spec);
    }

    fn spec_for(&self, app: &str) -> MemoryAppSpec {
        self.state(app).spec.clone()
    }

    /// Make the next `count` launches for `app` fail.
    pub fn fail_launches(&self, app: &str, count: u32) {
        self.state(app)
            .failures_remaining
            .store(count, Ordering::Relaxed);
    }

    pub fn launches(&self, app: &str) -> u32 {
        self.state(app).launches.load(Ordering::Relaxed)
    }

    pub fn terminated(&self, app: &str) -> u32 {
        self.state(app).terminations.load(Ordering::Relaxed)
    }
}

fn app_name(app_dir: &Path) -> String {
    app_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| app_dir.display().to_string())
}

#[async_trait]
impl WorkerLauncher for MemoryLauncher {
    async fn launch(
        &self,
        app_dir: &Path,
        _config: &WorkerConfig,
    ) -> Result<Box<dyn WorkerInstance>, AppError> {
        let name = app_name(app_dir);
        let state = self.state(&name);

        let remaining = state.failures_remaining.load(Ordering::Relaxed);
        if remaining > 0 {
            state
                .failures_remaining
                .store(remaining - 1, Ordering::Relaxed);
            return Err(AppError::new(
                ErrorKind::WorkerSpawnFailed,
                format!("injected spawn failure for {name}"),
            ));
        }

        state.launches.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryInstance { name, state }))
    }
}

struct MemoryInstance {
    name: String,
    state: Arc<AppState>,
}

#[async_trait]
impl WorkerInstance for MemoryInstance {
    async fn forward(&self, req: WorkerRequest) -> Result<WorkerResponse, AppError> {
        let spec = self.state.spec.clone();
        if !spec.delay.is_zero() {
            tokio::time::sleep(spec.delay).await;
        }

        let status = StatusCode::from_u16(spec.status.unwrap_or(200))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = match spec.body {
            Some(fixed) => Bytes::from(fixed),
            None => {
                let headers: serde_json::Map<String, serde_json::Value> = req
                    .headers
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.as_str().to_ascii_lowercase(),
                            json!(String::from_utf8_lossy(value.as_bytes())),
                        )
                    })
                    .collect();
                Bytes::from(
                    json!({
                        "app": self.name,
                        "method": req.method.as_str(),
                        "path": req.path_and_query,
                        "headers": headers,
                    })
                    .to_string(),
                )
            }
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_TYPE,
            "application/json".parse().expect("static header"),
        );
        headers.insert(
            "x-worker-app",
            self.name.parse().unwrap_or_else(|_| {
                axum::http::HeaderValue::from_static("unknown")
            }),
        );

        Ok(WorkerResponse {
            status,
            headers,
            body,
        })
    }

    async fn terminate(&self) {
        self.state.terminations.fetch_add(1, Ordering::Relaxed);
    }

    fn multiplexing(&self) -> bool {
        self.state.spec.multiplexing
    }
}
