//! # Worker Handles and Launchers
//!
//! A [`WorkerHandle`] is the pool's view of one live worker: identity,
//! lifecycle timers, request accounting and the serialization gate. The
//! actual worker sits behind the [`WorkerLauncher`] / [`WorkerInstance`]
//! trait seam so the pool never cares whether it is talking to a subprocess
//! over loopback HTTP or an in-memory double in tests.
//!
//! The production [`ProcessLauncher`] starts the app's entrypoint as a
//! subprocess bound to an ephemeral loopback port, probes it until it
//! answers, and forwards requests with `reqwest`.

use crate::config::WorkerConfig;
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use buntime_core::error::{AppError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Buffered request on its way into a worker.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: Method,
    /// Path plus query string, already rewritten for the worker
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Buffered response on its way out of a worker.
#[derive(Debug, Clone)]
pub struct WorkerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A live worker the pool can forward requests to.
#[async_trait]
pub trait WorkerInstance: Send + Sync {
    async fn forward(&self, req: WorkerRequest) -> Result<WorkerResponse, AppError>;

    /// Stop the worker. Idempotent; called on eviction, expiry and shutdown.
    async fn terminate(&self);

    /// Whether the worker accepts concurrent inbound requests. Handles for
    /// non-multiplexing instances serialize through the handle gate.
    fn multiplexing(&self) -> bool {
        false
    }
}

/// Spawns workers and waits for them to become ready.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Box<dyn WorkerInstance>, AppError>;
}

/// Lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Starting,
    Idle,
    Active,
    Terminated,
}

/// One pooled worker.
pub struct WorkerHandle {
    pub id: Uuid,
    pub app_dir: PathBuf,
    pub fingerprint: String,
    pub config: WorkerConfig,
    pub created: Instant,
    /// Absolute expiry when the config carries a ttl
    pub expires_at: Option<Instant>,
    instance: Box<dyn WorkerInstance>,
    status: Mutex<HandleStatus>,
    last_used: Mutex<Instant>,
    request_count: AtomicU32,
    /// Serializes requests for non-multiplexing instances
    gate: tokio::sync::Mutex<()>,
    preempt_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("app_dir", &self.app_dir)
            .field("status", &self.status())
            .field("request_count", &self.request_count())
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(
        app_dir: PathBuf,
        fingerprint: String,
        config: WorkerConfig,
        instance: Box<dyn WorkerInstance>,
    ) -> Self {
        let now = Instant::now();
        let expires_at = if config.ttl_ms > 0 {
            Some(now + Duration::from_millis(config.ttl_ms))
        } else {
            None
        };
        let (preempt_tx, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            app_dir,
            fingerprint,
            config,
            created: now,
            expires_at,
            instance,
            status: Mutex::new(HandleStatus::Idle),
            last_used: Mutex::new(now),
            request_count: AtomicU32::new(0),
            gate: tokio::sync::Mutex::new(()),
            preempt_tx,
        }
    }

    pub fn status(&self) -> HandleStatus {
        *self.status.lock().expect("handle status poisoned")
    }

    pub fn set_status(&self, status: HandleStatus) {
        *self.status.lock().expect("handle status poisoned") = status;
    }

    pub fn request_count(&self) -> u32 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn record_request(&self) -> u32 {
        self.request_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock().expect("handle last_used poisoned")
    }

    pub fn touch(&self) {
        *self.last_used.lock().expect("handle last_used poisoned") = Instant::now();
    }

    pub fn ttl_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_used())
            >= Duration::from_millis(self.config.idle_timeout_ms)
    }

    /// Has the per-worker request budget been spent?
    pub fn exhausted(&self) -> bool {
        self.config.max_requests > 0 && self.request_count() >= self.config.max_requests
    }

    /// Can this handle take another request right now?
    pub fn usable(&self, now: Instant) -> bool {
        self.status() != HandleStatus::Terminated
            && !self.ttl_expired(now)
            && !self.exhausted()
    }

    pub fn multiplexing(&self) -> bool {
        self.instance.multiplexing()
    }

    /// Acquire exclusive use for non-multiplexing instances.
    pub async fn acquire(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.multiplexing() {
            None
        } else {
            Some(self.gate.lock().await)
        }
    }

    pub fn preempt_rx(&self) -> watch::Receiver<bool> {
        self.preempt_tx.subscribe()
    }

    pub async fn forward(&self, req: WorkerRequest) -> Result<WorkerResponse, AppError> {
        self.instance.forward(req).await
    }

    /// Terminate the worker, preempting any in-flight request.
    pub async fn terminate(&self) {
        self.set_status(HandleStatus::Terminated);
        let _ = self.preempt_tx.send(true);
        self.instance.terminate().await;
    }
}

/// Launches worker apps as subprocesses on loopback.
pub struct ProcessLauncher {
    command: String,
    client: reqwest::Client,
    /// How long to wait for the worker to start answering
    ready_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            client: reqwest::Client::new(),
            ready_timeout: Duration::from_secs(15),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Box<dyn WorkerInstance>, AppError> {
        if config.auto_install {
            let status = tokio::process::Command::new(&self.command)
                .arg("install")
                .current_dir(app_dir)
                .status()
                .await
                .map_err(|e| spawn_error(app_dir, format!("install failed to start: {e}")))?;
            if !status.success() {
                return Err(spawn_error(app_dir, format!("install exited with {status}")));
            }
        }

        let port = reserve_port().map_err(|e| spawn_error(app_dir, e))?;

        let mut command = tokio::process::Command::new(&self.command);
        if config.low_memory {
            command.arg("--smol");
        }
        command
            .arg(&config.entrypoint)
            .current_dir(app_dir)
            .envs(&config.env)
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::inherit());

        let child = command
            .spawn()
            .map_err(|e| spawn_error(app_dir, format!("spawn failed: {e}")))?;

        let instance = ProcessInstance {
            child: tokio::sync::Mutex::new(Some(child)),
            base_url: format!("http://127.0.0.1:{port}"),
            client: self.client.clone(),
            // a worker in low-memory mode handles one request at a time
            multiplexing: !config.low_memory,
        };
        instance
            .wait_ready(self.ready_timeout)
            .await
            .map_err(|e| spawn_error(app_dir, e))?;

        tracing::info!(app = %app_dir.display(), port, "worker ready");
        Ok(Box::new(instance))
    }
}

fn spawn_error(app_dir: &Path, detail: impl Into<String>) -> AppError {
    AppError::new(
        ErrorKind::WorkerSpawnFailed,
        format!("worker for {} failed to start: {}", app_dir.display(), detail.into()),
    )
}

// Bind-then-release gives the child a port that was free a moment ago.
fn reserve_port() -> Result<u16, String> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))
        .map_err(|e| format!("no free loopback port: {e}"))?;
    let port = listener
        .local_addr()
        .map_err(|e| format!("no local addr: {e}"))?
        .port();
    Ok(port)
}

struct ProcessInstance {
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
    base_url: String,
    client: reqwest::Client,
    multiplexing: bool,
}

impl ProcessInstance {
    async fn wait_ready(&self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        let probe = format!("{}/", self.base_url);
        loop {
            // any HTTP answer counts as ready, including 404
            if self.client.get(&probe).send().await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                self.terminate_inner().await;
                return Err("readiness probe timed out".to_string());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn terminate_inner(&self) {
        let mut guard = self.child.lock().await;
        if let Some(mut child) = guard.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!("worker kill failed: {e}");
            }
            let _ = child.wait().await;
        }
    }
}

#[async_trait]
impl WorkerInstance for ProcessInstance {
    async fn forward(&self, req: WorkerRequest) -> Result<WorkerResponse, AppError> {
        let url = format!("{}{}", self.base_url, req.path_and_query);
        let method = reqwest::Method::from_bytes(req.method.as_str().as_bytes())
            .map_err(|_| AppError::internal("unsupported method"))?;

        let mut builder = self.client.request(method, url);
        for (name, value) in req.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        let response = builder
            .body(req.body)
            .send()
            .await
            .map_err(|e| AppError::internal(format!("worker request failed: {e}")))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(name), Ok(value)) = (
                axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
                axum::http::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::internal(format!("worker response failed: {e}")))?;

        Ok(WorkerResponse {
            status,
            headers,
            body,
        })
    }

    async fn terminate(&self) {
        self.terminate_inner().await;
    }

    fn multiplexing(&self) -> bool {
        self.multiplexing
    }
}
