//! # Worker Pool
//!
//! Bounded LRU cache of live worker handles keyed by
//! `(appDir, configFingerprint)`. The pool owns worker lifecycle end to end:
//! spawn with one retry, readiness, per-request serialization and deadline,
//! body-size enforcement, idle/ttl/request-count recycling, LRU eviction
//! under pressure, the background sweeper and shutdown draining.
//!
//! ## Admission
//!
//! A dispatch probes the cache first. A usable handle (not terminated, not
//! past its ttl, request budget left) is promoted and reused; anything else
//! is evicted and respawned. On a miss with the pool full, the
//! least-recently-used *idle* handle is evicted; when every handle is busy
//! the least-recently-used one is preempted and its in-flight request gets a
//! `WORKER_REPLACED` error.
//!
//! ## Accounting
//!
//! Every dispatch is exactly one cache hit or one cache miss, so
//! `hits + misses == requests` holds at all times.

pub mod handle;

pub use handle::{
    HandleStatus, ProcessLauncher, WorkerHandle, WorkerInstance, WorkerLauncher, WorkerRequest,
    WorkerResponse,
};

use crate::config::BodySizeConfig;
use crate::config::WorkerConfig;
use buntime_core::error::{AppError, ErrorKind};
use dashmap::DashMap;
use lru::LruCache;
use rand::Rng;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Cache key: one pool entry per app directory and normalized config.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub app_dir: PathBuf,
    pub fingerprint: String,
}

#[derive(Debug, Default)]
struct PoolCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    created: AtomicU64,
    failed: AtomicU64,
    requests: AtomicU64,
    duration_total_ms: AtomicU64,
}

/// Counter snapshot returned by [`WorkerPool::metrics`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetrics {
    pub cache_hit_count: u64,
    pub cache_miss_count: u64,
    pub eviction_count: u64,
    pub worker_created_count: u64,
    pub worker_failed_count: u64,
    pub request_count: u64,
    pub avg_request_duration_ms: f64,
    pub hit_rate: f64,
    pub size: usize,
    pub capacity: usize,
}

pub struct WorkerPool {
    capacity: usize,
    body_size: BodySizeConfig,
    launcher: Arc<dyn WorkerLauncher>,
    // unbounded LRU; capacity is enforced here so eviction can prefer idle
    // handles over busy ones
    entries: Mutex<LruCache<PoolKey, Arc<WorkerHandle>>>,
    // per-key guard so concurrent misses spawn one worker, not several
    spawning: DashMap<PoolKey, Arc<tokio::sync::Mutex<()>>>,
    counters: PoolCounters,
    spawn_retry_delay: Duration,
}

impl WorkerPool {
    pub fn new(
        capacity: usize,
        body_size: BodySizeConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            body_size,
            launcher,
            entries: Mutex::new(LruCache::unbounded()),
            spawning: DashMap::new(),
            counters: PoolCounters::default(),
            spawn_retry_delay: Duration::from_millis(100),
        }
    }

    /// Forward one request to a worker for `app_dir` under `config`.
    ///
    /// Applies the per-request deadline from `config.timeout_ms` and the
    /// effective body limit. The request body is buffered here with the
    /// limit enforced while reading.
    pub async fn dispatch(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
        req: WorkerRequest,
    ) -> Result<WorkerResponse, AppError> {
        let limit = config.effective_body_limit(&self.body_size);
        if req.body.len() as u64 > limit {
            return Err(body_too_large(req.body.len() as u64, limit));
        }

        let key = PoolKey {
            app_dir: app_dir.to_path_buf(),
            fingerprint: config.fingerprint(),
        };

        let (handle, was_hit) = self.acquire(&key, app_dir, config).await?;
        if was_hit {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        // exclusive use for non-multiplexing workers
        let _gate = handle.acquire().await;
        if handle.status() == HandleStatus::Terminated {
            // lost the handle while waiting on the gate
            return Err(AppError::new(
                ErrorKind::WorkerReplaced,
                "worker replaced while waiting for dispatch",
            ));
        }

        handle.set_status(HandleStatus::Active);
        let started = Instant::now();
        let deadline = Duration::from_millis(config.timeout_ms);
        let mut preempt = handle.preempt_rx();

        let outcome = tokio::select! {
            res = tokio::time::timeout(deadline, handle.forward(req)) => match res {
                Ok(inner) => inner,
                Err(_) => {
                    // worker state is unknown after a blown deadline
                    self.remove(&key, &handle);
                    handle.terminate().await;
                    self.record_duration(started);
                    return Err(AppError::new(
                        ErrorKind::DeadlineExceeded,
                        format!("worker did not respond within {}ms", config.timeout_ms),
                    ));
                }
            },
            _ = preempt.wait_for(|&p| p) => {
                self.record_duration(started);
                return Err(AppError::new(
                    ErrorKind::WorkerReplaced,
                    "worker replaced under pool pressure",
                ));
            }
        };
        self.record_duration(started);

        match outcome {
            Ok(response) => {
                handle.record_request();
                handle.touch();
                handle.set_status(HandleStatus::Idle);

                let now = Instant::now();
                let recycle = config.ttl_ms == 0 || handle.ttl_expired(now) || handle.exhausted();
                if recycle && config.ttl_ms == 0 {
                    tracing::debug!(app = %app_dir.display(), "ephemeral worker terminating after request");
                }
                if recycle {
                    self.remove(&key, &handle);
                    handle.terminate().await;
                }
                Ok(response)
            }
            Err(err) => {
                // a worker that errored mid-request is not trusted again
                self.remove(&key, &handle);
                handle.terminate().await;
                Err(err)
            }
        }
    }

    /// Buffer a request body while enforcing the effective limit for the
    /// app. A `Content-Length` past the limit rejects without reading.
    pub async fn buffer_body(
        &self,
        config: &WorkerConfig,
        headers: &axum::http::HeaderMap,
        body: axum::body::Body,
    ) -> Result<axum::body::Bytes, AppError> {
        let limit = config.effective_body_limit(&self.body_size);
        if let Some(length) = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > limit {
                return Err(body_too_large(length, limit));
            }
        }
        let cap = usize::try_from(limit).unwrap_or(usize::MAX);
        axum::body::to_bytes(body, cap)
            .await
            .map_err(|_| body_too_large(0, limit))
    }

    async fn acquire(
        &self,
        key: &PoolKey,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<(Arc<WorkerHandle>, bool), AppError> {
        let now = Instant::now();

        // fast path: probe, promote, reuse
        let stale = {
            let mut entries = self.entries.lock().expect("pool entries poisoned");
            let probed = entries.get(key).map(|h| (h.clone(), h.usable(now)));
            match probed {
                Some((handle, true)) => return Ok((handle, true)),
                Some((_, false)) => entries.pop(key),
                None => None,
            }
        };
        if let Some(handle) = stale {
            handle.terminate().await;
        }

        // serialize spawns per key so concurrent misses share one worker
        let spawn_gate = self
            .spawning
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _spawning = spawn_gate.lock().await;

        // someone else may have spawned while we waited
        {
            let mut entries = self.entries.lock().expect("pool entries poisoned");
            if let Some(handle) = entries.get(key) {
                if handle.usable(Instant::now()) {
                    return Ok((handle.clone(), true));
                }
            }
        }

        let instance = self.spawn_with_retry(app_dir, config).await?;
        let handle = Arc::new(WorkerHandle::new(
            app_dir.to_path_buf(),
            key.fingerprint.clone(),
            config.clone(),
            instance,
        ));

        let evicted = {
            let mut entries = self.entries.lock().expect("pool entries poisoned");
            let evicted = if entries.len() >= self.capacity {
                self.evict_locked(&mut entries)
            } else {
                None
            };
            entries.put(key.clone(), handle.clone());
            evicted
        };
        if let Some(victim) = evicted {
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            victim.terminate().await;
        }

        Ok((handle, false))
    }

    // Reclaims exactly one slot: the least-recently-used idle handle, or the
    // least-recently-used handle outright when everything is busy (its
    // in-flight request is preempted).
    fn evict_locked(
        &self,
        entries: &mut LruCache<PoolKey, Arc<WorkerHandle>>,
    ) -> Option<Arc<WorkerHandle>> {
        let idle_victim = entries
            .iter()
            .rev()
            .find(|(_, handle)| handle.status() != HandleStatus::Active)
            .map(|(key, _)| key.clone());
        let victim_key = idle_victim.or_else(|| {
            entries.peek_lru().map(|(key, _)| key.clone())
        })?;
        entries.pop(&victim_key)
    }

    async fn spawn_with_retry(
        &self,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Box<dyn WorkerInstance>, AppError> {
        match self.launcher.launch(app_dir, config).await {
            Ok(instance) => {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                Ok(instance)
            }
            Err(first) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let jitter = rand::thread_rng().gen_range(0..50);
                tokio::time::sleep(self.spawn_retry_delay + Duration::from_millis(jitter)).await;
                tracing::warn!(app = %app_dir.display(), "worker spawn failed, retrying: {first}");
                match self.launcher.launch(app_dir, config).await {
                    Ok(instance) => {
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        Ok(instance)
                    }
                    Err(second) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        Err(AppError::new(
                            ErrorKind::WorkerSpawnFailed,
                            format!("worker spawn failed after retry: {second}"),
                        ))
                    }
                }
            }
        }
    }

    fn remove(&self, key: &PoolKey, handle: &Arc<WorkerHandle>) {
        let mut entries = self.entries.lock().expect("pool entries poisoned");
        let matches = entries
            .peek(key)
            .map(|current| Arc::ptr_eq(current, handle))
            .unwrap_or(false);
        if matches {
            entries.pop(key);
        }
    }

    fn record_duration(&self, started: Instant) {
        let elapsed = started.elapsed().as_millis() as u64;
        self.counters
            .duration_total_ms
            .fetch_add(elapsed, Ordering::Relaxed);
    }

    /// Remove handles whose idle or ttl timer expired. Active handles are
    /// never swept. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let victims: Vec<(PoolKey, Arc<WorkerHandle>)> = {
            let mut entries = self.entries.lock().expect("pool entries poisoned");
            let expired: Vec<PoolKey> = entries
                .iter()
                .filter(|(_, handle)| {
                    handle.status() != HandleStatus::Active
                        && (handle.idle_expired(now) || handle.ttl_expired(now))
                })
                .map(|(key, _)| key.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|key| entries.pop_entry(&key))
                .collect()
        };
        let count = victims.len();
        for (key, handle) in victims {
            tracing::debug!(app = %key.app_dir.display(), "sweeping expired worker");
            handle.terminate().await;
        }
        count
    }

    /// Spawn the background sweeper. Stops when `shutdown` flips true.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval_ms: u64,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = pool.sweep().await;
                        if swept > 0 {
                            tracing::debug!(swept, "pool sweeper removed workers");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    pub fn metrics(&self) -> PoolMetrics {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let requests = self.counters.requests.load(Ordering::Relaxed);
        let duration_total = self.counters.duration_total_ms.load(Ordering::Relaxed);
        let size = self.entries.lock().expect("pool entries poisoned").len();
        PoolMetrics {
            cache_hit_count: hits,
            cache_miss_count: misses,
            eviction_count: self.counters.evictions.load(Ordering::Relaxed),
            worker_created_count: self.counters.created.load(Ordering::Relaxed),
            worker_failed_count: self.counters.failed.load(Ordering::Relaxed),
            request_count: requests,
            avg_request_duration_ms: if requests > 0 {
                duration_total as f64 / requests as f64
            } else {
                0.0
            },
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            size,
            capacity: self.capacity,
        }
    }

    pub fn size(&self) -> usize {
        self.entries.lock().expect("pool entries poisoned").len()
    }

    /// Terminate everything. In-flight requests get up to `grace` to finish
    /// before their handles are killed underneath them.
    pub async fn shutdown(&self, grace: Duration) {
        let deadline = Instant::now() + grace;
        loop {
            let busy = {
                let entries = self.entries.lock().expect("pool entries poisoned");
                entries
                    .iter()
                    .any(|(_, handle)| handle.status() == HandleStatus::Active)
            };
            if !busy || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let drained: Vec<Arc<WorkerHandle>> = {
            let mut entries = self.entries.lock().expect("pool entries poisoned");
            let mut all = Vec::with_capacity(entries.len());
            while let Some((_, handle)) = entries.pop_lru() {
                all.push(handle);
            }
            all
        };
        for handle in drained {
            handle.terminate().await;
        }
        tracing::info!("worker pool shut down");
    }
}

fn body_too_large(length: u64, limit: u64) -> AppError {
    let message = if length > 0 {
        format!("request body of {length} bytes exceeds the {limit} byte limit")
    } else {
        format!("request body exceeds the {limit} byte limit")
    };
    AppError::new(ErrorKind::BodyTooLarge, message).with_data(serde_json::json!({
        "limit": limit,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryLauncher;
    use axum::http::{HeaderMap, Method};

    fn request() -> WorkerRequest {
        WorkerRequest {
            method: Method::GET,
            path_and_query: "/".to_string(),
            headers: HeaderMap::new(),
            body: axum::body::Bytes::new(),
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig {
            ttl_ms: 3_600_000,
            timeout_ms: 5_000,
            idle_timeout_ms: 3_600_000,
            ..WorkerConfig::default()
        }
    }

    fn body_size() -> BodySizeConfig {
        BodySizeConfig {
            default: 10 * 1024 * 1024,
            max: 100 * 1024 * 1024,
        }
    }

    fn pool_with(capacity: usize, launcher: Arc<MemoryLauncher>) -> WorkerPool {
        WorkerPool::new(capacity, body_size(), launcher)
    }

    #[tokio::test]
    async fn lru_eviction_scenario() {
        // pool of 2; A, B, A, C: the fourth dispatch evicts B
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(2, launcher.clone());
        let cfg = config();

        for app in ["A", "B", "A", "C"] {
            pool.dispatch(Path::new(app), &cfg, request()).await.unwrap();
        }

        let metrics = pool.metrics();
        assert_eq!(metrics.cache_miss_count, 3);
        assert_eq!(metrics.cache_hit_count, 1);
        assert_eq!(metrics.eviction_count, 1);
        assert_eq!(metrics.size, 2);
        assert_eq!(
            metrics.cache_hit_count + metrics.cache_miss_count,
            metrics.request_count
        );
        assert_eq!(launcher.terminated("B"), 1);
        assert_eq!(launcher.terminated("A"), 0);
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(3, launcher);
        let cfg = config();
        for app in ["a", "b", "c", "d", "e", "f"] {
            pool.dispatch(Path::new(app), &cfg, request()).await.unwrap();
            assert!(pool.size() <= 3);
        }
    }

    #[tokio::test]
    async fn second_spawn_failure_surfaces() {
        let launcher = Arc::new(MemoryLauncher::new());
        launcher.fail_launches("broken", 2);
        let pool = pool_with(2, launcher);
        let err = pool
            .dispatch(Path::new("broken"), &config(), request())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::WorkerSpawnFailed);
        let metrics = pool.metrics();
        assert_eq!(metrics.worker_failed_count, 2);
        assert_eq!(metrics.worker_created_count, 0);
    }

    #[tokio::test]
    async fn spawn_retries_once_and_succeeds() {
        let launcher = Arc::new(MemoryLauncher::new());
        launcher.fail_launches("flaky", 1);
        let pool = pool_with(2, launcher);
        let response = pool
            .dispatch(Path::new("flaky"), &config(), request())
            .await
            .unwrap();
        assert_eq!(response.status, axum::http::StatusCode::OK);
        let metrics = pool.metrics();
        assert_eq!(metrics.worker_failed_count, 1);
        assert_eq!(metrics.worker_created_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_terminates_the_handle() {
        let launcher = Arc::new(MemoryLauncher::new());
        launcher.set_delay("slow", Duration::from_secs(60));
        let pool = pool_with(2, launcher.clone());
        let mut cfg = config();
        cfg.timeout_ms = 1_000;

        let err = pool
            .dispatch(Path::new("slow"), &cfg, request())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
        assert_eq!(pool.size(), 0);
        assert_eq!(launcher.terminated("slow"), 1);
    }

    #[tokio::test]
    async fn max_requests_recycles_worker() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(2, launcher.clone());
        let mut cfg = config();
        cfg.max_requests = 2;

        pool.dispatch(Path::new("A"), &cfg, request()).await.unwrap();
        pool.dispatch(Path::new("A"), &cfg, request()).await.unwrap();
        // budget spent: the handle is gone
        assert_eq!(pool.size(), 0);
        assert_eq!(launcher.terminated("A"), 1);

        // third request spawns fresh
        pool.dispatch(Path::new("A"), &cfg, request()).await.unwrap();
        let metrics = pool.metrics();
        assert_eq!(metrics.cache_miss_count, 2);
        assert_eq!(metrics.cache_hit_count, 1);
    }

    #[tokio::test]
    async fn zero_ttl_is_ephemeral() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(2, launcher.clone());
        let mut cfg = config();
        cfg.ttl_ms = 0;

        pool.dispatch(Path::new("once"), &cfg, request()).await.unwrap();
        assert_eq!(pool.size(), 0);
        assert_eq!(launcher.terminated("once"), 1);
        pool.dispatch(Path::new("once"), &cfg, request()).await.unwrap();
        assert_eq!(pool.metrics().cache_miss_count, 2);
    }

    #[tokio::test]
    async fn distinct_fingerprints_get_distinct_workers() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(4, launcher.clone());
        let a = config();
        let mut b = config();
        b.timeout_ms = 9_000;

        pool.dispatch(Path::new("app"), &a, request()).await.unwrap();
        pool.dispatch(Path::new("app"), &b, request()).await.unwrap();
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.metrics().cache_miss_count, 2);
    }

    #[tokio::test]
    async fn content_length_over_limit_rejects_without_reading() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(2, launcher);
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::CONTENT_LENGTH,
            "1073741824".parse().unwrap(),
        );
        let err = pool
            .buffer_body(&config(), &headers, axum::body::Body::empty())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BodyTooLarge);
    }

    #[tokio::test]
    async fn streamed_body_over_limit_is_aborted() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = WorkerPool::new(
            2,
            BodySizeConfig {
                default: 8,
                max: 8,
            },
            launcher,
        );
        let err = pool
            .buffer_body(
                &config(),
                &HeaderMap::new(),
                axum::body::Body::from("way past eight bytes"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::BodyTooLarge);
    }

    #[tokio::test]
    async fn sweep_removes_expired_idle_handles() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(4, launcher.clone());
        let mut cfg = config();
        cfg.idle_timeout_ms = 0;

        // idle_timeout of 0 would be rejected by the loader; forcing it here
        // makes the handle instantly stale
        pool.dispatch(Path::new("stale"), &cfg, request()).await.unwrap();
        assert_eq!(pool.size(), 1);
        let swept = pool.sweep().await;
        assert_eq!(swept, 1);
        assert_eq!(pool.size(), 0);
        assert_eq!(launcher.terminated("stale"), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_everything() {
        let launcher = Arc::new(MemoryLauncher::new());
        let pool = pool_with(4, launcher.clone());
        pool.dispatch(Path::new("x"), &config(), request()).await.unwrap();
        pool.dispatch(Path::new("y"), &config(), request()).await.unwrap();
        pool.shutdown(Duration::from_millis(100)).await;
        assert_eq!(pool.size(), 0);
        assert_eq!(launcher.terminated("x"), 1);
        assert_eq!(launcher.terminated("y"), 1);
    }
}
