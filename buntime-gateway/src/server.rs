//! # Server Assembly
//!
//! Builds the [`Runtime`] aggregate — pool, plugin registry, virtual-host
//! matcher — wires the middleware stack around the fallback dispatcher and
//! owns graceful shutdown. Nothing here is global: `main` constructs one
//! `Runtime` and the dispatcher closes over it.

use crate::config::{discover_plugin_manifests, RuntimeConfig};
use crate::dispatch::dispatch;
use crate::metrics;
use crate::middleware::{guard_middleware, request_id_middleware, GuardConfig};
use crate::plugins::{build_plugin, Plugin, PluginRegistry, PluginRegistryBuilder};
use crate::pool::{ProcessLauncher, WorkerLauncher, WorkerPool};
use crate::vhost::VirtualHostMatcher;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

/// Everything a request needs, constructed once at boot.
pub struct Runtime {
    pub config: RuntimeConfig,
    pub pool: Arc<WorkerPool>,
    pub registry: PluginRegistry,
    pub vhosts: VirtualHostMatcher,
    shutdown_tx: watch::Sender<bool>,
}

impl Runtime {
    /// The configured shell plugin's base and served app, if both exist.
    pub fn shell_target(&self) -> Option<(String, PathBuf)> {
        let name = self.config.shell_plugin.as_deref()?;
        let entry = self.registry.entry(name)?;
        let base = entry.descriptor.base.clone()?;
        let dir = entry.descriptor.served_app.clone()?;
        Some((base, dir))
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop background jobs, run plugin shutdown hooks in reverse order and
    /// drain the pool within the grace window.
    pub async fn shutdown(&self) {
        tracing::info!("runtime shutting down");
        let _ = self.shutdown_tx.send(true);
        self.registry.shutdown().await;
        self.pool
            .shutdown(Duration::from_millis(self.config.shutdown_grace_ms))
            .await;
    }
}

/// Assemble a runtime from config and a launcher. Plugin manifests are
/// discovered under the configured plugin directories and instantiated
/// through the registration table; extra pre-built plugins (tests, embedded
/// setups) can be passed alongside.
pub async fn build_runtime(
    config: RuntimeConfig,
    launcher: Arc<dyn WorkerLauncher>,
    extra_plugins: Vec<Arc<dyn Plugin>>,
) -> anyhow::Result<Arc<Runtime>> {
    let pool = Arc::new(WorkerPool::new(
        config.pool_size,
        config.body_size,
        launcher,
    ));

    let mut builder = PluginRegistryBuilder::new();
    for manifest in discover_plugin_manifests(&config.plugin_dirs)? {
        match build_plugin(&manifest, &config, &pool) {
            Ok(plugin) => {
                builder.register(plugin);
            }
            Err(e) => {
                // unknown or broken plugins are fatal: a silently missing
                // authz plugin is worse than a refused boot
                anyhow::bail!("plugin {}: {e}", manifest.name);
            }
        }
    }
    for plugin in extra_plugins {
        builder.register(plugin);
    }
    let registry = builder.init().await?;

    if let Some(shell) = &config.shell_plugin {
        if registry.entry(shell).is_none() {
            anyhow::bail!("shell plugin {shell:?} is configured but not registered");
        }
    }

    let vhosts = VirtualHostMatcher::new(&config.vhosts);
    let (shutdown_tx, _) = watch::channel(false);

    let runtime = Arc::new(Runtime {
        config,
        pool,
        registry,
        vhosts,
        shutdown_tx,
    });

    // background jobs stop on the shutdown signal
    runtime.pool.spawn_sweeper(
        runtime.config.sweep_interval_ms,
        runtime.shutdown_signal(),
    );
    metrics::spawn_retention_task(
        Duration::from_secs(3600),
        Duration::from_secs(300),
        runtime.shutdown_signal(),
    );

    Ok(runtime)
}

/// The middleware stack around the single fallback dispatcher. Order, outermost
/// first: trace → request id → guards → dispatch.
pub fn build_router(runtime: Arc<Runtime>) -> Router {
    let guard = GuardConfig {
        max_body_size: runtime.config.body_size.max,
    };
    let router: Router<Arc<Runtime>> = Router::new();
    router
        .fallback(dispatch)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_id_middleware))
                .layer(axum::middleware::from_fn_with_state(guard, guard_middleware)),
        )
        .with_state(runtime)
}

/// Production assembly: subprocess launcher, discovered plugins, full
/// middleware stack.
pub async fn create_server(config: RuntimeConfig) -> anyhow::Result<(Router, Arc<Runtime>)> {
    let launcher = Arc::new(ProcessLauncher::new(config.worker_command.clone()));
    let runtime = build_runtime(config, launcher, Vec::new()).await?;
    Ok((build_router(runtime.clone()), runtime))
}

#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Runtime>();
}

#[allow(dead_code)]
fn _assert_handler() {
    fn h<H, T>(_: H)
    where
        H: axum::handler::Handler<T, Arc<Runtime>>,
    {
    }
    h(dispatch);
}

#[allow(dead_code, unreachable_code)]
fn _assert_future_send() {
    fn is_send<T: Send>(_: T) {}
    if false {
        let state: State<Arc<Runtime>> = unreachable!();
        let req: axum::http::Request<axum::body::Body> = unreachable!();
        let fut = dispatch(state, req);
        is_send(fut);
    }
}
