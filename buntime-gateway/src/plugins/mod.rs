//! # Plugin System
//!
//! Plugins extend the runtime with lifecycle hooks, request/response
//! interception, owned HTTP routes and optionally a served worker app. The
//! registry validates the set at boot — required dependencies present,
//! dependency graph acyclic, base paths pairwise distinct — computes a
//! topological order, runs `on_init` in that order and is immutable
//! afterwards.
//!
//! ## Capability model
//!
//! A plugin is one struct implementing [`Plugin`]. Hooks it does not
//! implement stay on the trait defaults; the [`HookSet`] in its descriptor
//! tells the dispatcher which hooks actually exist so default no-ops never
//! affect pipeline ordering.
//!
//! ## Services
//!
//! During `on_init` a plugin may publish a named service object. Plugins
//! later in the topological order (and the dispatcher at request time) can
//! look services up by name and downcast to the concrete type.

pub mod authn;
pub mod authz;
pub mod metrics;
pub mod rate_limit;
pub mod shell;

use crate::config::{PluginManifest, PublicRoutes, RuntimeConfig};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use buntime_core::error::AppError;
use dashmap::DashMap;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which hooks a plugin actually implements.
#[derive(Debug, Clone, Copy, Default)]
pub struct HookSet {
    pub on_request: bool,
    pub on_response: bool,
    pub server_fetch: bool,
}

/// Static description of a plugin, fixed at registration.
#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    /// Globally unique plugin name
    pub name: String,
    pub dependencies: Vec<String>,
    pub optional_dependencies: Vec<String>,
    /// Mount prefix for routes and/or the served app; globally unique
    pub base: Option<String>,
    pub public_routes: PublicRoutes,
    /// Directory of a worker app this plugin publishes
    pub served_app: Option<PathBuf>,
    pub hooks: HookSet,
}

impl PluginDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            optional_dependencies: Vec::new(),
            base: None,
            public_routes: PublicRoutes::default(),
            served_app: None,
            hooks: HookSet::default(),
        }
    }
}

/// Result of an `on_request` hook.
pub enum HookOutcome {
    /// Keep going with this (possibly modified) request
    Continue(Request<Body>),
    /// Short-circuit the pipeline with this response
    Respond(Response),
}

/// Named objects plugins share with each other.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceRegistry {
    pub fn publish(&self, name: impl Into<String>, service: Arc<dyn Any + Send + Sync>) {
        self.services.insert(name.into(), service);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).map(|entry| entry.value().clone())
    }

    /// Typed lookup.
    pub fn get_as<T: Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).and_then(|any| any.downcast::<T>().ok())
    }
}

/// The capability set every plugin conforms to. Absent capabilities keep
/// the defaults and are advertised through the descriptor's [`HookSet`].
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> PluginDescriptor;

    async fn on_init(&self, _services: &ServiceRegistry) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_request(&self, req: Request<Body>) -> Result<HookOutcome, AppError> {
        Ok(HookOutcome::Continue(req))
    }

    async fn on_response(&self, resp: Response) -> Result<Response, AppError> {
        Ok(resp)
    }

    /// Serve the request directly, bypassing worker routing. `None` and
    /// 404 responses both mean "not mine" and the pipeline continues.
    async fn server_fetch(&self, _req: &Request<Body>) -> Result<Option<Response>, AppError> {
        Ok(None)
    }

    /// Routes mounted under the plugin's base; captured once at init.
    fn routes(&self) -> Option<Router> {
        None
    }

    /// Service published after `on_init`.
    fn service(&self) -> Option<(String, Arc<dyn Any + Send + Sync>)> {
        None
    }
}

/// One registered plugin with everything the dispatcher needs per request.
#[derive(Clone)]
pub struct PluginEntry {
    pub plugin: Arc<dyn Plugin>,
    pub descriptor: PluginDescriptor,
    pub router: Option<Router>,
}

/// Validated, ordered, immutable set of plugins.
pub struct PluginRegistry {
    entries: Vec<PluginEntry>,
    services: Arc<ServiceRegistry>,
    shutdown_hook_timeout: Duration,
}

/// Builder phase of the registry; frozen into [`PluginRegistry`] by `init`.
#[derive(Default)]
pub struct PluginRegistryBuilder {
    pending: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> &mut Self {
        self.pending.push(plugin);
        self
    }

    /// Validate, order and initialize the plugin set.
    pub async fn init(self) -> anyhow::Result<PluginRegistry> {
        let descriptors: Vec<PluginDescriptor> =
            self.pending.iter().map(|p| p.descriptor()).collect();

        // unique names
        let mut names = HashSet::new();
        for descriptor in &descriptors {
            if !names.insert(descriptor.name.clone()) {
                anyhow::bail!("duplicate plugin name: {}", descriptor.name);
            }
        }

        // required dependencies present
        for descriptor in &descriptors {
            for dep in &descriptor.dependencies {
                if !names.contains(dep) {
                    anyhow::bail!(
                        "plugin {} requires missing dependency {}",
                        descriptor.name,
                        dep
                    );
                }
            }
        }

        // base paths pairwise distinct
        let mut bases: HashMap<&str, &str> = HashMap::new();
        for descriptor in &descriptors {
            if let Some(base) = descriptor.base.as_deref() {
                if let Some(other) = bases.insert(base, &descriptor.name) {
                    anyhow::bail!(
                        "route collision: plugins {} and {} both claim base {}",
                        other,
                        descriptor.name,
                        base
                    );
                }
            }
        }

        let order = topological_order(&descriptors)?;

        let services = Arc::new(ServiceRegistry::default());
        let mut entries = Vec::with_capacity(order.len());
        for index in order {
            let plugin = self.pending[index].clone();
            let descriptor = descriptors[index].clone();
            plugin.on_init(&services).await.map_err(|e| {
                anyhow::anyhow!("plugin {} failed to initialize: {e}", descriptor.name)
            })?;
            if let Some((name, service)) = plugin.service() {
                services.publish(name, service);
            }
            let router = plugin.routes();
            tracing::info!(plugin = %descriptor.name, "plugin initialized");
            entries.push(PluginEntry {
                plugin,
                descriptor,
                router,
            });
        }

        Ok(PluginRegistry {
            entries,
            services,
            shutdown_hook_timeout: Duration::from_secs(5),
        })
    }
}

impl PluginRegistry {
    /// Plugins in dispatch (topological) order.
    pub fn ordered(&self) -> &[PluginEntry] {
        &self.entries
    }

    /// Plugins with an `on_request` hook, in dispatch order.
    pub fn on_request_hooks(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.iter().filter(|e| e.descriptor.hooks.on_request)
    }

    /// Plugins with an `on_response` hook, in dispatch order.
    pub fn on_response_hooks(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.iter().filter(|e| e.descriptor.hooks.on_response)
    }

    /// Plugins with a `server_fetch` handler, in dispatch order.
    pub fn server_fetch_plugins(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.iter().filter(|e| e.descriptor.hooks.server_fetch)
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn get_service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name)
    }

    pub fn entry(&self, name: &str) -> Option<&PluginEntry> {
        self.entries.iter().find(|e| e.descriptor.name == name)
    }

    /// Which plugin's routes own this path? Longest base wins; the path is
    /// rewritten relative to the base by the dispatcher.
    pub fn route_owner(&self, path: &str) -> Option<&PluginEntry> {
        let mut candidates: Vec<&PluginEntry> = self
            .entries
            .iter()
            .filter(|e| e.router.is_some())
            .filter(|e| {
                e.descriptor
                    .base
                    .as_deref()
                    .map(|base| base_owns_path(base, path))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|e| {
            std::cmp::Reverse(e.descriptor.base.as_deref().map(str::len).unwrap_or(0))
        });
        candidates.into_iter().next()
    }

    /// Resolve a plugin-served app for this path (longest base wins).
    pub fn resolve_plugin_app(&self, path: &str) -> Option<PluginAppMatch<'_>> {
        let mut candidates: Vec<(&PluginEntry, &str, &PathBuf)> = self
            .entries
            .iter()
            .filter_map(|e| {
                let base = e.descriptor.base.as_deref()?;
                let dir = e.descriptor.served_app.as_ref()?;
                base_owns_path(base, path).then_some((e, base, dir))
            })
            .collect();
        candidates.sort_by_key(|(_, base, _)| std::cmp::Reverse(base.len()));
        candidates
            .into_iter()
            .next()
            .map(|(entry, base, dir)| PluginAppMatch {
                plugin: &entry.descriptor.name,
                base,
                dir,
            })
    }

    /// Is this path a public route of the named plugin for the method?
    pub fn is_public_route(&self, plugin: &str, path: &str, method: &str) -> bool {
        self.entry(plugin)
            .map(|e| e.descriptor.public_routes.is_public(path, method))
            .unwrap_or(false)
    }

    /// Run `on_shutdown` in reverse topological order, bounding each hook.
    pub async fn shutdown(&self) {
        for entry in self.entries.iter().rev() {
            let name = entry.descriptor.name.clone();
            match tokio::time::timeout(self.shutdown_hook_timeout, entry.plugin.on_shutdown())
                .await
            {
                Ok(Ok(())) => tracing::debug!(plugin = %name, "plugin shut down"),
                Ok(Err(e)) => tracing::error!(plugin = %name, "plugin shutdown failed: {e}"),
                Err(_) => tracing::error!(plugin = %name, "plugin shutdown timed out"),
            }
        }
    }
}

/// A plugin-served app resolved for a request path.
#[derive(Debug, Clone)]
pub struct PluginAppMatch<'a> {
    pub plugin: &'a str,
    pub base: &'a str,
    pub dir: &'a PathBuf,
}

/// Base `/a` owns `/a` and `/a/...` but not `/ab`.
pub fn base_owns_path(base: &str, path: &str) -> bool {
    if base == "/" || base.is_empty() {
        return true;
    }
    let base = base.trim_end_matches('/');
    path == base || path.starts_with(&format!("{base}/"))
}

/// Rewrite `path` relative to `base`, preserving a leading slash.
pub fn strip_base(base: &str, path: &str) -> String {
    if base == "/" || base.is_empty() {
        return path.to_string();
    }
    let base = base.trim_end_matches('/');
    let rest = path.strip_prefix(base).unwrap_or(path);
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

// Tarjan SCC over the dependency graph. Any component with more than one
// plugin (or a self-dependency) is a cycle and fatal; the component emit
// order doubles as the topological order, dependencies first.
fn topological_order(descriptors: &[PluginDescriptor]) -> anyhow::Result<Vec<usize>> {
    let index_of: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name.as_str(), i))
        .collect();

    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (i, descriptor) in descriptors.iter().enumerate() {
        for dep in descriptor
            .dependencies
            .iter()
            .chain(descriptor.optional_dependencies.iter())
        {
            if let Some(&j) = index_of.get(dep.as_str()) {
                edges[i].push(j);
            }
        }
    }

    struct Tarjan<'a> {
        edges: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next_index: usize,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn visit(&mut self, v: usize) {
            self.index[v] = Some(self.next_index);
            self.lowlink[v] = self.next_index;
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            let neighbors = self.edges[v].clone();
            for &w in &neighbors {
                if self.index[w].is_none() {
                    self.visit(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                } else if self.on_stack[w] {
                    self.lowlink[v] = self.lowlink[v].min(self.index[w].unwrap());
                }
            }

            if self.lowlink[v] == self.index[v].unwrap() {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let n = descriptors.len();
    let mut tarjan = Tarjan {
        edges: &edges,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.visit(v);
        }
    }

    let mut order = Vec::with_capacity(n);
    for component in tarjan.components {
        if component.len() > 1 {
            let cycle: Vec<&str> = component
                .iter()
                .map(|&i| descriptors[i].name.as_str())
                .collect();
            anyhow::bail!("plugin dependency cycle: {}", cycle.join(" -> "));
        }
        let v = component[0];
        if edges[v].contains(&v) {
            anyhow::bail!("plugin {} depends on itself", descriptors[v].name);
        }
        order.push(v);
    }
    Ok(order)
}

/// Compile-time registration table: manifest name → constructor. The
/// registry is frozen after init, so this is the only place plugin code is
/// wired up.
pub fn build_plugin(
    manifest: &PluginManifest,
    runtime: &RuntimeConfig,
    pool: &Arc<crate::pool::WorkerPool>,
) -> anyhow::Result<Arc<dyn Plugin>> {
    match manifest.name.as_str() {
        "authn" => Ok(Arc::new(authn::AuthnPlugin::from_manifest(manifest, runtime)?)),
        "authz" => Ok(Arc::new(authz::AuthzPlugin::from_manifest(manifest, runtime)?)),
        "rate-limit" => Ok(Arc::new(rate_limit::RateLimitPlugin::from_manifest(manifest)?)),
        "metrics" => Ok(Arc::new(metrics::MetricsPlugin::from_manifest(manifest, pool.clone())?)),
        "shell" => Ok(Arc::new(shell::ShellPlugin::from_manifest(manifest)?)),
        other => anyhow::bail!("unknown plugin: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TestPlugin {
        descriptor: PluginDescriptor,
        init_log: Arc<Mutex<Vec<String>>>,
        service: Option<(String, Arc<dyn Any + Send + Sync>)>,
    }

    #[async_trait]
    impl Plugin for TestPlugin {
        fn descriptor(&self) -> PluginDescriptor {
            self.descriptor.clone()
        }

        async fn on_init(&self, _services: &ServiceRegistry) -> Result<(), AppError> {
            self.init_log
                .lock()
                .unwrap()
                .push(self.descriptor.name.clone());
            Ok(())
        }

        fn service(&self) -> Option<(String, Arc<dyn Any + Send + Sync>)> {
            self.service.clone()
        }
    }

    fn plugin(
        log: &Arc<Mutex<Vec<String>>>,
        name: &str,
        deps: &[&str],
        base: Option<&str>,
    ) -> Arc<dyn Plugin> {
        let mut descriptor = PluginDescriptor::named(name);
        descriptor.dependencies = deps.iter().map(|s| s.to_string()).collect();
        descriptor.base = base.map(str::to_string);
        Arc::new(TestPlugin {
            descriptor,
            init_log: log.clone(),
            service: None,
        })
    }

    #[tokio::test]
    async fn init_runs_in_dependency_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = PluginRegistryBuilder::new();
        builder.register(plugin(&log, "authz", &["authn"], Some("/authz")));
        builder.register(plugin(&log, "authn", &[], Some("/authn")));
        builder.register(plugin(&log, "metrics", &["authz"], Some("/metrics")));
        let registry = builder.init().await.unwrap();

        let order = log.lock().unwrap().clone();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("authn") < pos("authz"));
        assert!(pos("authz") < pos("metrics"));
        assert_eq!(registry.ordered().len(), 3);
    }

    #[tokio::test]
    async fn missing_required_dependency_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = PluginRegistryBuilder::new();
        builder.register(plugin(&log, "authz", &["authn"], None));
        let err = builder.init().await.unwrap_err();
        assert!(err.to_string().contains("missing dependency"));
    }

    #[tokio::test]
    async fn missing_optional_dependency_is_fine() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut descriptor = PluginDescriptor::named("solo");
        descriptor.optional_dependencies = vec!["absent".to_string()];
        let mut builder = PluginRegistryBuilder::new();
        builder.register(Arc::new(TestPlugin {
            descriptor,
            init_log: log.clone(),
            service: None,
        }));
        assert!(builder.init().await.is_ok());
    }

    #[tokio::test]
    async fn dependency_cycle_is_fatal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = PluginRegistryBuilder::new();
        builder.register(plugin(&log, "a", &["b"], None));
        builder.register(plugin(&log, "b", &["c"], None));
        builder.register(plugin(&log, "c", &["a"], None));
        let err = builder.init().await.unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[tokio::test]
    async fn duplicate_base_is_a_route_collision() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = PluginRegistryBuilder::new();
        builder.register(plugin(&log, "one", &[], Some("/shared")));
        builder.register(plugin(&log, "two", &[], Some("/shared")));
        let err = builder.init().await.unwrap_err();
        assert!(err.to_string().contains("route collision"));
    }

    #[tokio::test]
    async fn services_visible_to_later_plugins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut provider = PluginDescriptor::named("provider");
        provider.base = Some("/provider".to_string());
        let mut builder = PluginRegistryBuilder::new();
        builder.register(Arc::new(TestPlugin {
            descriptor: provider,
            init_log: log.clone(),
            service: Some(("answers".to_string(), Arc::new(42u32) as Arc<dyn Any + Send + Sync>)),
        }));
        let registry = builder.init().await.unwrap();
        let value: Arc<u32> = registry.services().get_as("answers").unwrap();
        assert_eq!(*value, 42);
        assert!(registry.get_service("nothing").is_none());
    }

    #[tokio::test]
    async fn plugin_app_resolution_prefers_longest_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut outer = PluginDescriptor::named("outer");
        outer.base = Some("/cp".to_string());
        outer.served_app = Some(PathBuf::from("/plugins/outer/app"));
        let mut inner = PluginDescriptor::named("inner");
        inner.base = Some("/cp/admin".to_string());
        inner.served_app = Some(PathBuf::from("/plugins/inner/app"));

        let mut builder = PluginRegistryBuilder::new();
        for descriptor in [outer, inner] {
            builder.register(Arc::new(TestPlugin {
                descriptor,
                init_log: log.clone(),
                service: None,
            }));
        }
        let registry = builder.init().await.unwrap();

        let matched = registry.resolve_plugin_app("/cp/admin/users").unwrap();
        assert_eq!(matched.plugin, "inner");
        let matched = registry.resolve_plugin_app("/cp/other").unwrap();
        assert_eq!(matched.plugin, "outer");
        assert!(registry.resolve_plugin_app("/elsewhere").is_none());
    }

    #[test]
    fn base_prefix_semantics() {
        assert!(base_owns_path("/cp", "/cp"));
        assert!(base_owns_path("/cp", "/cp/x"));
        assert!(!base_owns_path("/cp", "/cpanel"));
        assert!(base_owns_path("/", "/anything"));
        assert_eq!(strip_base("/cp", "/cp/x?q=1"), "/x?q=1");
        assert_eq!(strip_base("/cp", "/cp"), "/");
        assert_eq!(strip_base("/", "/x"), "/x");
    }
}
