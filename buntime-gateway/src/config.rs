//! # Configuration Management
//!
//! Three layers of configuration feed the runtime:
//!
//! - **Runtime config**: process-wide settings from an optional TOML file
//!   plus environment variable overrides (`WORKER_DIRS`, `PLUGIN_DIRS`,
//!   `POOL_SIZE`, `HOMEPAGE_APP`, `PORT`, `NODE_ENV`, `ROOT_KEY`).
//! - **Worker manifests**: per-app `manifest.yaml|yml|json` in each worker
//!   directory. Durations normalize to milliseconds, sizes to bytes, both
//!   clamped against the global caps; relationship invariants are enforced
//!   at load. A missing manifest means defaults.
//! - **Plugin manifests**: per-plugin `manifest.yaml|yml|json` under the
//!   plugin directories; unrecognized keys become the plugin's own config.
//!
//! Normalized worker configs are immutable and fingerprinted
//! (sha256 of the canonical JSON) so a config change yields a distinct
//! worker pool entry.

use anyhow::{anyhow, bail, Context};
use buntime_core::glob::GlobSet;
use buntime_core::units;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};

/// Process-wide runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directories holding worker apps, in resolution order
    pub worker_dirs: Vec<PathBuf>,
    /// Directories scanned for plugin manifests
    pub plugin_dirs: Vec<PathBuf>,
    /// Worker pool capacity
    pub pool_size: usize,
    /// App served at `/`
    pub homepage_app: Option<String>,
    pub host: String,
    pub port: u16,
    /// Deployment environment (`NODE_ENV`), gates policy seeding
    pub env: String,
    /// Bootstrap admin credential, passed through to plugin config
    pub root_key: Option<String>,
    /// Companion database endpoint, handed to plugins that want one
    pub libsql_url: Option<String>,
    pub libsql_auth_token: Option<String>,
    /// Command used to launch worker entrypoints
    pub worker_command: String,
    pub body_size: BodySizeConfig,
    pub caps: GlobalCaps,
    /// Pool sweeper cadence in milliseconds
    pub sweep_interval_ms: u64,
    /// Shutdown drain window in milliseconds
    pub shutdown_grace_ms: u64,
    /// Host pattern → virtual-host target
    pub vhosts: HashMap<String, VirtualHostTarget>,
    /// Plugin whose served app renders shell chrome and 404 pages
    pub shell_plugin: Option<String>,
}

/// Global request body limits. `default` applies when a worker manifest is
/// silent; `max` caps whatever a manifest asks for.
#[derive(Debug, Clone, Copy)]
pub struct BodySizeConfig {
    pub default: u64,
    pub max: u64,
}

/// Upper bounds worker manifests are clamped against.
#[derive(Debug, Clone, Copy)]
pub struct GlobalCaps {
    pub max_timeout_ms: u64,
    pub max_ttl_ms: u64,
}

/// Target of a virtual-host mapping.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHostTarget {
    pub app: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

// Raw TOML file shape; durations and sizes arrive as strings or integers
// and are normalized afterwards.
#[derive(Debug, Default, Deserialize)]
struct RawRuntimeFile {
    #[serde(default)]
    server: RawServerSection,
    #[serde(default)]
    pool: RawPoolSection,
    #[serde(default)]
    body_size: RawBodySizeSection,
    #[serde(default)]
    caps: RawCapsSection,
    #[serde(default)]
    vhosts: HashMap<String, VirtualHostTarget>,
    #[serde(default)]
    shell: RawShellSection,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerSection {
    host: Option<String>,
    port: Option<u16>,
    shutdown_grace: Option<Value>,
    worker_command: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPoolSection {
    size: Option<usize>,
    sweep_interval: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBodySizeSection {
    default: Option<Value>,
    max: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCapsSection {
    max_timeout: Option<Value>,
    max_ttl: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct RawShellSection {
    plugin: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_dirs: vec![],
            plugin_dirs: vec![PathBuf::from("./plugins")],
            pool_size: 16,
            homepage_app: None,
            host: "127.0.0.1".to_string(),
            port: 3000,
            env: "development".to_string(),
            root_key: None,
            libsql_url: None,
            libsql_auth_token: None,
            worker_command: "bun".to_string(),
            body_size: BodySizeConfig {
                default: 10 * 1024 * 1024,
                max: 100 * 1024 * 1024,
            },
            caps: GlobalCaps {
                max_timeout_ms: 5 * 60 * 1000,
                max_ttl_ms: 7 * 86_400 * 1000,
            },
            sweep_interval_ms: 30_000,
            shutdown_grace_ms: 10_000,
            vhosts: HashMap::new(),
            shell_plugin: None,
        }
    }
}

impl RuntimeConfig {
    /// Load from an optional TOML file, then apply environment overrides and
    /// validate. `WORKER_DIRS` must end up non-empty.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let raw: RawRuntimeFile = toml::from_str(&content)
                .with_context(|| format!("parsing config file {}", path.display()))?;
            config.apply_file(raw)?;
        }
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, raw: RawRuntimeFile) -> anyhow::Result<()> {
        if let Some(host) = raw.server.host {
            self.host = host;
        }
        if let Some(port) = raw.server.port {
            self.port = port;
        }
        if let Some(cmd) = raw.server.worker_command {
            self.worker_command = cmd;
        }
        if let Some(grace) = raw.server.shutdown_grace {
            self.shutdown_grace_ms = units::parse_duration_ms(&grace)
                .map_err(|e| anyhow!("server.shutdown_grace: {e}"))?;
        }
        if let Some(size) = raw.pool.size {
            self.pool_size = size;
        }
        if let Some(interval) = raw.pool.sweep_interval {
            self.sweep_interval_ms = units::parse_duration_ms(&interval)
                .map_err(|e| anyhow!("pool.sweep_interval: {e}"))?;
        }
        if let Some(default) = raw.body_size.default {
            self.body_size.default = units::parse_size_bytes(&default)
                .map_err(|e| anyhow!("body_size.default: {e}"))?;
        }
        if let Some(max) = raw.body_size.max {
            self.body_size.max =
                units::parse_size_bytes(&max).map_err(|e| anyhow!("body_size.max: {e}"))?;
        }
        if let Some(max_timeout) = raw.caps.max_timeout {
            self.caps.max_timeout_ms = units::parse_duration_ms(&max_timeout)
                .map_err(|e| anyhow!("caps.max_timeout: {e}"))?;
        }
        if let Some(max_ttl) = raw.caps.max_ttl {
            self.caps.max_ttl_ms =
                units::parse_duration_ms(&max_ttl).map_err(|e| anyhow!("caps.max_ttl: {e}"))?;
        }
        self.vhosts = raw.vhosts;
        self.shell_plugin = raw.shell.plugin;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(dirs) = env::var("WORKER_DIRS") {
            self.worker_dirs = split_dirs(&dirs);
        }
        if let Ok(dirs) = env::var("PLUGIN_DIRS") {
            self.plugin_dirs = split_dirs(&dirs);
        }
        if let Ok(size) = env::var("POOL_SIZE") {
            self.pool_size = size
                .parse()
                .map_err(|_| anyhow!("invalid POOL_SIZE: {size}"))?;
        }
        if let Ok(app) = env::var("HOMEPAGE_APP") {
            if !app.is_empty() {
                self.homepage_app = Some(app);
            }
        }
        if let Ok(port) = env::var("PORT") {
            self.port = port.parse().map_err(|_| anyhow!("invalid PORT: {port}"))?;
        }
        if let Ok(node_env) = env::var("NODE_ENV") {
            if !node_env.is_empty() {
                self.env = node_env;
            }
        }
        if let Ok(key) = env::var("ROOT_KEY") {
            if !key.is_empty() {
                self.root_key = Some(key);
            }
        }
        if let Ok(url) = env::var("LIBSQL_URL") {
            if !url.is_empty() {
                self.libsql_url = Some(url);
            }
        }
        if let Ok(token) = env::var("LIBSQL_AUTH_TOKEN") {
            if !token.is_empty() {
                self.libsql_auth_token = Some(token);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.worker_dirs.is_empty() {
            bail!("WORKER_DIRS is required: no worker directories configured");
        }
        if self.pool_size == 0 {
            bail!("pool size cannot be 0");
        }
        if self.port == 0 {
            bail!("port must be between 1 and 65535");
        }
        if self.body_size.default > self.body_size.max {
            bail!(
                "body_size.default ({}) exceeds body_size.max ({})",
                self.body_size.default,
                self.body_size.max
            );
        }
        if self.sweep_interval_ms == 0 {
            bail!("pool.sweep_interval cannot be 0");
        }
        Ok(())
    }
}

fn split_dirs(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Who may reach a worker app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Routable by anyone
    Public,
    /// Requires an authenticated identity
    Protected,
    /// Only reachable on trusted transport
    Internal,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Public
    }
}

/// Raw worker manifest as written by app authors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerManifest {
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub timeout: Option<Value>,
    #[serde(default)]
    pub idle_timeout: Option<Value>,
    #[serde(default)]
    pub ttl: Option<Value>,
    #[serde(default)]
    pub max_body_size: Option<Value>,
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub auto_install: Option<bool>,
    #[serde(default)]
    pub low_memory: Option<bool>,
    #[serde(default)]
    pub inject_base: Option<bool>,
    #[serde(default)]
    pub public_routes: Option<PublicRoutesSpec>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// `publicRoutes` accepts a bare array (all methods) or a method-keyed map.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PublicRoutesSpec {
    List(Vec<String>),
    ByMethod(BTreeMap<String, Vec<String>>),
}

const METHOD_KEYS: &[&str] = &[
    "ALL", "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS",
];

/// Compiled public-route matcher. Keyed form uses union semantics: a path is
/// public for a method when it matches the `ALL` set or the method's set.
#[derive(Debug, Clone, Default)]
pub struct PublicRoutes {
    all: GlobSet,
    by_method: HashMap<String, GlobSet>,
}

impl PublicRoutes {
    pub fn compile(spec: &PublicRoutesSpec) -> anyhow::Result<Self> {
        match spec {
            PublicRoutesSpec::List(patterns) => Ok(Self {
                all: GlobSet::compile(patterns).map_err(|e| anyhow!("publicRoutes: {e}"))?,
                by_method: HashMap::new(),
            }),
            PublicRoutesSpec::ByMethod(map) => {
                let mut all = GlobSet::default();
                let mut by_method = HashMap::new();
                for (key, patterns) in map {
                    let upper = key.to_ascii_uppercase();
                    if !METHOD_KEYS.contains(&upper.as_str()) {
                        bail!("publicRoutes: unknown method key {key:?}");
                    }
                    let set = GlobSet::compile(patterns)
                        .map_err(|e| anyhow!("publicRoutes.{key}: {e}"))?;
                    if upper == "ALL" {
                        all = set;
                    } else {
                        by_method.insert(upper, set);
                    }
                }
                Ok(Self { all, by_method })
            }
        }
    }

    pub fn is_public(&self, path: &str, method: &str) -> bool {
        if self.all.matches(path) {
            return true;
        }
        self.by_method
            .get(&method.to_ascii_uppercase())
            .map(|set| set.matches(path))
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty() && self.by_method.is_empty()
    }
}

/// Normalized, immutable worker configuration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerConfig {
    pub entrypoint: String,
    pub timeout_ms: u64,
    pub idle_timeout_ms: u64,
    /// 0 = ephemeral: the worker terminates after each request
    pub ttl_ms: u64,
    /// 0 = unlimited
    pub max_requests: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_size: Option<u64>,
    pub auto_install: bool,
    pub low_memory: bool,
    pub inject_base: bool,
    pub visibility: Visibility,
    pub env: BTreeMap<String, String>,
    #[serde(skip)]
    pub public_routes: PublicRoutes,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            entrypoint: "index.ts".to_string(),
            timeout_ms: 30_000,
            idle_timeout_ms: 5 * 60_000,
            ttl_ms: 0,
            max_requests: 0,
            max_body_size: None,
            auto_install: false,
            low_memory: false,
            inject_base: true,
            visibility: Visibility::Public,
            env: BTreeMap::new(),
            public_routes: PublicRoutes::default(),
        }
    }
}

impl WorkerConfig {
    /// Normalize a raw manifest against the runtime's caps.
    ///
    /// Hard errors: `ttl < timeout` or `idleTimeout < timeout` when a ttl is
    /// set. Clamps (warn only): `idleTimeout > ttl`, durations beyond the
    /// global caps, `maxBodySize` beyond the global maximum.
    pub fn from_manifest(
        manifest: &WorkerManifest,
        body_size: &BodySizeConfig,
        caps: &GlobalCaps,
    ) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let mut timeout_ms = match &manifest.timeout {
            Some(v) => units::parse_duration_ms(v).map_err(|e| anyhow!("timeout: {e}"))?,
            None => defaults.timeout_ms,
        };
        if timeout_ms == 0 {
            bail!("timeout cannot be 0");
        }
        if timeout_ms > caps.max_timeout_ms {
            tracing::warn!(
                timeout_ms,
                cap = caps.max_timeout_ms,
                "timeout exceeds the global cap, clamping"
            );
            timeout_ms = caps.max_timeout_ms;
        }

        let mut idle_timeout_ms = match &manifest.idle_timeout {
            Some(v) => units::parse_duration_ms(v).map_err(|e| anyhow!("idleTimeout: {e}"))?,
            None => defaults.idle_timeout_ms,
        };

        let mut ttl_ms = match &manifest.ttl {
            Some(v) => units::parse_duration_ms(v).map_err(|e| anyhow!("ttl: {e}"))?,
            None => defaults.ttl_ms,
        };
        if ttl_ms > caps.max_ttl_ms {
            tracing::warn!(ttl_ms, cap = caps.max_ttl_ms, "ttl exceeds the global cap, clamping");
            ttl_ms = caps.max_ttl_ms;
        }

        if ttl_ms > 0 {
            if ttl_ms < timeout_ms {
                bail!("ttl must be ≥ timeout ({ttl_ms}ms < {timeout_ms}ms)");
            }
            if idle_timeout_ms < timeout_ms {
                bail!("idleTimeout must be ≥ timeout ({idle_timeout_ms}ms < {timeout_ms}ms)");
            }
            if idle_timeout_ms > ttl_ms {
                tracing::warn!(
                    idle_timeout_ms,
                    ttl_ms,
                    "idleTimeout exceeds ttl, clamping to ttl"
                );
                idle_timeout_ms = ttl_ms;
            }
        }

        let max_body_size = match &manifest.max_body_size {
            Some(v) => {
                let requested =
                    units::parse_size_bytes(v).map_err(|e| anyhow!("maxBodySize: {e}"))?;
                if requested > body_size.max {
                    tracing::warn!(
                        requested,
                        cap = body_size.max,
                        "maxBodySize exceeds the global cap, clamping"
                    );
                    Some(body_size.max)
                } else {
                    Some(requested)
                }
            }
            None => None,
        };

        let public_routes = match &manifest.public_routes {
            Some(spec) => PublicRoutes::compile(spec)?,
            None => PublicRoutes::default(),
        };

        Ok(Self {
            entrypoint: manifest
                .entrypoint
                .clone()
                .unwrap_or(defaults.entrypoint),
            timeout_ms,
            idle_timeout_ms,
            ttl_ms,
            max_requests: manifest.max_requests.unwrap_or(defaults.max_requests),
            max_body_size,
            auto_install: manifest.auto_install.unwrap_or(defaults.auto_install),
            low_memory: manifest.low_memory.unwrap_or(defaults.low_memory),
            inject_base: manifest.inject_base.unwrap_or(defaults.inject_base),
            visibility: manifest.visibility.unwrap_or_default(),
            env: manifest.env.clone(),
            public_routes,
        })
    }

    /// Load and normalize the manifest for an app directory. A missing
    /// manifest file yields the defaults.
    pub fn load(
        app_dir: &Path,
        body_size: &BodySizeConfig,
        caps: &GlobalCaps,
    ) -> anyhow::Result<Self> {
        match read_manifest_file::<WorkerManifest>(app_dir)? {
            Some(manifest) => Self::from_manifest(&manifest, body_size, caps)
                .with_context(|| format!("invalid manifest in {}", app_dir.display())),
            None => Ok(Self::default()),
        }
    }

    /// Sha-256 over the canonical JSON of the normalized config. Workers are
    /// pooled by `(appDir, fingerprint)` so any config change spawns fresh.
    pub fn fingerprint(&self) -> String {
        let value = serde_json::to_value(self).expect("worker config serializes");
        let canonical = canonical_json(&value);
        let digest = Sha256::digest(canonical.as_bytes());
        hex_encode(&digest)
    }

    /// Effective body limit for this app.
    pub fn effective_body_limit(&self, body_size: &BodySizeConfig) -> u64 {
        self.max_body_size.unwrap_or(body_size.default)
    }
}

/// Plugin manifest; unrecognized keys flow into `config`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub name: String,
    #[serde(default)]
    pub base: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub optional_dependencies: Vec<String>,
    #[serde(default)]
    pub public_routes: Option<PublicRoutesSpec>,
    /// Directory the manifest was discovered in; resolves served-app paths
    #[serde(skip)]
    pub dir: PathBuf,
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl PluginManifest {
    /// Compiled public routes for this plugin.
    pub fn compiled_public_routes(&self) -> anyhow::Result<PublicRoutes> {
        match &self.public_routes {
            Some(spec) => PublicRoutes::compile(spec),
            None => Ok(PublicRoutes::default()),
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

fn default_true() -> bool {
    true
}

/// Scan the plugin directories for enabled plugin manifests.
pub fn discover_plugin_manifests(plugin_dirs: &[PathBuf]) -> anyhow::Result<Vec<PluginManifest>> {
    let mut manifests = Vec::new();
    for dir in plugin_dirs {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(anyhow!("reading plugin dir {}: {e}", dir.display())),
        };
        for entry in entries {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            if let Some(mut manifest) = read_manifest_file::<PluginManifest>(&path)? {
                manifest.dir = path;
                if manifest.enabled {
                    manifests.push(manifest);
                } else {
                    tracing::debug!(name = %manifest.name, "plugin disabled by manifest");
                }
            }
        }
    }
    Ok(manifests)
}

/// Read `manifest.yaml|yml|json` from a directory.
fn read_manifest_file<T: serde::de::DeserializeOwned>(dir: &Path) -> anyhow::Result<Option<T>> {
    for name in ["manifest.yaml", "manifest.yml", "manifest.json"] {
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed = if name.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?
        };
        return Ok(Some(parsed));
    }
    Ok(None)
}

/// Resolve an app name to its directory. Names never traverse outside the
/// worker roots.
pub fn resolve_app_dir(worker_dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return None;
    }
    worker_dirs
        .iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_dir())
}

/// Deterministic JSON rendering: object keys sorted, no whitespace.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).expect("key serializes"),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).expect("scalar serializes"),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn body_size() -> BodySizeConfig {
        BodySizeConfig {
            default: 10 * 1024 * 1024,
            max: 100 * 1024 * 1024,
        }
    }

    fn caps() -> GlobalCaps {
        GlobalCaps {
            max_timeout_ms: 5 * 60 * 1000,
            max_ttl_ms: 7 * 86_400 * 1000,
        }
    }

    fn manifest(value: serde_json::Value) -> WorkerManifest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn valid_ttl_relationship_is_accepted() {
        let config = WorkerConfig::from_manifest(
            &manifest(json!({"ttl": "1h", "timeout": "30s", "idleTimeout": "2m"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        assert_eq!(config.ttl_ms, 3_600_000);
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.idle_timeout_ms, 120_000);
    }

    #[test]
    fn idle_timeout_below_timeout_is_rejected() {
        let err = WorkerConfig::from_manifest(
            &manifest(json!({"ttl": "1h", "timeout": "2m", "idleTimeout": "30s"})),
            &body_size(),
            &caps(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("idleTimeout must be ≥ timeout"));
    }

    #[test]
    fn ttl_below_timeout_is_rejected() {
        let err = WorkerConfig::from_manifest(
            &manifest(json!({"ttl": "10s", "timeout": "30s", "idleTimeout": "1m"})),
            &body_size(),
            &caps(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("ttl must be ≥ timeout"));
    }

    #[test]
    fn idle_timeout_above_ttl_is_clamped() {
        let config = WorkerConfig::from_manifest(
            &manifest(json!({"ttl": "1m", "timeout": "10s", "idleTimeout": "1h"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        assert_eq!(config.idle_timeout_ms, config.ttl_ms);
    }

    #[test]
    fn zero_ttl_skips_relationship_checks() {
        let config = WorkerConfig::from_manifest(
            &manifest(json!({"ttl": 0, "timeout": "2m", "idleTimeout": "30s"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        assert_eq!(config.ttl_ms, 0);
    }

    #[test]
    fn max_body_size_is_clamped_to_global_cap() {
        let config = WorkerConfig::from_manifest(
            &manifest(json!({"maxBodySize": "1gb"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        assert_eq!(config.max_body_size, Some(100 * 1024 * 1024));
    }

    #[test]
    fn missing_manifest_fields_take_defaults() {
        let config =
            WorkerConfig::from_manifest(&manifest(json!({})), &body_size(), &caps()).unwrap();
        assert_eq!(config.entrypoint, "index.ts");
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.visibility, Visibility::Public);
        assert_eq!(config.effective_body_limit(&body_size()), 10 * 1024 * 1024);
    }

    #[test]
    fn fingerprint_changes_with_config() {
        let a = WorkerConfig::from_manifest(
            &manifest(json!({"timeout": "30s"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        let b = WorkerConfig::from_manifest(
            &manifest(json!({"timeout": "31s"})),
            &body_size(),
            &caps(),
        )
        .unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), a.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn fingerprint_ignores_field_order() {
        let value = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let reordered = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json(&value), canonical_json(&reordered));
    }

    #[test]
    fn public_routes_list_applies_to_all_methods() {
        let routes =
            PublicRoutes::compile(&PublicRoutesSpec::List(vec!["/login".into(), "/pub/**".into()]))
                .unwrap();
        assert!(routes.is_public("/login", "GET"));
        assert!(routes.is_public("/login", "POST"));
        assert!(routes.is_public("/pub/a/b", "DELETE"));
        assert!(!routes.is_public("/private", "GET"));
    }

    #[test]
    fn public_routes_keyed_form_is_a_union() {
        let spec: PublicRoutesSpec = serde_json::from_value(json!({
            "ALL": ["/health"],
            "GET": ["/docs/**"],
            "post": ["/webhooks/*"]
        }))
        .unwrap();
        let routes = PublicRoutes::compile(&spec).unwrap();
        assert!(routes.is_public("/health", "GET"));
        assert!(routes.is_public("/health", "PUT"));
        assert!(routes.is_public("/docs/api", "GET"));
        assert!(!routes.is_public("/docs/api", "POST"));
        assert!(routes.is_public("/webhooks/stripe", "POST"));
    }

    #[test]
    fn unknown_method_key_is_rejected() {
        let spec: PublicRoutesSpec =
            serde_json::from_value(json!({"FETCH": ["/x"]})).unwrap();
        assert!(PublicRoutes::compile(&spec).is_err());
    }

    #[test]
    fn app_names_cannot_traverse() {
        let dirs = vec![PathBuf::from("/nonexistent")];
        assert!(resolve_app_dir(&dirs, "..").is_none());
        assert!(resolve_app_dir(&dirs, "a/b").is_none());
        assert!(resolve_app_dir(&dirs, "").is_none());
    }

    #[test]
    fn runtime_config_rejects_missing_worker_dirs() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn worker_manifest_parses_from_yaml() {
        let yaml = r#"
entrypoint: server.ts
timeout: 45s
maxBodySize: 25mb
publicRoutes:
  - /login
  - /assets/**
env:
  MODE: live
visibility: protected
"#;
        let parsed: WorkerManifest = serde_yaml::from_str(yaml).unwrap();
        let config = WorkerConfig::from_manifest(&parsed, &body_size(), &caps()).unwrap();
        assert_eq!(config.entrypoint, "server.ts");
        assert_eq!(config.timeout_ms, 45_000);
        assert_eq!(config.max_body_size, Some(25 * 1024 * 1024));
        assert_eq!(config.visibility, Visibility::Protected);
        assert!(config.public_routes.is_public("/assets/app.js", "GET"));
        assert_eq!(config.env.get("MODE").unwrap(), "live");
    }

    #[test]
    fn plugin_manifest_collects_extra_keys_as_config() {
        let yaml = r#"
name: authz
base: /authz
dependencies: [authn]
defaultEffect: deny
excludePaths:
  - ^/health$
"#;
        let manifest: PluginManifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.name, "authz");
        assert_eq!(manifest.base.as_deref(), Some("/authz"));
        assert!(manifest.enabled);
        assert_eq!(manifest.dependencies, vec!["authn"]);
        assert_eq!(manifest.config.get("defaultEffect").unwrap(), "deny");
    }
}
