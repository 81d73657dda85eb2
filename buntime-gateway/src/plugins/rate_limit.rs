//! # Rate-Limit Plugin
//!
//! Admission control in front of everything else: one token-bucket per
//! client key. Denials carry `RATE_LIMITED` with a `retryAfter` hint and a
//! `Retry-After` header. The plugin's own public routes are exempt.

use crate::config::PluginManifest;
use crate::plugins::{HookOutcome, HookSet, Plugin, PluginDescriptor, ServiceRegistry};
use crate::runtime_error::RuntimeError;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::IntoResponse;
use buntime_core::error::{AppError, ErrorKind};
use buntime_core::ratelimit::RateLimiter;
use buntime_core::units;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What identifies a client for limiting purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    Ip,
    Identity,
}

pub struct RateLimitPlugin {
    manifest: PluginManifest,
    limiter: Arc<RateLimiter>,
    key_source: KeySource,
    public_routes: crate::config::PublicRoutes,
    sweep_interval: Duration,
    sweeper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RateLimitPlugin {
    pub fn from_manifest(manifest: &PluginManifest) -> anyhow::Result<Self> {
        let capacity = manifest
            .config
            .get("capacity")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(100) as u32;
        let window = manifest.config_str("window").unwrap_or("1m");
        let window_seconds = units::window_seconds(window)
            .map_err(|e| anyhow::anyhow!("rate-limit: window: {e}"))?;
        let key_source = match manifest.config_str("keyBy") {
            None | Some("ip") => KeySource::Ip,
            Some("identity") => KeySource::Identity,
            Some(other) => anyhow::bail!("rate-limit: unknown keyBy {other:?}"),
        };
        let sweep_interval = match manifest.config_str("sweepInterval") {
            Some(raw) => Duration::from_millis(
                units::parse_duration_str_ms(raw)
                    .map_err(|e| anyhow::anyhow!("rate-limit: sweepInterval: {e}"))?,
            ),
            None => Duration::from_secs(60),
        };

        Ok(Self {
            manifest: manifest.clone(),
            limiter: Arc::new(RateLimiter::new(capacity, window_seconds)),
            key_source,
            public_routes: manifest.compiled_public_routes()?,
            sweep_interval,
            sweeper: Mutex::new(None),
        })
    }

    fn client_key(&self, req: &Request<Body>) -> String {
        match self.key_source {
            KeySource::Ip => req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| format!("ip:{}", v.trim()))
                .unwrap_or_else(|| "ip:unknown".to_string()),
            KeySource::Identity => req
                .headers()
                .get(crate::headers::X_IDENTITY)
                .and_then(|v| v.to_str().ok())
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
                .map(|id| format!("user:{id}"))
                .unwrap_or_else(|| "user:anonymous".to_string()),
        }
    }
}

#[async_trait]
impl Plugin for RateLimitPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = PluginDescriptor::named("rate-limit");
        descriptor.base = self.manifest.base.clone();
        descriptor.public_routes = self.public_routes.clone();
        descriptor.hooks = HookSet {
            on_request: true,
            ..HookSet::default()
        };
        descriptor
    }

    async fn on_init(&self, _services: &ServiceRegistry) -> Result<(), AppError> {
        let limiter = self.limiter.clone();
        let interval = self.sweep_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "rate limiter swept idle buckets");
                }
            }
        });
        *self.sweeper.lock().expect("sweeper handle poisoned") = Some(handle);
        Ok(())
    }

    async fn on_shutdown(&self) -> Result<(), AppError> {
        if let Some(handle) = self.sweeper.lock().expect("sweeper handle poisoned").take() {
            handle.abort();
        }
        Ok(())
    }

    async fn on_request(&self, req: Request<Body>) -> Result<HookOutcome, AppError> {
        let path = req.uri().path();
        if self.public_routes.is_public(path, req.method().as_str()) {
            return Ok(HookOutcome::Continue(req));
        }

        let key = self.client_key(&req);
        let decision = self.limiter.consume(&key);
        if decision.allowed {
            return Ok(HookOutcome::Continue(req));
        }

        tracing::debug!(key = %key, retry_after = decision.retry_after_secs, "rate limited");
        let err = AppError::new(ErrorKind::RateLimited, "too many requests")
            .with_data(json!({"retryAfter": decision.retry_after_secs}));
        let mut response = RuntimeError(err).into_response();
        if let Ok(value) = decision.retry_after_secs.to_string().parse() {
            response.headers_mut().insert("retry-after", value);
        }
        Ok(HookOutcome::Respond(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::Map;

    fn manifest(config: serde_json::Value) -> PluginManifest {
        let config: Map<String, serde_json::Value> =
            config.as_object().cloned().unwrap_or_default();
        PluginManifest {
            name: "rate-limit".to_string(),
            base: None,
            enabled: true,
            dependencies: vec![],
            optional_dependencies: vec![],
            public_routes: None,
            dir: Default::default(),
            config,
        }
    }

    fn request(ip: &str) -> Request<Body> {
        Request::builder()
            .uri("/api/data")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn sixth_request_is_denied_with_retry_after() {
        let plugin =
            RateLimitPlugin::from_manifest(&manifest(json!({"capacity": 5, "window": "60s"})))
                .unwrap();
        for i in 0..5 {
            let outcome = plugin.on_request(request("1.2.3.4")).await.unwrap();
            assert!(matches!(outcome, HookOutcome::Continue(_)), "request {i}");
        }
        let outcome = plugin.on_request(request("1.2.3.4")).await.unwrap();
        let HookOutcome::Respond(response) = outcome else {
            panic!("sixth request should be denied")
        };
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = response
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0 && retry_after <= 12);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "RATE_LIMITED");
        assert!(body["data"]["retryAfter"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn different_ips_do_not_share_buckets() {
        let plugin =
            RateLimitPlugin::from_manifest(&manifest(json!({"capacity": 1, "window": "1h"})))
                .unwrap();
        assert!(matches!(
            plugin.on_request(request("1.1.1.1")).await.unwrap(),
            HookOutcome::Continue(_)
        ));
        assert!(matches!(
            plugin.on_request(request("2.2.2.2")).await.unwrap(),
            HookOutcome::Continue(_)
        ));
        assert!(matches!(
            plugin.on_request(request("1.1.1.1")).await.unwrap(),
            HookOutcome::Respond(_)
        ));
    }

    #[tokio::test]
    async fn public_routes_are_exempt() {
        let mut m = manifest(json!({"capacity": 1, "window": "1h"}));
        m.public_routes = Some(crate::config::PublicRoutesSpec::List(vec![
            "/api/data".to_string()
        ]));
        let plugin = RateLimitPlugin::from_manifest(&m).unwrap();
        for _ in 0..10 {
            assert!(matches!(
                plugin.on_request(request("9.9.9.9")).await.unwrap(),
                HookOutcome::Continue(_)
            ));
        }
    }

    #[test]
    fn bad_window_is_rejected() {
        assert!(RateLimitPlugin::from_manifest(&manifest(json!({"window": "soon"}))).is_err());
    }
}
