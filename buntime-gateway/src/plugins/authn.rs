//! # Authentication Plugin
//!
//! Establishes the caller's identity for the rest of the pipeline. The
//! contract downstream plugins rely on is simple: after this hook runs, an
//! `X-Identity` header is present iff the caller is authenticated, and its
//! JSON payload can be trusted.
//!
//! Identity sources, in order:
//! - an upstream-injected `X-Identity` header, honored only on trusted
//!   transport (`X-Buntime-Internal`), stripped otherwise so clients cannot
//!   spoof it;
//! - the bootstrap `ROOT_KEY` presented as a bearer token, which yields the
//!   root admin identity.
//!
//! Publishes the `identity` service other plugins use to parse the header
//! back into a [`Subject`].

use crate::config::{PluginManifest, RuntimeConfig};
use crate::headers::{X_BUNTIME_INTERNAL, X_IDENTITY};
use crate::plugins::{HookOutcome, HookSet, Plugin, PluginDescriptor};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, Request};
use buntime_core::error::AppError;
use buntime_core::policy::Subject;
use std::any::Any;
use std::sync::Arc;

/// Parses `X-Identity` headers into subjects. Published as the `identity`
/// service.
#[derive(Debug, Default)]
pub struct IdentityService;

impl IdentityService {
    pub fn parse(&self, headers: &HeaderMap) -> Option<Subject> {
        let raw = headers.get(X_IDENTITY)?.to_str().ok()?;
        match serde_json::from_str(raw) {
            Ok(subject) => Some(subject),
            Err(e) => {
                tracing::warn!("unparseable identity header: {e}");
                None
            }
        }
    }
}

pub struct AuthnPlugin {
    manifest: PluginManifest,
    root_key: Option<String>,
    service: Arc<IdentityService>,
}

impl AuthnPlugin {
    pub fn from_manifest(
        manifest: &PluginManifest,
        runtime: &RuntimeConfig,
    ) -> anyhow::Result<Self> {
        // a manifest-level key wins over the environment bootstrap key
        let root_key = manifest
            .config_str("rootKey")
            .map(str::to_string)
            .or_else(|| runtime.root_key.clone());
        if root_key.is_none() {
            tracing::warn!("authn: no root key configured, bootstrap login disabled");
        }
        Ok(Self {
            manifest: manifest.clone(),
            root_key,
            service: Arc::new(IdentityService),
        })
    }

    fn root_subject() -> Subject {
        Subject {
            id: Some("root".to_string()),
            roles: vec!["admin".to_string()],
            groups: Vec::new(),
            claims: serde_json::Map::new(),
        }
    }
}

#[async_trait]
impl Plugin for AuthnPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = PluginDescriptor::named("authn");
        descriptor.base = self.manifest.base.clone();
        descriptor.public_routes = self
            .manifest
            .compiled_public_routes()
            .unwrap_or_default();
        descriptor.hooks = HookSet {
            on_request: true,
            ..HookSet::default()
        };
        descriptor
    }

    async fn on_request(&self, mut req: Request<Body>) -> Result<HookOutcome, AppError> {
        let trusted = req.headers().contains_key(X_BUNTIME_INTERNAL);
        if !trusted && req.headers().contains_key(X_IDENTITY) {
            tracing::debug!("stripping client-supplied identity header");
            req.headers_mut().remove(X_IDENTITY);
        }

        if let Some(root_key) = &self.root_key {
            let presented = req
                .headers()
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "));
            if presented == Some(root_key.as_str()) {
                let identity = serde_json::to_string(&Self::root_subject())
                    .map_err(|e| AppError::internal(format!("identity encode: {e}")))?;
                let value = HeaderValue::from_str(&identity)
                    .map_err(|e| AppError::internal(format!("identity header: {e}")))?;
                req.headers_mut().insert(X_IDENTITY, value);
            }
        }

        Ok(HookOutcome::Continue(req))
    }

    fn service(&self) -> Option<(String, Arc<dyn Any + Send + Sync>)> {
        Some((
            "identity".to_string(),
            self.service.clone() as Arc<dyn Any + Send + Sync>,
        ))
    }
}
