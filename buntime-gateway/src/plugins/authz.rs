//! # Authorization Plugin
//!
//! The policy enforcement point plus the admin surface over the PAP/PDP.
//!
//! Every request passing the `on_request` hook is evaluated against the
//! policy store: the subject comes from the `X-Identity` header (parsed via
//! the authn plugin's `identity` service), the resource from the request
//! path, the action from the method. A deny short-circuits the pipeline
//! with a 403 and the offending policy id; configured exclude paths bypass
//! evaluation entirely.
//!
//! The admin API lives under the plugin base:
//!
//! - `GET    /api/policies` — list
//! - `GET    /api/policies/{id}` — fetch one
//! - `POST   /api/policies` — create or update (requires `id`, `effect`,
//!   `subjects`, `resources`, `actions`)
//! - `DELETE /api/policies/{id}` — remove
//! - `POST   /api/evaluate` — context → decision
//! - `POST   /api/explain` — context → context + decision + policy snapshot

use crate::config::{PluginManifest, RuntimeConfig};
use crate::headers::X_IDENTITY;
use crate::plugins::authn::IdentityService;
use crate::plugins::{HookOutcome, HookSet, Plugin, PluginDescriptor, ServiceRegistry};
use crate::runtime_error::RuntimeError;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use buntime_core::error::AppError;
use buntime_core::policy::{
    evaluate, CombiningAlgorithm, Decision, Effect, EvaluationContext, Policy, PolicyStore,
    SeedOptions, Subject,
};
use regex::Regex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Policy store plus evaluation settings; published as the `authz` service.
pub struct AuthzService {
    store: PolicyStore,
    algorithm: CombiningAlgorithm,
    default_effect: Effect,
}

impl AuthzService {
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }

    pub fn evaluate(&self, ctx: &EvaluationContext) -> Decision {
        evaluate(ctx, &self.store.snapshot(), self.algorithm, self.default_effect)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedConfig {
    #[serde(default)]
    only_if_empty: bool,
    #[serde(default)]
    environments: Vec<String>,
    #[serde(default)]
    policies: Vec<Policy>,
}

pub struct AuthzPlugin {
    manifest: PluginManifest,
    service: Arc<AuthzService>,
    exclude: Vec<Regex>,
    policy_file: Option<PathBuf>,
    seed: Option<SeedConfig>,
    runtime_env: String,
    identity: OnceLock<Arc<IdentityService>>,
}

impl AuthzPlugin {
    pub fn from_manifest(
        manifest: &PluginManifest,
        runtime: &RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let default_effect = match manifest.config_str("defaultEffect") {
            None | Some("deny") => Effect::Deny,
            Some("permit") => Effect::Permit,
            Some(other) => anyhow::bail!("authz: invalid defaultEffect {other:?}"),
        };
        let algorithm = match manifest.config_str("algorithm") {
            None => CombiningAlgorithm::DenyOverrides,
            Some(name) => serde_json::from_value(Value::String(name.to_string()))
                .map_err(|_| anyhow::anyhow!("authz: unknown algorithm {name:?}"))?,
        };

        let exclude = match manifest.config.get("excludePaths") {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    let pattern = item
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("authz: excludePaths entries must be strings"))?;
                    Regex::new(pattern)
                        .map_err(|e| anyhow::anyhow!("authz: bad exclude pattern {pattern:?}: {e}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(_) => anyhow::bail!("authz: excludePaths must be an array"),
        };

        let policy_file = manifest.config_str("policyFile").map(PathBuf::from);
        let store = match &policy_file {
            Some(path) => PolicyStore::with_mirror(path.clone()),
            None => PolicyStore::new(),
        };

        let seed = match manifest.config.get("seed") {
            None => None,
            Some(value) => Some(
                serde_json::from_value(value.clone())
                    .map_err(|e| anyhow::anyhow!("authz: invalid seed config: {e}"))?,
            ),
        };

        Ok(Self {
            manifest: manifest.clone(),
            service: Arc::new(AuthzService {
                store,
                algorithm,
                default_effect,
            }),
            exclude,
            policy_file,
            seed,
            runtime_env: runtime.env.clone(),
            identity: OnceLock::new(),
        })
    }

    pub fn service_handle(&self) -> Arc<AuthzService> {
        self.service.clone()
    }

    fn excluded(&self, path: &str) -> bool {
        self.exclude.iter().any(|re| re.is_match(path))
    }

    fn build_context(&self, req: &Request<Body>) -> EvaluationContext {
        let subject = self
            .identity
            .get()
            .and_then(|svc| svc.parse(req.headers()))
            .or_else(|| {
                // without authn in front, still honor the raw header shape
                req.headers()
                    .get(X_IDENTITY)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|raw| serde_json::from_str::<Subject>(raw).ok())
            })
            .unwrap_or_default();

        let path = req.uri().path().to_string();
        let app = path
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let ip = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .or_else(|| {
                req.headers()
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        let user_agent = req
            .headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        EvaluationContext {
            subject,
            resource: buntime_core::policy::Resource {
                app,
                path,
                resource_type: None,
            },
            action: buntime_core::policy::Action {
                method: req.method().as_str().to_string(),
                operation: None,
            },
            environment: buntime_core::policy::Environment {
                ip,
                time: None,
                user_agent,
            },
        }
    }
}

#[async_trait]
impl Plugin for AuthzPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = PluginDescriptor::named("authz");
        descriptor.dependencies = vec!["authn".to_string()];
        descriptor.base = Some(
            self.manifest
                .base
                .clone()
                .unwrap_or_else(|| "/authz".to_string()),
        );
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

    async fn on_init(&self, services: &ServiceRegistry) -> Result<(), AppError> {
        if let Some(identity) = services.get_as::<IdentityService>("identity") {
            let _ = self.identity.set(identity);
        }

        if let Some(path) = &self.policy_file {
            if path.is_file() {
                let count = self
                    .service
                    .store
                    .load(path)
                    .map_err(|e| AppError::internal(format!("authz: policy file: {e}")))?;
                tracing::info!(count, path = %path.display(), "loaded policy file");
            }
        }

        if let Some(seed) = &self.seed {
            let options = SeedOptions {
                only_if_empty: seed.only_if_empty,
                environments: seed.environments.clone(),
            };
            self.service
                .store
                .seed(seed.policies.clone(), &options, &self.runtime_env);
        }
        Ok(())
    }

    async fn on_request(&self, req: Request<Body>) -> Result<HookOutcome, AppError> {
        if self.excluded(req.uri().path()) {
            return Ok(HookOutcome::Continue(req));
        }

        let ctx = self.build_context(&req);
        let decision = self.service.evaluate(&ctx);
        if decision.permitted() {
            return Ok(HookOutcome::Continue(req));
        }

        tracing::info!(
            path = %ctx.resource.path,
            policy = decision.matched_policy.as_deref().unwrap_or("-"),
            "request denied by policy"
        );
        let body = json!({
            "error": "Forbidden",
            "reason": decision.reason,
            "policy": decision.matched_policy,
        });
        Ok(HookOutcome::Respond(
            (StatusCode::FORBIDDEN, Json(body)).into_response(),
        ))
    }

    fn routes(&self) -> Option<Router> {
        let router = Router::new()
            .route("/api/policies", get(list_policies).post(upsert_policy))
            .route(
                "/api/policies/{id}",
                get(get_policy).delete(delete_policy),
            )
            .route("/api/evaluate", post(evaluate_context))
            .route("/api/explain", post(explain_context))
            .with_state(self.service.clone());
        Some(router)
    }

    fn service(&self) -> Option<(String, Arc<dyn std::any::Any + Send + Sync>)> {
        Some((
            "authz".to_string(),
            self.service.clone() as Arc<dyn std::any::Any + Send + Sync>,
        ))
    }
}

async fn list_policies(State(service): State<Arc<AuthzService>>) -> Json<Vec<Policy>> {
    Json(service.store.list())
}

async fn get_policy(
    State(service): State<Arc<AuthzService>>,
    Path(id): Path<String>,
) -> Response {
    match service.store.get(&id) {
        Some(policy) => Json(policy).into_response(),
        None => RuntimeError::not_found(format!("no policy with id {id:?}")).into_response(),
    }
}

const REQUIRED_POLICY_FIELDS: &[&str] = &["id", "effect", "subjects", "resources", "actions"];

async fn upsert_policy(
    State(service): State<Arc<AuthzService>>,
    Json(body): Json<Value>,
) -> Response {
    let missing: Vec<&str> = REQUIRED_POLICY_FIELDS
        .iter()
        .filter(|field| body.get(**field).is_none())
        .copied()
        .collect();
    if !missing.is_empty() {
        return RuntimeError::validation(format!(
            "policy is missing required fields: {}",
            missing.join(", ")
        ))
        .into_response();
    }

    let policy: Policy = match serde_json::from_value(body) {
        Ok(policy) => policy,
        Err(e) => {
            return RuntimeError::validation(format!("invalid policy: {e}")).into_response()
        }
    };

    let replaced = service.store.upsert(policy.clone());
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    (status, Json(policy)).into_response()
}

async fn delete_policy(
    State(service): State<Arc<AuthzService>>,
    Path(id): Path<String>,
) -> Response {
    if service.store.delete(&id) {
        Json(json!({"success": true, "deleted": id})).into_response()
    } else {
        RuntimeError::not_found(format!("no policy with id {id:?}")).into_response()
    }
}

async fn evaluate_context(
    State(service): State<Arc<AuthzService>>,
    Json(ctx): Json<EvaluationContext>,
) -> Json<Decision> {
    Json(service.evaluate(&ctx))
}

async fn explain_context(
    State(service): State<Arc<AuthzService>>,
    Json(ctx): Json<EvaluationContext>,
) -> Json<Value> {
    let decision = service.evaluate(&ctx);
    Json(json!({
        "context": ctx,
        "decision": decision,
        "policies": service.store.snapshot(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn manifest_with(config: Value) -> PluginManifest {
        let config: Map<String, Value> = config.as_object().cloned().unwrap_or_default();
        PluginManifest {
            name: "authz".to_string(),
            base: Some("/authz".to_string()),
            enabled: true,
            dependencies: vec!["authn".to_string()],
            optional_dependencies: vec![],
            public_routes: None,
            dir: Default::default(),
            config,
        }
    }

    fn plugin_with(config: Value) -> AuthzPlugin {
        AuthzPlugin::from_manifest(&manifest_with(config), &RuntimeConfig::default()).unwrap()
    }

    fn get_request(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn deny_all_yields_403_with_policy_id() {
        let plugin = plugin_with(json!({
            "seed": {
                "environments": ["*"],
                "policies": [{
                    "id": "deny-all",
                    "effect": "deny",
                    "resources": [{"path": "*"}],
                    "actions": [{"method": "*"}]
                }]
            }
        }));
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();

        let outcome = plugin.on_request(get_request("/api/test")).await.unwrap();
        let HookOutcome::Respond(response) = outcome else {
            panic!("expected a deny response")
        };
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Forbidden");
        assert_eq!(body["policy"], "deny-all");
    }

    #[tokio::test]
    async fn exclude_paths_bypass_evaluation() {
        let plugin = plugin_with(json!({
            "excludePaths": ["^/health$"],
            "seed": {
                "environments": ["*"],
                "policies": [{
                    "id": "deny-all",
                    "effect": "deny",
                    "resources": [{"path": "*"}],
                    "actions": [{"method": "*"}]
                }]
            }
        }));
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();

        let outcome = plugin.on_request(get_request("/health")).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Continue(_)));
        let outcome = plugin.on_request(get_request("/healthy")).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Respond(_)));
    }

    #[tokio::test]
    async fn permit_policy_lets_subject_through() {
        let plugin = plugin_with(json!({
            "algorithm": "permit-overrides",
            "seed": {
                "environments": ["*"],
                "policies": [
                    {"id": "deny-all", "effect": "deny",
                     "resources": [{"path": "*"}], "actions": [{"method": "*"}]},
                    {"id": "permit-admin", "effect": "permit",
                     "subjects": [{"role": "admin"}]}
                ]
            }
        }));
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();

        let mut req = get_request("/api/test");
        req.headers_mut().insert(
            X_IDENTITY,
            r#"{"id":"u1","roles":["admin"]}"#.parse().unwrap(),
        );
        let outcome = plugin.on_request(req).await.unwrap();
        assert!(matches!(outcome, HookOutcome::Continue(_)));
    }

    #[tokio::test]
    async fn seeding_skipped_outside_gated_environments() {
        let plugin = plugin_with(json!({
            "seed": {
                "environments": ["staging"],
                "policies": [{"id": "p", "effect": "deny"}]
            }
        }));
        // runtime env defaults to "development", which is not gated in
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();
        assert!(plugin.service.store.is_empty());
    }

    #[tokio::test]
    async fn admin_routes_crud_round_trip() {
        use tower::util::ServiceExt;

        let plugin = plugin_with(json!({}));
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();
        let router = plugin.routes().unwrap();

        // missing required fields → 400
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/policies")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"id":"p1","effect":"deny"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // full policy → 201
        let policy = json!({
            "id": "p1", "effect": "deny",
            "subjects": [], "resources": [{"path": "*"}], "actions": [{"method": "*"}]
        });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/policies")
                    .header("content-type", "application/json")
                    .body(Body::from(policy.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/policies/p1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/api/policies/p1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/policies/p1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn evaluate_endpoint_returns_decision() {
        use tower::util::ServiceExt;

        let plugin = plugin_with(json!({
            "seed": {
                "environments": ["*"],
                "policies": [{
                    "id": "deny-all", "effect": "deny",
                    "resources": [{"path": "*"}], "actions": [{"method": "*"}]
                }]
            }
        }));
        plugin.on_init(&ServiceRegistry::default()).await.unwrap();
        let router = plugin.routes().unwrap();

        let ctx = json!({
            "subject": {"roles": ["user"]},
            "resource": {"path": "/api/test"},
            "action": {"method": "GET"}
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/evaluate")
                    .header("content-type", "application/json")
                    .body(Body::from(ctx.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let decision: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decision["effect"], "deny");
        assert_eq!(decision["matchedPolicy"], "deny-all");
    }
}
