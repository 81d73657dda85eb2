//! # Policy Administration Point
//!
//! In-memory policy set with CRUD, an optional file-backed mirror and gated
//! boot seeding. Readers take a cheap snapshot per evaluation; writers hold
//! the lock only for the mutation itself, so the PDP never observes a
//! half-applied update.

use super::model::Policy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Seeding options applied once at boot.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedOptions {
    /// Skip seeding when the store already holds policies
    #[serde(default)]
    pub only_if_empty: bool,
    /// Environments seeding is allowed to run in; `*` means all
    #[serde(default)]
    pub environments: Vec<String>,
}

/// Policy file shape: either a bare array or `{"policies": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PolicyFile {
    Wrapped { policies: Vec<Policy> },
    Bare(Vec<Policy>),
}

impl PolicyFile {
    fn into_policies(self) -> Vec<Policy> {
        match self {
            PolicyFile::Wrapped { policies } => policies,
            PolicyFile::Bare(policies) => policies,
        }
    }
}

/// The policy store behind the authz plugin's admin surface.
#[derive(Debug, Default)]
pub struct PolicyStore {
    policies: RwLock<Vec<Policy>>,
    mirror: Option<PathBuf>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that mirrors every mutation to `path` as a JSON array.
    pub fn with_mirror(path: impl Into<PathBuf>) -> Self {
        Self {
            policies: RwLock::new(Vec::new()),
            mirror: Some(path.into()),
        }
    }

    /// Consistent snapshot for one evaluation.
    pub fn snapshot(&self) -> Vec<Policy> {
        self.policies.read().expect("policy store poisoned").clone()
    }

    pub fn list(&self) -> Vec<Policy> {
        self.snapshot()
    }

    pub fn get(&self, id: &str) -> Option<Policy> {
        self.policies
            .read()
            .expect("policy store poisoned")
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Insert or replace by id. Returns true when an existing policy was
    /// replaced.
    pub fn upsert(&self, policy: Policy) -> bool {
        let replaced = {
            let mut policies = self.policies.write().expect("policy store poisoned");
            match policies.iter_mut().find(|p| p.id == policy.id) {
                Some(existing) => {
                    *existing = policy;
                    true
                }
                None => {
                    policies.push(policy);
                    false
                }
            }
        };
        self.persist_mirror();
        replaced
    }

    /// Remove by id. Returns true when something was removed.
    pub fn delete(&self, id: &str) -> bool {
        let removed = {
            let mut policies = self.policies.write().expect("policy store poisoned");
            let before = policies.len();
            policies.retain(|p| p.id != id);
            policies.len() != before
        };
        if removed {
            self.persist_mirror();
        }
        removed
    }

    /// Replace the whole set.
    pub fn load_from_array(&self, new_policies: Vec<Policy>) {
        *self.policies.write().expect("policy store poisoned") = new_policies;
        self.persist_mirror();
    }

    pub fn clear(&self) {
        self.policies.write().expect("policy store poisoned").clear();
        self.persist_mirror();
    }

    pub fn len(&self) -> usize {
        self.policies.read().expect("policy store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load a JSON policy file (array or `{policies: [...]}`), replacing the
    /// current set.
    pub fn load(&self, path: &Path) -> anyhow::Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let file: PolicyFile = serde_json::from_str(&content)?;
        let policies = file.into_policies();
        let count = policies.len();
        self.load_from_array(policies);
        Ok(count)
    }

    /// Save the current set to `path` as a JSON array.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let snapshot = self.snapshot();
        let content = serde_json::to_string_pretty(&snapshot)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Seed a bundled policy set at boot.
    ///
    /// Runs only when `current_env` is present in the gated environment list
    /// (or the list contains `*`). With `only_if_empty`, a non-empty store
    /// is left untouched. Returns the number of policies seeded.
    pub fn seed(&self, bundle: Vec<Policy>, options: &SeedOptions, current_env: &str) -> usize {
        let env_allowed = options
            .environments
            .iter()
            .any(|e| e == "*" || e == current_env);
        if !env_allowed {
            tracing::debug!(env = current_env, "policy seeding skipped: environment not gated in");
            return 0;
        }
        if options.only_if_empty && !self.is_empty() {
            tracing::debug!("policy seeding skipped: store is not empty");
            return 0;
        }
        let count = bundle.len();
        for policy in bundle {
            self.upsert(policy);
        }
        tracing::info!(count, "seeded policy store");
        count
    }

    fn persist_mirror(&self) {
        if let Some(path) = &self.mirror {
            if let Err(e) = self.save(path) {
                tracing::error!(path = %path.display(), "failed to mirror policy store: {e}");
            }
        }
    }
}
