//! # Shell Plugin
//!
//! Publishes the worker app that renders chrome and navigation. The
//! dispatcher consults the configured shell plugin for two cases: top-level
//! navigations onto claimed paths (served with `x-base` and
//! `x-fragment-route`) and 404 fall-through (`x-not-found`). The plugin
//! itself only contributes the served app and its base; the interception
//! logic is the dispatcher's.

use crate::config::PluginManifest;
use crate::plugins::{Plugin, PluginDescriptor};
use async_trait::async_trait;
use std::path::PathBuf;

pub struct ShellPlugin {
    manifest: PluginManifest,
    app_dir: PathBuf,
}

impl ShellPlugin {
    pub fn from_manifest(manifest: &PluginManifest) -> anyhow::Result<Self> {
        if manifest.base.is_none() {
            anyhow::bail!("shell: a base path is required");
        }
        // app directory relative to the plugin directory unless absolute
        let app = manifest.config_str("app").unwrap_or("app");
        let app_dir = {
            let candidate = PathBuf::from(app);
            if candidate.is_absolute() {
                candidate
            } else {
                manifest.dir.join(candidate)
            }
        };
        Ok(Self {
            manifest: manifest.clone(),
            app_dir,
        })
    }
}

#[async_trait]
impl Plugin for ShellPlugin {
    fn descriptor(&self) -> PluginDescriptor {
        let mut descriptor = PluginDescriptor::named("shell");
        descriptor.base = self.manifest.base.clone();
        descriptor.served_app = Some(self.app_dir.clone());
        descriptor.public_routes = self
            .manifest
            .compiled_public_routes()
            .unwrap_or_default();
        descriptor
    }
}
