// src/plugin.rs

//! Plugin hooks run while a feature-pack is materialized
//!
//! A feature-pack names the plugins it needs by id. The caller registers
//! implementations in a [`PluginRegistry`]; staging fails when a declared
//! plugin is not registered.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::resolver::ResolvedFeaturePack;

/// What a plugin sees of the installation being staged
pub struct PluginContext<'a> {
    pub feature_pack: &'a ResolvedFeaturePack,
    /// Options from the provisioning config
    pub options: &'a BTreeMap<String, String>,
    /// Root of the staged installation; plugins write here
    pub staging_dir: &'a Path,
}

pub trait PluginHook: Send + Sync {
    fn id(&self) -> &str;

    /// Run after the feature-pack's package content has been staged
    fn install(&self, context: &PluginContext<'_>) -> Result<()>;
}

#[derive(Default, Clone)]
pub struct PluginRegistry {
    hooks: HashMap<String, Arc<dyn PluginHook>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.hooks.keys().collect();
        ids.sort();
        f.debug_struct("PluginRegistry").field("hooks", &ids).finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, replacing any hook with the same id
    pub fn register(&mut self, hook: Arc<dyn PluginHook>) {
        self.hooks.insert(hook.id().to_string(), hook);
    }

    pub fn with(mut self, hook: Arc<dyn PluginHook>) -> Self {
        self.register(hook);
        self
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn PluginHook>> {
        self.hooks.get(id)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every plugin a feature-pack declares, in declaration order
    pub fn run(&self, context: &PluginContext<'_>) -> Result<()> {
        let fpid = context.feature_pack.fpid();
        for plugin in context.feature_pack.spec.plugins() {
            let hook = self.get(&plugin.id).ok_or_else(|| Error::Plugin {
                plugin: plugin.id.clone(),
                fpid: fpid.to_string(),
                message: "plugin is not registered".to_string(),
            })?;
            debug!("Running plugin {} for {}", plugin.id, fpid);
            hook.install(context).map_err(|e| match e {
                Error::Plugin { .. } => e,
                other => Error::Plugin {
                    plugin: plugin.id.clone(),
                    fpid: fpid.to_string(),
                    message: other.to_string(),
                },
            })?;
        }
        Ok(())
    }
}
