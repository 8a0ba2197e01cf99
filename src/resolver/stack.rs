// src/resolver/stack.rs

//! Dependency stack: filtering decisions along the current graph path
//!
//! While the layout builder walks the feature-pack graph, the stack mirrors
//! the path from the root to the feature-pack being processed. Each level
//! holds the dependency configs declared by one feature-pack (the first level
//! holds the root provisioning config's) plus its transitive overrides.
//!
//! # Decision Order
//!
//! For a package or config of producer P:
//!
//! 1. root-wide config filters (config units only)
//! 2. transitive configs for P, outermost level first (an ancestor's
//!    pass-through constraint overrides what descendants declare)
//! 3. regular configs for P, innermost level first
//! 4. nothing decided: included
//!
//! Within one config object an explicit include beats an explicit exclude,
//! which beats model-wide rules, which beat an `inherit = false` flag. An
//! `inherit = false` ends the search: an outer scope cannot re-include.

use std::collections::{BTreeSet, HashMap};

use crate::config::{ConfigFilters, ConfigId, Decision, FeaturePackConfig, ProvisioningConfig};
use crate::location::Producer;

#[derive(Debug, Default)]
struct Level {
    configs: Vec<FeaturePackConfig>,
    transitive: HashMap<Producer, FeaturePackConfig>,
}

impl Level {
    fn add(&mut self, config: FeaturePackConfig) {
        if config.is_transitive() {
            self.transitive.insert(config.producer().clone(), config);
        } else {
            self.configs.push(config);
        }
    }
}

/// Filtering state for the current path through the feature-pack graph
#[derive(Debug)]
pub struct DependencyStack {
    root_filters: ConfigFilters,
    levels: Vec<Level>,
}

impl DependencyStack {
    /// Create an empty stack; root-wide config filters come from `root`
    pub fn new(root: &ProvisioningConfig) -> Self {
        Self {
            root_filters: root.config_filters().clone(),
            levels: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Record a dependency config on the stack
    ///
    /// Returns `false` and leaves the stack unchanged when the config would
    /// add no filter beyond what the stack already implies. With
    /// `extend_current_level` unset, an accepted config opens a new level.
    pub fn push(&mut self, config: &FeaturePackConfig, extend_current_level: bool) -> bool {
        if !self.contributes(config) {
            return false;
        }
        if !extend_current_level || self.levels.is_empty() {
            self.levels.push(Level::default());
        }
        if let Some(level) = self.levels.last_mut() {
            level.add(config.clone());
        }
        true
    }

    /// Drop the innermost level
    pub fn pop_level(&mut self) {
        self.levels.pop();
    }

    /// Whether a config unit of `producer` is left out of the installation
    pub fn is_filtered_out(&self, producer: &Producer, config: &ConfigId) -> bool {
        self.config_decision(producer, config)
            .is_some_and(Decision::is_filtered_out)
    }

    /// Whether a package of `producer` is left out of the installation
    pub fn is_package_filtered_out(&self, producer: &Producer, package: &str) -> bool {
        self.package_decision(producer, package)
            .is_some_and(Decision::is_filtered_out)
    }

    /// The deciding rule for a package, if any scope has one
    pub fn package_decision(&self, producer: &Producer, package: &str) -> Option<Decision> {
        self.decide(producer, |config| config.package_decision(package))
    }

    /// The deciding rule for a config unit, if any scope has one
    pub fn config_decision(&self, producer: &Producer, config: &ConfigId) -> Option<Decision> {
        self.root_filters
            .decide(config)
            .or_else(|| self.decide(producer, |fp| fp.config_decision(config)))
    }

    /// Packages of `producer` explicitly included anywhere on the stack
    pub fn included_packages(&self, producer: &Producer) -> BTreeSet<String> {
        self.configs_for(producer)
            .flat_map(|config| config.included_packages().iter().cloned())
            .collect()
    }

    /// Config units of `producer` explicitly included anywhere on the stack
    pub fn included_configs(&self, producer: &Producer) -> BTreeSet<ConfigId> {
        self.configs_for(producer)
            .flat_map(|config| config.config_filters().included_configs().iter().cloned())
            .chain(self.root_filters.included_configs().iter().cloned())
            .collect()
    }

    /// Every config on the stack, level by level
    ///
    /// Two equal snapshots make identical decisions for every producer.
    pub fn snapshot(&self) -> Vec<(usize, FeaturePackConfig)> {
        let mut snapshot = Vec::new();
        for (depth, level) in self.levels.iter().enumerate() {
            let mut transitive: Vec<&FeaturePackConfig> = level.transitive.values().collect();
            transitive.sort_by(|a, b| a.producer().cmp(b.producer()));
            for config in transitive.into_iter().chain(level.configs.iter()) {
                snapshot.push((depth, config.clone()));
            }
        }
        snapshot
    }

    fn configs_for<'a>(
        &'a self,
        producer: &'a Producer,
    ) -> impl Iterator<Item = &'a FeaturePackConfig> + 'a {
        self.levels.iter().flat_map(move |level| {
            level
                .transitive
                .get(producer)
                .into_iter()
                .chain(level.configs.iter().filter(move |c| c.producer() == producer))
        })
    }

    fn decide<F>(&self, producer: &Producer, decide: F) -> Option<Decision>
    where
        F: Fn(&FeaturePackConfig) -> Option<Decision>,
    {
        for level in &self.levels {
            if let Some(config) = level.transitive.get(producer)
                && let Some(decision) = decide(config)
            {
                return Some(decision);
            }
        }
        for level in self.levels.iter().rev() {
            for config in level.configs.iter().filter(|c| c.producer() == producer) {
                if let Some(decision) = decide(config) {
                    return Some(decision);
                }
            }
        }
        None
    }

    /// True when `config` changes at least one decision the stack would make
    fn contributes(&self, config: &FeaturePackConfig) -> bool {
        let producer = config.producer();

        if !config.patches().is_empty() {
            return true;
        }

        if config.inherit_packages() == Some(false)
            && !self
                .configs_for(producer)
                .any(|c| c.inherit_packages() == Some(false))
        {
            return true;
        }
        if config
            .included_packages()
            .iter()
            .any(|p| self.package_decision(producer, p) != Some(Decision::Include))
        {
            return true;
        }
        if config
            .excluded_packages()
            .iter()
            .any(|p| !self.is_package_filtered_out(producer, p))
        {
            return true;
        }

        let filters = config.config_filters();
        if filters.inherit_configs() == Some(false)
            && !self
                .configs_for(producer)
                .any(|c| c.config_filters().inherit_configs() == Some(false))
        {
            return true;
        }
        if filters.inherit_model_only_configs() == Some(false)
            && !self
                .configs_for(producer)
                .any(|c| c.config_filters().inherit_model_only_configs() == Some(false))
        {
            return true;
        }
        if filters
            .included_configs()
            .iter()
            .any(|id| self.config_decision(producer, id) != Some(Decision::Include))
        {
            return true;
        }
        if filters
            .excluded_configs()
            .iter()
            .any(|id| !self.is_filtered_out(producer, id))
        {
            return true;
        }
        if filters.included_models().iter().any(|model| {
            self.config_decision(producer, &ConfigId::model_only(model.as_str()))
                != Some(Decision::Include)
        }) {
            return true;
        }
        filters
            .excluded_models()
            .iter()
            .any(|model| !self.is_filtered_out(producer, &ConfigId::model_only(model.as_str())))
    }
}
