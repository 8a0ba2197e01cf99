// src/config.rs

//! Provisioning configuration model
//!
//! A [`FeaturePackConfig`] is attached to every edge of the dependency graph
//! and customizes which packages and configs of the target feature-pack end
//! up in the installation. A [`ProvisioningConfig`] is the root of the graph:
//! the feature-packs the user asked for, plus transitive overrides and
//! root-wide config filters.
//!
//! Both types are immutable once built. Builders validate that no name is
//! included and excluded by the same object.
//!
//! # Example provisioning.toml
//!
//! ```toml
//! inherit-configs = true
//!
//! [options]
//! jboss-fork-embedded = "true"
//!
//! [[feature-pack]]
//! location = "wildfly:current#27.0.0"
//! inherit-packages = false
//! included-packages = ["docs.examples"]
//!
//! [[transitive]]
//! location = "wildfly-core:current#19.0.0"
//! excluded-packages = ["org.jboss.as.jmx"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::location::{Fpid, Location, Producer};

/// Identity of a config unit: `(model?, name?)`
///
/// A config with a model and no name is a model-only config: it is merged
/// into every named config of the same model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConfigId {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

impl ConfigId {
    pub fn new(model: Option<&str>, name: Option<&str>) -> Self {
        Self {
            model: model.map(str::to_string),
            name: name.map(str::to_string),
        }
    }

    /// A named config within a model
    pub fn named(model: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            name: Some(name.into()),
        }
    }

    /// A model-only config
    pub fn model_only(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            name: None,
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_model_only(&self) -> bool {
        self.model.is_some() && self.name.is_none()
    }
}

impl fmt::Display for ConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.model.as_deref().unwrap_or("*"),
            self.name.as_deref().unwrap_or("*")
        )
    }
}

/// Outcome of asking one config object about one package or config
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Explicitly included
    Include,
    /// Explicitly excluded
    Exclude,
    /// Inheritance switched off at this scope
    NotInherited,
}

impl Decision {
    pub fn is_filtered_out(self) -> bool {
        !matches!(self, Decision::Include)
    }
}

/// Config-unit filters shared by feature-pack configs and the root config
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConfigFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inherit_configs: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) inherit_model_only_configs: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub(crate) included_models: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub(crate) excluded_models: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub(crate) included_configs: BTreeSet<ConfigId>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub(crate) excluded_configs: BTreeSet<ConfigId>,
}

impl ConfigFilters {
    /// Decide on a config unit at this scope
    ///
    /// Explicit config ids win over model-wide rules, which win over the
    /// inherit flags.
    pub fn decide(&self, id: &ConfigId) -> Option<Decision> {
        if self.included_configs.contains(id) {
            return Some(Decision::Include);
        }
        if self.excluded_configs.contains(id) {
            return Some(Decision::Exclude);
        }
        if let Some(model) = id.model() {
            if self.included_models.contains(model) {
                return Some(Decision::Include);
            }
            if self.excluded_models.contains(model) {
                return Some(Decision::Exclude);
            }
        }
        let inherit = if id.is_model_only() {
            self.inherit_model_only_configs
        } else {
            self.inherit_configs
        };
        match inherit {
            Some(false) => Some(Decision::NotInherited),
            _ => None,
        }
    }

    pub fn inherit_configs(&self) -> Option<bool> {
        self.inherit_configs
    }

    pub fn inherit_model_only_configs(&self) -> Option<bool> {
        self.inherit_model_only_configs
    }

    pub fn included_configs(&self) -> &BTreeSet<ConfigId> {
        &self.included_configs
    }

    pub fn excluded_configs(&self) -> &BTreeSet<ConfigId> {
        &self.excluded_configs
    }

    pub fn included_models(&self) -> &BTreeSet<String> {
        &self.included_models
    }

    pub fn excluded_models(&self) -> &BTreeSet<String> {
        &self.excluded_models
    }

    pub fn is_empty(&self) -> bool {
        self.inherit_configs.is_none()
            && self.inherit_model_only_configs.is_none()
            && self.included_models.is_empty()
            && self.excluded_models.is_empty()
            && self.included_configs.is_empty()
            && self.excluded_configs.is_empty()
    }

    fn validate(&self, owner: &str) -> Result<()> {
        if let Some(id) = self.included_configs.intersection(&self.excluded_configs).next() {
            return Err(Error::Description(format!(
                "config {} is both included and excluded in {}",
                id, owner
            )));
        }
        if let Some(model) = self.included_models.intersection(&self.excluded_models).next() {
            return Err(Error::Description(format!(
                "config model {} is both included and excluded in {}",
                model, owner
            )));
        }
        Ok(())
    }
}

/// Customization of one dependency edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturePackConfig {
    location: Location,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    transitive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inherit_packages: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    included_packages: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    excluded_packages: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    patches: Vec<Fpid>,
    #[serde(flatten)]
    configs: ConfigFilters,
}

impl FeaturePackConfig {
    /// A dependency on `location` with no customization
    pub fn new(location: Location) -> Self {
        Self {
            location,
            transitive: false,
            inherit_packages: None,
            included_packages: BTreeSet::new(),
            excluded_packages: BTreeSet::new(),
            patches: Vec::new(),
            configs: ConfigFilters::default(),
        }
    }

    pub fn builder(location: Location) -> FeaturePackConfigBuilder {
        FeaturePackConfigBuilder {
            config: Self::new(location),
        }
    }

    /// Builder for a pass-through constraint on a descendant producer
    pub fn transitive_builder(location: Location) -> FeaturePackConfigBuilder {
        let mut config = Self::new(location);
        config.transitive = true;
        FeaturePackConfigBuilder { config }
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn producer(&self) -> &Producer {
        self.location.producer()
    }

    pub fn is_transitive(&self) -> bool {
        self.transitive
    }

    pub fn inherit_packages(&self) -> Option<bool> {
        self.inherit_packages
    }

    pub fn included_packages(&self) -> &BTreeSet<String> {
        &self.included_packages
    }

    pub fn excluded_packages(&self) -> &BTreeSet<String> {
        &self.excluded_packages
    }

    pub fn patches(&self) -> &[Fpid] {
        &self.patches
    }

    pub fn config_filters(&self) -> &ConfigFilters {
        &self.configs
    }

    /// True when this config customizes nothing
    pub fn is_plain(&self) -> bool {
        self.inherit_packages.is_none()
            && self.included_packages.is_empty()
            && self.excluded_packages.is_empty()
            && self.patches.is_empty()
            && self.configs.is_empty()
    }

    /// Decide on a package at this scope
    pub fn package_decision(&self, package: &str) -> Option<Decision> {
        if self.included_packages.contains(package) {
            return Some(Decision::Include);
        }
        if self.excluded_packages.contains(package) {
            return Some(Decision::Exclude);
        }
        match self.inherit_packages {
            Some(false) => Some(Decision::NotInherited),
            _ => None,
        }
    }

    /// Decide on a config unit at this scope
    pub fn config_decision(&self, id: &ConfigId) -> Option<Decision> {
        self.configs.decide(id)
    }

    /// Same customization pointing at another location
    pub fn with_location(&self, location: Location) -> Self {
        let mut config = self.clone();
        config.location = location;
        config
    }

    /// Check the invariants the builder enforces
    ///
    /// Configs deserialized from disk bypass the builder, so loaders call
    /// this before handing them out.
    pub fn validate(&self) -> Result<()> {
        let owner = self.location.to_string();
        if let Some(package) = self
            .included_packages
            .intersection(&self.excluded_packages)
            .next()
        {
            return Err(Error::Description(format!(
                "package {} is both included and excluded in {}",
                package, owner
            )));
        }
        let mut seen = BTreeSet::new();
        for patch in &self.patches {
            if !seen.insert(patch) {
                return Err(Error::Description(format!(
                    "patch {} is listed twice in {}",
                    patch, owner
                )));
            }
        }
        self.configs.validate(&owner)
    }
}

/// Builder for [`FeaturePackConfig`]
#[derive(Debug, Clone)]
pub struct FeaturePackConfigBuilder {
    config: FeaturePackConfig,
}

impl FeaturePackConfigBuilder {
    pub fn inherit_packages(mut self, inherit: bool) -> Self {
        self.config.inherit_packages = Some(inherit);
        self
    }

    pub fn include_package(mut self, name: impl Into<String>) -> Self {
        self.config.included_packages.insert(name.into());
        self
    }

    pub fn exclude_package(mut self, name: impl Into<String>) -> Self {
        self.config.excluded_packages.insert(name.into());
        self
    }

    pub fn inherit_configs(mut self, inherit: bool) -> Self {
        self.config.configs.inherit_configs = Some(inherit);
        self
    }

    pub fn inherit_model_only_configs(mut self, inherit: bool) -> Self {
        self.config.configs.inherit_model_only_configs = Some(inherit);
        self
    }

    pub fn include_config(mut self, id: ConfigId) -> Self {
        self.config.configs.included_configs.insert(id);
        self
    }

    pub fn exclude_config(mut self, id: ConfigId) -> Self {
        self.config.configs.excluded_configs.insert(id);
        self
    }

    pub fn include_model(mut self, model: impl Into<String>) -> Self {
        self.config.configs.included_models.insert(model.into());
        self
    }

    pub fn exclude_model(mut self, model: impl Into<String>) -> Self {
        self.config.configs.excluded_models.insert(model.into());
        self
    }

    pub fn add_patch(mut self, patch: Fpid) -> Self {
        self.config.patches.push(patch);
        self
    }

    pub fn build(self) -> Result<FeaturePackConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Root of the provisioning graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisioningConfig {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    options: BTreeMap<String, String>,
    #[serde(flatten)]
    configs: ConfigFilters,
    #[serde(default, rename = "feature-pack", skip_serializing_if = "Vec::is_empty")]
    feature_packs: Vec<FeaturePackConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    transitive: Vec<FeaturePackConfig>,
}

impl ProvisioningConfig {
    pub fn builder() -> ProvisioningConfigBuilder {
        ProvisioningConfigBuilder {
            config: Self::default(),
        }
    }

    /// Direct feature-pack dependencies, in declaration order
    pub fn feature_packs(&self) -> &[FeaturePackConfig] {
        &self.feature_packs
    }

    /// Transitive overrides declared at the root
    pub fn transitive(&self) -> &[FeaturePackConfig] {
        &self.transitive
    }

    /// Transitive overrides first, then direct dependencies
    pub fn all_dependencies(&self) -> impl Iterator<Item = &FeaturePackConfig> {
        self.transitive.iter().chain(self.feature_packs.iter())
    }

    pub fn config_filters(&self) -> &ConfigFilters {
        &self.configs
    }

    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    pub fn has_feature_packs(&self) -> bool {
        !self.feature_packs.is_empty()
    }

    /// Find the direct dependency on a producer
    pub fn feature_pack(&self, producer: &Producer) -> Option<&FeaturePackConfig> {
        self.feature_packs.iter().find(|fp| fp.producer() == producer)
    }

    /// Copy with `config` added, replacing any direct dependency on the same producer
    pub fn with_feature_pack(&self, config: FeaturePackConfig) -> Result<Self> {
        if config.is_transitive() {
            return Err(Error::Description(format!(
                "{} is transitive and cannot be installed directly",
                config.location()
            )));
        }
        config.validate()?;
        let mut updated = self.clone();
        match updated
            .feature_packs
            .iter_mut()
            .find(|fp| fp.producer() == config.producer())
        {
            Some(existing) => *existing = config,
            None => updated.feature_packs.push(config),
        }
        Ok(updated)
    }

    /// Copy with the direct dependency on `producer` removed
    pub fn without_producer(&self, producer: &Producer) -> Result<Self> {
        let mut updated = self.clone();
        let before = updated.feature_packs.len();
        updated.feature_packs.retain(|fp| fp.producer() != producer);
        if updated.feature_packs.len() == before {
            return Err(Error::NotFound(format!(
                "feature-pack {} is not installed",
                producer
            )));
        }
        Ok(updated)
    }

    pub fn validate(&self) -> Result<()> {
        self.configs.validate("the provisioning config")?;
        let mut producers = BTreeSet::new();
        for fp in &self.feature_packs {
            fp.validate()?;
            if fp.is_transitive() {
                return Err(Error::Description(format!(
                    "{} is declared transitive among the direct feature-packs",
                    fp.location()
                )));
            }
            if !producers.insert(fp.producer()) {
                return Err(Error::Description(format!(
                    "feature-pack {} is declared twice",
                    fp.producer()
                )));
            }
        }
        let mut transitive = BTreeSet::new();
        for fp in &self.transitive {
            fp.validate()?;
            if !transitive.insert(fp.producer()) {
                return Err(Error::Description(format!(
                    "transitive feature-pack {} is declared twice",
                    fp.producer()
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: ProvisioningConfig = toml::from_str(content)?;
        for fp in &mut config.transitive {
            fp.transitive = true;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_toml_str(&content)
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml_string()?;
        crate::transaction::write_atomic(path, content.as_bytes())
    }
}

/// Builder for [`ProvisioningConfig`]
#[derive(Debug, Clone)]
pub struct ProvisioningConfigBuilder {
    config: ProvisioningConfig,
}

impl ProvisioningConfigBuilder {
    /// Add a direct dependency, or a root-level transitive override
    pub fn add_feature_pack(mut self, config: FeaturePackConfig) -> Self {
        if config.is_transitive() {
            self.config.transitive.push(config);
        } else {
            self.config.feature_packs.push(config);
        }
        self
    }

    pub fn inherit_configs(mut self, inherit: bool) -> Self {
        self.config.configs.inherit_configs = Some(inherit);
        self
    }

    pub fn inherit_model_only_configs(mut self, inherit: bool) -> Self {
        self.config.configs.inherit_model_only_configs = Some(inherit);
        self
    }

    pub fn include_config(mut self, id: ConfigId) -> Self {
        self.config.configs.included_configs.insert(id);
        self
    }

    pub fn exclude_config(mut self, id: ConfigId) -> Self {
        self.config.configs.excluded_configs.insert(id);
        self
    }

    pub fn include_model(mut self, model: impl Into<String>) -> Self {
        self.config.configs.included_models.insert(model.into());
        self
    }

    pub fn exclude_model(mut self, model: impl Into<String>) -> Self {
        self.config.configs.excluded_models.insert(model.into());
        self
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.options.insert(name.into(), value.into());
        self
    }

    pub fn build(self) -> Result<ProvisioningConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    #[test]
    fn test_builder_rejects_package_in_both_sets() {
        let result = FeaturePackConfig::builder(loc("core:main#1.0"))
            .include_package("p")
            .exclude_package("p")
            .build();
        assert!(matches!(result, Err(Error::Description(_))));
    }

    #[test]
    fn test_builder_rejects_config_in_both_sets() {
        let id = ConfigId::named("standalone", "standalone.xml");
        let result = FeaturePackConfig::builder(loc("core:main#1.0"))
            .include_config(id.clone())
            .exclude_config(id)
            .build();
        assert!(matches!(result, Err(Error::Description(_))));

        let result = ProvisioningConfig::builder()
            .include_model("domain")
            .exclude_model("domain")
            .build();
        assert!(matches!(result, Err(Error::Description(_))));
    }

    #[test]
    fn test_package_decision_precedence() {
        let config = FeaturePackConfig::builder(loc("core:main#1.0"))
            .inherit_packages(false)
            .include_package("a")
            .exclude_package("b")
            .build()
            .unwrap();
        assert_eq!(config.package_decision("a"), Some(Decision::Include));
        assert_eq!(config.package_decision("b"), Some(Decision::Exclude));
        assert_eq!(config.package_decision("c"), Some(Decision::NotInherited));

        let plain = FeaturePackConfig::new(loc("core:main#1.0"));
        assert!(plain.is_plain());
        assert_eq!(plain.package_decision("c"), None);
    }

    #[test]
    fn test_config_decision_model_tier() {
        let config = FeaturePackConfig::builder(loc("core:main#1.0"))
            .exclude_model("domain")
            .include_config(ConfigId::named("domain", "domain.xml"))
            .inherit_model_only_configs(false)
            .build()
            .unwrap();
        assert_eq!(
            config.config_decision(&ConfigId::named("domain", "domain.xml")),
            Some(Decision::Include)
        );
        assert_eq!(
            config.config_decision(&ConfigId::named("domain", "host.xml")),
            Some(Decision::Exclude)
        );
        assert_eq!(
            config.config_decision(&ConfigId::model_only("standalone")),
            Some(Decision::NotInherited)
        );
        assert_eq!(
            config.config_decision(&ConfigId::named("standalone", "standalone.xml")),
            None
        );
    }

    #[test]
    fn test_provisioning_config_rejects_duplicate_producer() {
        let result = ProvisioningConfig::builder()
            .add_feature_pack(FeaturePackConfig::new(loc("core:main#1.0")))
            .add_feature_pack(FeaturePackConfig::new(loc("core:main#2.0")))
            .build();
        assert!(matches!(result, Err(Error::Description(_))));
    }

    #[test]
    fn test_with_feature_pack_replaces_same_producer() {
        let config = ProvisioningConfig::builder()
            .add_feature_pack(FeaturePackConfig::new(loc("core:main#1.0")))
            .build()
            .unwrap();
        let updated = config
            .with_feature_pack(FeaturePackConfig::new(loc("core:main#2.0")))
            .unwrap();
        assert_eq!(updated.feature_packs().len(), 1);
        assert_eq!(updated.feature_packs()[0].location().build(), Some("2.0"));

        let removed = updated.without_producer(&Producer::new("core")).unwrap();
        assert!(!removed.has_feature_packs());
        assert!(matches!(
            removed.without_producer(&Producer::new("core")),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip_keeps_transitive_flag() {
        let config = ProvisioningConfig::builder()
            .option("mode", "offline")
            .exclude_model("domain")
            .add_feature_pack(
                FeaturePackConfig::builder(loc("app:main#1.0"))
                    .inherit_packages(false)
                    .include_package("docs")
                    .include_config(ConfigId::named("standalone", "ha.xml"))
                    .build()
                    .unwrap(),
            )
            .add_feature_pack(
                FeaturePackConfig::transitive_builder(loc("core:main#2.0"))
                    .exclude_package("jmx")
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        let toml = config.to_toml_string().unwrap();
        let parsed = ProvisioningConfig::from_toml_str(&toml).unwrap();
        assert_eq!(parsed, config);
        assert!(parsed.transitive()[0].is_transitive());
    }
}
