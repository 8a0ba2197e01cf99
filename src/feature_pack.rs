// src/feature_pack.rs

//! Feature-pack descriptions and the collaborators that supply them
//!
//! A [`FeaturePackSpec`] is the published description of one build: what it
//! depends on, which packages and configs it offers, which plugins must run
//! when it is installed, and whether it patches or substitutes another
//! feature-pack.
//!
//! Retrieval is abstracted behind three traits so the resolution engine never
//! touches the network:
//! - [`SpecSupplier`] loads a description by identity
//! - [`ArtifactResolver`] maps an identity to its local directory
//! - [`UpdateSource`] reports the newest build on a channel

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{ConfigId, FeaturePackConfig};
use crate::error::{Error, Result};
use crate::location::{Channel, Fpid, Producer};

/// File name of the description inside a feature-pack directory
pub const FEATURE_PACK_FILE: &str = "feature-pack.toml";

/// Directory holding one subdirectory per package
pub const PACKAGES_DIR: &str = "packages";

/// Directory inside a package whose tree is copied into the installation
pub const CONTENT_DIR: &str = "content";

/// A dependency of one package on another package of the same feature-pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
}

/// A named bundle of files within a feature-pack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<PackageDependency>,
}

impl PackageSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
        }
    }

    /// Add a required dependency
    pub fn requires(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(PackageDependency {
            name: name.into(),
            optional: false,
        });
        self
    }

    /// Add an optional dependency
    pub fn optionally_requires(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(PackageDependency {
            name: name.into(),
            optional: true,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dependencies(&self) -> &[PackageDependency] {
        &self.dependencies
    }
}

/// A plugin that must run when the feature-pack is installed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub id: String,
}

/// Published description of one feature-pack build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FeaturePackSpec {
    fpid: Fpid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch_for: Option<Fpid>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    default_packages: BTreeSet<String>,
    #[serde(default, rename = "dependency", skip_serializing_if = "Vec::is_empty")]
    dependencies: Vec<FeaturePackConfig>,
    #[serde(default, rename = "package", skip_serializing_if = "Vec::is_empty")]
    packages: Vec<PackageSpec>,
    #[serde(default, rename = "config", skip_serializing_if = "Vec::is_empty")]
    configs: Vec<ConfigId>,
    #[serde(default, rename = "plugin", skip_serializing_if = "Vec::is_empty")]
    plugins: Vec<PluginSpec>,
}

impl FeaturePackSpec {
    pub fn builder(fpid: Fpid) -> FeaturePackSpecBuilder {
        FeaturePackSpecBuilder {
            spec: Self {
                fpid,
                family: None,
                patch_for: None,
                default_packages: BTreeSet::new(),
                dependencies: Vec::new(),
                packages: Vec::new(),
                configs: Vec::new(),
                plugins: Vec::new(),
            },
        }
    }

    pub fn fpid(&self) -> &Fpid {
        &self.fpid
    }

    pub fn producer(&self) -> &Producer {
        self.fpid.producer()
    }

    pub fn family(&self) -> Option<&str> {
        self.family.as_deref()
    }

    pub fn patch_for(&self) -> Option<&Fpid> {
        self.patch_for.as_ref()
    }

    pub fn is_patch(&self) -> bool {
        self.patch_for.is_some()
    }

    /// All declared dependencies, transitive ones included
    pub fn dependencies(&self) -> &[FeaturePackConfig] {
        &self.dependencies
    }

    /// Dependencies that are edges of the graph
    pub fn direct_dependencies(&self) -> impl Iterator<Item = &FeaturePackConfig> {
        self.dependencies.iter().filter(|dep| !dep.is_transitive())
    }

    pub fn packages(&self) -> &[PackageSpec] {
        &self.packages
    }

    pub fn package(&self, name: &str) -> Option<&PackageSpec> {
        self.packages.iter().find(|p| p.name == name)
    }

    pub fn default_packages(&self) -> &BTreeSet<String> {
        &self.default_packages
    }

    /// Configs provided by default
    pub fn configs(&self) -> &[ConfigId] {
        &self.configs
    }

    pub fn has_config(&self, id: &ConfigId) -> bool {
        self.configs.contains(id)
    }

    pub fn plugins(&self) -> &[PluginSpec] {
        &self.plugins
    }

    pub fn validate(&self) -> Result<()> {
        if self.fpid.build().is_none() {
            return Err(Error::Description(format!(
                "feature-pack {} is published without a build",
                self.fpid
            )));
        }

        let mut names = BTreeSet::new();
        for package in &self.packages {
            if !names.insert(package.name.as_str()) {
                return Err(Error::Description(format!(
                    "package {} is declared twice in {}",
                    package.name, self.fpid
                )));
            }
        }
        for package in &self.packages {
            for dep in &package.dependencies {
                if !names.contains(dep.name.as_str()) {
                    return Err(Error::Description(format!(
                        "package {} in {} depends on unknown package {}",
                        package.name, self.fpid, dep.name
                    )));
                }
            }
        }
        for name in &self.default_packages {
            if !names.contains(name.as_str()) {
                return Err(Error::Description(format!(
                    "default package {} is not declared in {}",
                    name, self.fpid
                )));
            }
        }

        let mut producers = BTreeSet::new();
        for dep in &self.dependencies {
            dep.validate()?;
            if dep.producer() == self.producer() {
                return Err(Error::Description(format!(
                    "{} declares a dependency on its own producer",
                    self.fpid
                )));
            }
            if !producers.insert((dep.is_transitive(), dep.producer())) {
                return Err(Error::Description(format!(
                    "{} declares {} twice",
                    self.fpid,
                    dep.producer()
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let spec: FeaturePackSpec = toml::from_str(content)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Builder for [`FeaturePackSpec`]
#[derive(Debug, Clone)]
pub struct FeaturePackSpecBuilder {
    spec: FeaturePackSpec,
}

impl FeaturePackSpecBuilder {
    pub fn family(mut self, family: impl Into<String>) -> Self {
        self.spec.family = Some(family.into());
        self
    }

    pub fn patch_for(mut self, fpid: Fpid) -> Self {
        self.spec.patch_for = Some(fpid);
        self
    }

    pub fn add_dependency(mut self, config: FeaturePackConfig) -> Self {
        self.spec.dependencies.push(config);
        self
    }

    pub fn add_package(mut self, package: PackageSpec) -> Self {
        self.spec.packages.push(package);
        self
    }

    /// Declare a package and mark it installed by default
    pub fn add_default_package(mut self, package: PackageSpec) -> Self {
        self.spec.default_packages.insert(package.name.clone());
        self.spec.packages.push(package);
        self
    }

    pub fn add_config(mut self, id: ConfigId) -> Self {
        self.spec.configs.push(id);
        self
    }

    pub fn add_plugin(mut self, id: impl Into<String>) -> Self {
        self.spec.plugins.push(PluginSpec { id: id.into() });
        self
    }

    pub fn build(self) -> Result<FeaturePackSpec> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Loads feature-pack descriptions
pub trait SpecSupplier {
    fn load_spec(&self, fpid: &Fpid) -> Result<FeaturePackSpec>;
}

/// Maps a feature-pack identity to a local directory holding its content
pub trait ArtifactResolver {
    fn resolve(&self, fpid: &Fpid) -> Result<PathBuf>;
}

/// Reports the newest available build on a channel
pub trait UpdateSource {
    fn latest_build(&self, channel: &Channel) -> Result<Option<Fpid>>;
}

/// Everything the orchestrator needs from a repository
pub trait Repository: ArtifactResolver + SpecSupplier {}

impl<T: ArtifactResolver + SpecSupplier> Repository for T {}

impl SpecSupplier for HashMap<Fpid, FeaturePackSpec> {
    fn load_spec(&self, fpid: &Fpid) -> Result<FeaturePackSpec> {
        self.get(fpid)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("feature-pack {}", fpid)))
    }
}
