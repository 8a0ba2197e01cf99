// src/resolver/layout.rs

//! Layout building: which packages and configs of which builds get installed
//!
//! The builder walks the feature-pack graph with an explicit work stack,
//! mirroring the current path on a [`DependencyStack`]. At each feature-pack
//! it selects packages and configs under the filters in effect, pulls in
//! required package dependencies, then pushes the feature-pack's own
//! dependency configs before descending.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::config::{ConfigId, Decision, FeaturePackConfig, ProvisioningConfig};
use crate::error::{Error, Result};
use crate::feature_pack::{ArtifactResolver, FeaturePackSpec};
use crate::location::{Channel, Fpid, Producer};
use crate::resolver::stack::DependencyStack;
use crate::resolver::version::ResolvedVersions;

/// A patch applied on top of a feature-pack
#[derive(Debug, Clone)]
pub struct ResolvedPatch {
    pub spec: Arc<FeaturePackSpec>,
    pub dir: PathBuf,
}

/// One feature-pack as it will be installed
#[derive(Debug, Clone)]
pub struct ResolvedFeaturePack {
    pub spec: Arc<FeaturePackSpec>,
    pub dir: PathBuf,
    pub packages: BTreeSet<String>,
    pub configs: BTreeSet<ConfigId>,
    pub patches: Vec<ResolvedPatch>,
}

impl ResolvedFeaturePack {
    pub fn fpid(&self) -> &Fpid {
        self.spec.fpid()
    }

    pub fn producer(&self) -> &Producer {
        self.spec.producer()
    }
}

/// Installable feature-packs, dependencies before dependents
#[derive(Debug, Clone, Default)]
pub struct ResolvedLayout {
    feature_packs: Vec<ResolvedFeaturePack>,
}

impl ResolvedLayout {
    pub fn feature_packs(&self) -> &[ResolvedFeaturePack] {
        &self.feature_packs
    }

    pub fn get(&self, producer: &Producer) -> Option<&ResolvedFeaturePack> {
        self.feature_packs.iter().find(|fp| fp.producer() == producer)
    }

    pub fn len(&self) -> usize {
        self.feature_packs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feature_packs.is_empty()
    }
}

#[derive(Debug, Default)]
struct Selection {
    packages: BTreeSet<String>,
    configs: BTreeSet<ConfigId>,
}

enum Task {
    Visit(Channel),
    Leave {
        channel: Channel,
        pushed: bool,
        first: bool,
    },
}

/// Builds a [`ResolvedLayout`] from resolved versions
pub struct LayoutBuilder<'a> {
    config: &'a ProvisioningConfig,
    versions: &'a ResolvedVersions,
    artifacts: &'a dyn ArtifactResolver,
}

impl<'a> LayoutBuilder<'a> {
    pub fn new(
        config: &'a ProvisioningConfig,
        versions: &'a ResolvedVersions,
        artifacts: &'a dyn ArtifactResolver,
    ) -> Self {
        Self {
            config,
            versions,
            artifacts,
        }
    }

    pub fn build(&self) -> Result<ResolvedLayout> {
        let mut stack = DependencyStack::new(self.config);
        let mut selections: HashMap<Channel, Selection> = HashMap::new();
        let mut seen: HashMap<Channel, Vec<Vec<(usize, FeaturePackConfig)>>> = HashMap::new();
        let mut on_path: Vec<Channel> = Vec::new();
        let mut order: Vec<Channel> = Vec::new();
        let mut work = Vec::new();

        let (root_pushed, children) = push_level(&mut stack, self.config.all_dependencies());
        work.extend(children.into_iter().rev().map(Task::Visit));

        while let Some(task) = work.pop() {
            match task {
                Task::Leave {
                    channel,
                    pushed,
                    first,
                } => {
                    if pushed {
                        stack.pop_level();
                    }
                    on_path.pop();
                    if first {
                        order.push(channel);
                    }
                }
                Task::Visit(channel) => {
                    let channel = self.versions.effective_channel(&channel).clone();
                    if on_path.contains(&channel) {
                        debug!("Skipping {}: already on the current path", channel);
                        continue;
                    }
                    // Revisit only under filters no earlier visit saw
                    let snapshot = stack.snapshot();
                    let snapshots = seen.entry(channel.clone()).or_default();
                    if snapshots.contains(&snapshot) {
                        continue;
                    }
                    let first = snapshots.is_empty();
                    snapshots.push(snapshot);

                    let spec = self.versions.spec(&channel).cloned().ok_or_else(|| {
                        Error::NotFound(format!("no resolved build for {}", channel))
                    })?;
                    let selection = selections.entry(channel.clone()).or_default();
                    self.select(&spec, &stack, selection)?;

                    let (pushed, children) = push_level(&mut stack, spec.dependencies().iter());

                    on_path.push(channel.clone());
                    work.push(Task::Leave {
                        channel,
                        pushed,
                        first,
                    });
                    work.extend(children.into_iter().rev().map(Task::Visit));
                }
            }
        }

        if root_pushed {
            stack.pop_level();
        }
        debug_assert!(stack.is_empty());

        let mut feature_packs = Vec::with_capacity(order.len());
        for channel in order {
            let Some(spec) = self.versions.spec(&channel).cloned() else {
                continue;
            };
            let selection = selections.remove(&channel).unwrap_or_default();
            let dir = self.artifacts.resolve(spec.fpid())?;
            let mut patches = Vec::new();
            for patch in self.versions.patches(&channel) {
                patches.push(ResolvedPatch {
                    spec: Arc::clone(patch),
                    dir: self.artifacts.resolve(patch.fpid())?,
                });
            }
            debug!(
                "{}: {} packages, {} configs, {} patches",
                spec.fpid(),
                selection.packages.len(),
                selection.configs.len(),
                patches.len()
            );
            feature_packs.push(ResolvedFeaturePack {
                spec,
                dir,
                packages: selection.packages,
                configs: selection.configs,
                patches,
            });
        }

        Ok(ResolvedLayout { feature_packs })
    }

    /// Add the packages and configs selected under the current filters
    fn select(
        &self,
        spec: &FeaturePackSpec,
        stack: &DependencyStack,
        selection: &mut Selection,
    ) -> Result<()> {
        let producer = spec.producer();

        for name in stack.included_packages(producer) {
            if spec.package(&name).is_none() {
                return Err(Error::Description(format!(
                    "package {} is included but not declared by {}",
                    name,
                    spec.fpid()
                )));
            }
        }

        let mut pending: Vec<String> = spec
            .packages()
            .iter()
            .map(|p| p.name())
            .filter(|name| match stack.package_decision(producer, name) {
                Some(Decision::Include) => true,
                Some(_) => false,
                None => spec.default_packages().contains(*name),
            })
            .map(str::to_string)
            .collect();

        while let Some(name) = pending.pop() {
            if !selection.packages.insert(name.clone()) {
                continue;
            }
            let Some(package) = spec.package(&name) else {
                continue;
            };
            for dep in package.dependencies() {
                if selection.packages.contains(&dep.name) {
                    continue;
                }
                let decision = stack.package_decision(producer, &dep.name);
                if dep.optional {
                    if decision.is_some_and(Decision::is_filtered_out) {
                        debug!("Skipping optional package {} of {}", dep.name, spec.fpid());
                        continue;
                    }
                } else if decision == Some(Decision::Exclude) {
                    return Err(Error::Description(format!(
                        "package {} of {} requires excluded package {}",
                        name,
                        spec.fpid(),
                        dep.name
                    )));
                }
                pending.push(dep.name.clone());
            }
        }

        let root_includes = self.config.config_filters().included_configs();
        for id in stack.included_configs(producer) {
            if !spec.has_config(&id) && !root_includes.contains(&id) {
                return Err(Error::Description(format!(
                    "config {} is included but not declared by {}",
                    id,
                    spec.fpid()
                )));
            }
        }
        for id in spec.configs() {
            if !stack.is_filtered_out(producer, id) {
                selection.configs.insert(id.clone());
            }
        }
        Ok(())
    }
}

/// Push one feature-pack's dependency configs as a single level
///
/// Returns whether a level was opened, and the channels to descend into.
fn push_level<'c>(
    stack: &mut DependencyStack,
    deps: impl Iterator<Item = &'c FeaturePackConfig>,
) -> (bool, Vec<Channel>) {
    let mut pushed = false;
    let mut children = Vec::new();
    for dep in deps {
        pushed = stack.push(dep, pushed) || pushed;
        if !dep.is_transitive() {
            children.push(dep.location().channel().clone());
        }
    }
    (pushed, children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_pack::PackageSpec;
    use crate::location::Location;
    use crate::resolver::version::VersionResolver;
    use std::path::Path;

    struct Dirs;

    impl ArtifactResolver for Dirs {
        fn resolve(&self, fpid: &Fpid) -> Result<PathBuf> {
            Ok(Path::new("/repo").join(fpid.to_string()))
        }
    }

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    fn fpid(s: &str) -> Fpid {
        Fpid::parse(s).unwrap()
    }

    fn build(config: &ProvisioningConfig, specs: Vec<FeaturePackSpec>) -> Result<ResolvedLayout> {
        let specs: HashMap<Fpid, FeaturePackSpec> =
            specs.into_iter().map(|s| (s.fpid().clone(), s)).collect();
        let versions = VersionResolver::resolve(config, &specs)?;
        LayoutBuilder::new(config, &versions, &Dirs).build()
    }

    fn core() -> FeaturePackSpec {
        FeaturePackSpec::builder(fpid("core:main#1"))
            .add_default_package(PackageSpec::new("kernel").requires("base"))
            .add_package(PackageSpec::new("base"))
            .add_default_package(PackageSpec::new("jmx").optionally_requires("metrics"))
            .add_package(PackageSpec::new("metrics"))
            .add_config(ConfigId::named("standalone", "standalone.xml"))
            .add_config(ConfigId::named("domain", "domain.xml"))
            .build()
            .unwrap()
    }

    fn app(dependency: FeaturePackConfig) -> FeaturePackSpec {
        FeaturePackSpec::builder(fpid("app:main#1"))
            .add_dependency(dependency)
            .add_default_package(PackageSpec::new("web"))
            .build()
            .unwrap()
    }

    fn root(configs: Vec<FeaturePackConfig>) -> ProvisioningConfig {
        configs
            .into_iter()
            .fold(ProvisioningConfig::builder(), |b, c| b.add_feature_pack(c))
            .build()
            .unwrap()
    }

    #[test]
    fn test_dependencies_come_first() {
        let config = root(vec![FeaturePackConfig::new(loc("app:main#1"))]);
        let layout = build(
            &config,
            vec![core(), app(FeaturePackConfig::new(loc("core:main#1")))],
        )
        .unwrap();

        let order: Vec<String> = layout
            .feature_packs()
            .iter()
            .map(|fp| fp.fpid().to_string())
            .collect();
        assert_eq!(order, vec!["core:main#1", "app:main#1"]);
    }

    #[test]
    fn test_default_packages_pull_required_dependencies() {
        let config = root(vec![FeaturePackConfig::new(loc("core:main#1"))]);
        let layout = build(&config, vec![core()]).unwrap();
        let core = layout.get(&Producer::new("core")).unwrap();
        let packages: Vec<&str> = core.packages.iter().map(String::as_str).collect();
        assert_eq!(packages, vec!["base", "jmx", "kernel", "metrics"]);
        assert_eq!(core.configs.len(), 2);
        assert_eq!(core.dir, Path::new("/repo/core:main#1"));
    }

    #[test]
    fn test_excluded_optional_dependency_skipped() {
        let config = root(vec![
            FeaturePackConfig::builder(loc("core:main#1"))
                .exclude_package("metrics")
                .build()
                .unwrap(),
        ]);
        let layout = build(&config, vec![core()]).unwrap();
        let core = layout.get(&Producer::new("core")).unwrap();
        assert!(core.packages.contains("jmx"));
        assert!(!core.packages.contains("metrics"));
    }

    #[test]
    fn test_excluded_required_dependency_is_an_error() {
        let config = root(vec![
            FeaturePackConfig::builder(loc("core:main#1"))
                .exclude_package("base")
                .build()
                .unwrap(),
        ]);
        assert!(matches!(
            build(&config, vec![core()]),
            Err(Error::Description(_))
        ));
    }

    #[test]
    fn test_dependency_edge_filters_apply() {
        let config = root(vec![FeaturePackConfig::new(loc("app:main#1"))]);
        let edge = FeaturePackConfig::builder(loc("core:main#1"))
            .exclude_package("jmx")
            .exclude_model("domain")
            .build()
            .unwrap();
        let layout = build(&config, vec![core(), app(edge)]).unwrap();
        let core = layout.get(&Producer::new("core")).unwrap();
        assert!(!core.packages.contains("jmx"));
        assert!(!core.packages.contains("metrics"));
        assert_eq!(
            core.configs.iter().collect::<Vec<_>>(),
            vec![&ConfigId::named("standalone", "standalone.xml")]
        );
    }

    #[test]
    fn test_root_transitive_override_reincludes() {
        let edge = FeaturePackConfig::builder(loc("core:main#1"))
            .exclude_package("jmx")
            .build()
            .unwrap();
        let config = root(vec![
            FeaturePackConfig::new(loc("app:main#1")),
            FeaturePackConfig::transitive_builder(loc("core:main#1"))
                .include_package("jmx")
                .build()
                .unwrap(),
        ]);
        let layout = build(&config, vec![core(), app(edge)]).unwrap();
        let core = layout.get(&Producer::new("core")).unwrap();
        assert!(core.packages.contains("jmx"));
    }

    #[test]
    fn test_inherit_packages_false_keeps_only_includes() {
        let config = root(vec![
            FeaturePackConfig::builder(loc("core:main#1"))
                .inherit_packages(false)
                .include_package("kernel")
                .build()
                .unwrap(),
        ]);
        let layout = build(&config, vec![core()]).unwrap();
        let core = layout.get(&Producer::new("core")).unwrap();
        let packages: Vec<&str> = core.packages.iter().map(String::as_str).collect();
        assert_eq!(packages, vec!["base", "kernel"]);
    }

    #[test]
    fn test_unknown_included_package_is_an_error() {
        let config = root(vec![
            FeaturePackConfig::builder(loc("core:main#1"))
                .include_package("nope")
                .build()
                .unwrap(),
        ]);
        assert!(matches!(
            build(&config, vec![core()]),
            Err(Error::Description(_))
        ));
    }

    #[test]
    fn test_revisit_with_new_filters_unions_selection() {
        // root -> app -> core (jmx excluded), root -> core (plain)
        let edge = FeaturePackConfig::builder(loc("core:main#1"))
            .exclude_package("jmx")
            .build()
            .unwrap();
        let config = root(vec![
            FeaturePackConfig::new(loc("app:main#1")),
            FeaturePackConfig::new(loc("core:main#1")),
        ]);
        let layout = build(&config, vec![core(), app(edge)]).unwrap();
        assert_eq!(layout.len(), 2);
        let core = layout.get(&Producer::new("core")).unwrap();
        assert!(core.packages.contains("jmx"));
    }
}
