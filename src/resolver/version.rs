// src/resolver/version.rs

//! Version resolution and conflict detection
//!
//! Walks every feature-pack dependency (direct and transitive) depth-first
//! and pins each channel to exactly one build.
//!
//! The walk keeps a *branch*: the channels pinned by the levels on the
//! current path. A level pins all of its declarations before descending into
//! any of them, so:
//! - a declaration for a channel already pinned on the branch is reconciled
//!   silently (the ancestor wins, and cycles terminate);
//! - the same channel reached through two independent branches with two
//!   different builds is a conflict.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::config::{FeaturePackConfig, ProvisioningConfig};
use crate::error::{ChannelConflict, Error, Result};
use crate::feature_pack::{FeaturePackSpec, SpecSupplier};
use crate::location::{Channel, Fpid};

/// One pinned build per channel, plus everything learned on the way
#[derive(Debug, Clone, Default)]
pub struct ResolvedVersions {
    fpids: HashMap<Channel, Fpid>,
    specs: HashMap<Channel, Arc<FeaturePackSpec>>,
    substitutions: HashMap<Channel, Channel>,
    patches: HashMap<Channel, Vec<Arc<FeaturePackSpec>>>,
}

impl ResolvedVersions {
    /// The build a channel resolved to, following family substitutions
    pub fn fpid(&self, channel: &Channel) -> Option<&Fpid> {
        self.fpids.get(self.effective_channel(channel))
    }

    /// The description of the build a channel resolved to
    pub fn spec(&self, channel: &Channel) -> Option<&Arc<FeaturePackSpec>> {
        self.specs.get(self.effective_channel(channel))
    }

    /// The channel that actually provides `channel` after family substitution
    pub fn effective_channel<'a>(&'a self, channel: &'a Channel) -> &'a Channel {
        self.substitutions.get(channel).unwrap_or(channel)
    }

    /// Channels replaced by another producer of the same family
    pub fn substitutions(&self) -> &HashMap<Channel, Channel> {
        &self.substitutions
    }

    /// Patches declared for a channel, in declaration order
    pub fn patches(&self, channel: &Channel) -> &[Arc<FeaturePackSpec>] {
        self.patches.get(channel).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.fpids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fpids.is_empty()
    }

    /// All pinned builds, sorted
    pub fn fpids(&self) -> Vec<&Fpid> {
        let mut fpids: Vec<&Fpid> = self.fpids.values().collect();
        fpids.sort();
        fpids
    }
}

enum Task {
    Descend(Fpid),
    Leave(usize),
}

/// Depth-first version resolver
pub struct VersionResolver<'a> {
    supplier: &'a dyn SpecSupplier,
    branch: Vec<(Channel, Fpid)>,
    loaded: HashMap<Channel, Fpid>,
    cache: HashMap<Fpid, Arc<FeaturePackSpec>>,
    families: HashMap<String, Channel>,
    missing: BTreeSet<Channel>,
    conflicts: BTreeMap<Channel, BTreeSet<Fpid>>,
    resolved: ResolvedVersions,
}

impl<'a> VersionResolver<'a> {
    /// Resolve every channel reachable from `config` to one build
    pub fn resolve(
        config: &ProvisioningConfig,
        supplier: &'a dyn SpecSupplier,
    ) -> Result<ResolvedVersions> {
        let mut resolver = Self {
            supplier,
            branch: Vec::new(),
            loaded: HashMap::new(),
            cache: HashMap::new(),
            families: HashMap::new(),
            missing: BTreeSet::new(),
            conflicts: BTreeMap::new(),
            resolved: ResolvedVersions::default(),
        };
        resolver.run(config)?;
        resolver.finish()
    }

    fn run(&mut self, config: &ProvisioningConfig) -> Result<()> {
        // Families offered by the root feature-packs
        for fp in config.feature_packs() {
            let location = fp.location();
            if location.has_build() {
                let spec = self.load(&location.fpid())?;
                if let Some(family) = spec.family() {
                    self.families
                        .entry(family.to_string())
                        .or_insert_with(|| location.channel().clone());
                }
            }
        }

        let mut work = Vec::new();
        let deps: Vec<FeaturePackConfig> = config.all_dependencies().cloned().collect();
        self.enter_level(&deps, true, &mut work)?;

        while let Some(task) = work.pop() {
            match task {
                Task::Leave(branch_len) => self.branch.truncate(branch_len),
                Task::Descend(fpid) => {
                    let spec = self.load(&fpid)?;
                    let deps = spec.dependencies().to_vec();
                    self.enter_level(&deps, false, &mut work)?;
                }
            }
        }
        Ok(())
    }

    /// Pin a level's declarations and schedule descent into its new channels
    fn enter_level(
        &mut self,
        deps: &[FeaturePackConfig],
        root: bool,
        work: &mut Vec<Task>,
    ) -> Result<()> {
        let branch_len = self.branch.len();
        let mut descend = Vec::new();

        // Transitive pins first so direct siblings already see them
        let ordered = deps
            .iter()
            .filter(|d| d.is_transitive())
            .chain(deps.iter().filter(|d| !d.is_transitive()));

        for dep in ordered {
            let location = dep.location();
            let channel = location.channel().clone();

            let fpid = match self.pinned(&channel).cloned() {
                Some(fpid) => fpid,
                None => {
                    if !location.has_build() {
                        // Another branch may still pin it; settled in finish()
                        debug!("No build for {} declared by the current level", channel);
                        self.missing.insert(channel);
                        continue;
                    }
                    let fpid = location.fpid();
                    self.branch.push((channel.clone(), fpid.clone()));
                    fpid
                }
            };

            self.record_patches(dep, &fpid)?;

            if dep.is_transitive() {
                continue;
            }

            if !root && self.substitute(&channel, &fpid)? {
                continue;
            }

            match self.loaded.get(&channel) {
                Some(existing) if existing != &fpid => {
                    debug!("Conflicting builds for {}: {} and {}", channel, existing, fpid);
                    let entry = self.conflicts.entry(channel).or_default();
                    entry.insert(existing.clone());
                    entry.insert(fpid);
                }
                Some(_) => {}
                None => {
                    self.loaded.insert(channel, fpid.clone());
                    descend.push(fpid);
                }
            }
        }

        work.push(Task::Leave(branch_len));
        for fpid in descend.into_iter().rev() {
            work.push(Task::Descend(fpid));
        }
        Ok(())
    }

    /// The pin for a channel on the current branch, the outermost one winning
    fn pinned(&self, channel: &Channel) -> Option<&Fpid> {
        self.branch
            .iter()
            .find(|(c, _)| c == channel)
            .map(|(_, fpid)| fpid)
    }

    /// Replace a dependency by a root feature-pack of the same family
    fn substitute(&mut self, channel: &Channel, fpid: &Fpid) -> Result<bool> {
        if self.families.is_empty() || self.loaded.contains_key(channel) {
            return Ok(false);
        }
        let spec = self.load(fpid)?;
        let Some(family) = spec.family() else {
            return Ok(false);
        };
        match self.families.get(family) {
            Some(provider) if provider != channel => {
                debug!("{} is provided by {} (family {})", channel, provider, family);
                self.resolved
                    .substitutions
                    .insert(channel.clone(), provider.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn record_patches(&mut self, dep: &FeaturePackConfig, target: &Fpid) -> Result<()> {
        for patch in dep.patches() {
            if patch.build().is_none() {
                self.missing.insert(patch.channel().clone());
                continue;
            }
            let spec = self.load(patch)?;
            if spec.patch_for() != Some(target) {
                return Err(Error::Description(format!(
                    "{} is not a patch for {}",
                    patch, target
                )));
            }
            let patches = self
                .resolved
                .patches
                .entry(target.channel().clone())
                .or_default();
            if !patches.iter().any(|p| p.fpid() == patch) {
                patches.push(spec);
            }
        }
        Ok(())
    }

    fn load(&mut self, fpid: &Fpid) -> Result<Arc<FeaturePackSpec>> {
        if let Some(spec) = self.cache.get(fpid) {
            return Ok(Arc::clone(spec));
        }
        let spec = self.supplier.load_spec(fpid)?;
        spec.validate()?;
        if spec.fpid() != fpid {
            return Err(Error::Description(format!(
                "description loaded for {} identifies itself as {}",
                fpid,
                spec.fpid()
            )));
        }
        let spec = Arc::new(spec);
        self.cache.insert(fpid.clone(), Arc::clone(&spec));
        Ok(spec)
    }

    fn finish(mut self) -> Result<ResolvedVersions> {
        self.missing.retain(|channel| !self.loaded.contains_key(channel));
        if !self.missing.is_empty() {
            return Err(Error::MissingVersion(self.missing.into_iter().collect()));
        }
        if !self.conflicts.is_empty() {
            return Err(Error::VersionConflict(
                self.conflicts
                    .into_iter()
                    .map(|(channel, fpids)| ChannelConflict {
                        channel,
                        fpids: fpids.into_iter().collect(),
                    })
                    .collect(),
            ));
        }

        for (channel, fpid) in self.loaded {
            if let Some(spec) = self.cache.get(&fpid) {
                self.resolved.specs.insert(channel.clone(), Arc::clone(spec));
            }
            self.resolved.fpids.insert(channel, fpid);
        }
        Ok(self.resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::Location;
    use std::collections::HashMap;

    fn loc(s: &str) -> Location {
        Location::parse(s).unwrap()
    }

    fn fpid(s: &str) -> Fpid {
        Fpid::parse(s).unwrap()
    }

    fn spec(id: &str, deps: &[&str]) -> FeaturePackSpec {
        let mut builder = FeaturePackSpec::builder(fpid(id));
        for dep in deps {
            builder = builder.add_dependency(FeaturePackConfig::new(loc(dep)));
        }
        builder.build().unwrap()
    }

    fn supplier(specs: Vec<FeaturePackSpec>) -> HashMap<Fpid, FeaturePackSpec> {
        specs.into_iter().map(|s| (s.fpid().clone(), s)).collect()
    }

    fn root(deps: &[&str]) -> ProvisioningConfig {
        let mut builder = ProvisioningConfig::builder();
        for dep in deps {
            builder = builder.add_feature_pack(FeaturePackConfig::new(loc(dep)));
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_diamond_with_differing_builds_conflicts() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main#1"]),
            spec("b:main#1", &["c:main#2"]),
            spec("c:main#1", &[]),
            spec("c:main#2", &[]),
        ]);
        let err = VersionResolver::resolve(&root(&["a:main#1", "b:main#1"]), &specs).unwrap_err();
        match err {
            Error::VersionConflict(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].channel, loc("c:main").channel().clone());
                assert_eq!(conflicts[0].fpids, vec![fpid("c:main#1"), fpid("c:main#2")]);
            }
            other => panic!("expected version conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_diamond_with_same_build_resolves() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main#1"]),
            spec("b:main#1", &["c:main#1"]),
            spec("c:main#1", &[]),
        ]);
        let resolved = VersionResolver::resolve(&root(&["a:main#1", "b:main#1"]), &specs).unwrap();
        assert_eq!(resolved.len(), 3);
        assert_eq!(
            resolved.fpid(loc("c:main").channel()),
            Some(&fpid("c:main#1"))
        );
    }

    #[test]
    fn test_root_pin_overrides_descendant() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main#1"]),
            spec("c:main#2", &[]),
        ]);
        let resolved = VersionResolver::resolve(&root(&["a:main#1", "c:main#2"]), &specs).unwrap();
        assert_eq!(
            resolved.fpid(loc("c:main").channel()),
            Some(&fpid("c:main#2"))
        );
    }

    #[test]
    fn test_transitive_pin_reconciles_branches() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main#1"]),
            spec("b:main#1", &["c:main#2"]),
            spec("c:main#3", &[]),
        ]);
        let config = ProvisioningConfig::builder()
            .add_feature_pack(FeaturePackConfig::new(loc("a:main#1")))
            .add_feature_pack(FeaturePackConfig::new(loc("b:main#1")))
            .add_feature_pack(
                FeaturePackConfig::transitive_builder(loc("c:main#3"))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let resolved = VersionResolver::resolve(&config, &specs).unwrap();
        assert_eq!(
            resolved.fpid(loc("c:main").channel()),
            Some(&fpid("c:main#3"))
        );
    }

    #[test]
    fn test_cycle_within_branch_is_not_a_conflict() {
        let specs = supplier(vec![
            spec("a:main#1", &["b:main#1"]),
            spec("b:main#1", &["a:main#2"]),
        ]);
        let resolved = VersionResolver::resolve(&root(&["a:main#1"]), &specs).unwrap();
        assert_eq!(
            resolved.fpid(loc("a:main").channel()),
            Some(&fpid("a:main#1"))
        );
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_missing_build_reported() {
        let specs = supplier(vec![spec("a:main#1", &["c:main"])]);
        let err = VersionResolver::resolve(&root(&["a:main#1"]), &specs).unwrap_err();
        match err {
            Error::MissingVersion(channels) => {
                assert_eq!(channels, vec![loc("c:main").channel().clone()]);
            }
            other => panic!("expected missing version, got {:?}", other),
        }
    }

    #[test]
    fn test_unversioned_dependency_settled_by_sibling_branch() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main"]),
            spec("b:main#1", &["c:main#1"]),
            spec("c:main#1", &[]),
        ]);
        let resolved = VersionResolver::resolve(&root(&["a:main#1", "b:main#1"]), &specs).unwrap();
        assert_eq!(
            resolved.fpid(loc("c:main").channel()),
            Some(&fpid("c:main#1"))
        );
        assert_eq!(resolved.len(), 3);
    }

    #[test]
    fn test_unversioned_dependency_pinned_by_ancestor() {
        let specs = supplier(vec![
            spec("a:main#1", &["c:main"]),
            spec("c:main#4", &[]),
        ]);
        let resolved = VersionResolver::resolve(&root(&["a:main#1", "c:main#4"]), &specs).unwrap();
        assert_eq!(
            resolved.fpid(loc("c:main").channel()),
            Some(&fpid("c:main#4"))
        );
    }

    #[test]
    fn test_family_substitution() {
        let core = FeaturePackSpec::builder(fpid("core:main#1"))
            .family("runtime")
            .build()
            .unwrap();
        let alt = FeaturePackSpec::builder(fpid("alt-core:main#7"))
            .family("runtime")
            .build()
            .unwrap();
        let specs = supplier(vec![spec("app:main#1", &["core:main#1"]), core, alt]);

        let resolved =
            VersionResolver::resolve(&root(&["alt-core:main#7", "app:main#1"]), &specs).unwrap();
        let core_channel = loc("core:main").channel().clone();
        assert_eq!(resolved.fpid(&core_channel), Some(&fpid("alt-core:main#7")));
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn test_patch_must_target_the_dependency() {
        let patch = FeaturePackSpec::builder(fpid("core-patch:main#1"))
            .patch_for(fpid("core:main#0"))
            .build()
            .unwrap();
        let specs = supplier(vec![spec("core:main#1", &[]), patch]);
        let config = ProvisioningConfig::builder()
            .add_feature_pack(
                FeaturePackConfig::builder(loc("core:main#1"))
                    .add_patch(fpid("core-patch:main#1"))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        assert!(matches!(
            VersionResolver::resolve(&config, &specs),
            Err(Error::Description(_))
        ));
    }
}
