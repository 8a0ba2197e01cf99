// tests/common/mod.rs

//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use keel::feature_pack::FeaturePackSpecBuilder;
use keel::{
    FeaturePackSpec, Fpid, InstallationConfig, InstallationManager, LocalRepository, Location,
    PluginRegistry,
};
use tempfile::TempDir;

/// A repository and an installation home in one temp directory.
pub struct Fixture {
    _temp: TempDir,
    pub repo: LocalRepository,
    pub home: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = LocalRepository::new(temp.path().join("repo"));
        let home = temp.path().join("home");
        Self {
            _temp: temp,
            repo,
            home,
        }
    }

    /// Publish a spec with `(package, path, content)` files.
    pub fn publish(&self, spec: FeaturePackSpec, files: &[(&str, &str, &str)]) {
        self.repo.publish(&spec).unwrap();
        for (package, path, content) in files {
            let full = self
                .repo
                .package_content_dir(spec.fpid(), package)
                .unwrap()
                .join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
    }

    /// Publish `fpid` with a single default package `base`.
    pub fn publish_simple(&self, fpid: &str, files: &[(&str, &str)]) {
        let files: Vec<(&str, &str, &str)> = files.iter().map(|(p, c)| ("base", *p, *c)).collect();
        self.publish(spec(fpid).build().unwrap(), &files);
    }

    pub fn manager(&self) -> InstallationManager {
        self.manager_with(InstallationConfig::new(&self.home), PluginRegistry::new())
    }

    pub fn manager_with(
        &self,
        config: InstallationConfig,
        plugins: PluginRegistry,
    ) -> InstallationManager {
        InstallationManager::open(config, Box::new(self.repo.clone()), plugins).unwrap()
    }

    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.home.join(path)).ok()
    }

    pub fn write(&self, path: &str, content: &str) {
        let full = self.home.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    pub fn staging_dirs(&self) -> usize {
        let tmp = self.home.join(".installation/tmp");
        fs::read_dir(tmp)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.file_name().to_string_lossy().starts_with("staging-"))
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Spec builder for `fpid` with a default package `base`.
pub fn spec(fpid: &str) -> FeaturePackSpecBuilder {
    FeaturePackSpec::builder(Fpid::parse(fpid).unwrap())
        .add_default_package(keel::PackageSpec::new("base"))
}

pub fn location(s: &str) -> Location {
    Location::parse(s).unwrap()
}

pub fn exists(home: &Path, path: &str) -> bool {
    home.join(path).symlink_metadata().is_ok()
}
