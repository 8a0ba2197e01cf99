// src/repository.rs

//! Feature-packs published to a local directory
//!
//! ```text
//! <root>/<producer[@universe]>/<channel>/<build>/
//!   feature-pack.toml
//!   packages/<package>/content/...
//! ```

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::debug;

use crate::error::{Error, Result};
use crate::feature_pack::{
    ArtifactResolver, CONTENT_DIR, FEATURE_PACK_FILE, FeaturePackSpec, PACKAGES_DIR, SpecSupplier,
    UpdateSource,
};
use crate::location::{Channel, Fpid};
use crate::transaction::write_atomic;

#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a channel's builds
    pub fn channel_dir(&self, channel: &Channel) -> PathBuf {
        self.root
            .join(channel.producer().to_string())
            .join(channel.name())
    }

    /// Directory of one build; `None` for an unversioned id
    pub fn build_dir(&self, fpid: &Fpid) -> Option<PathBuf> {
        fpid.build().map(|build| self.channel_dir(fpid.channel()).join(build))
    }

    /// Where a package's content goes when publishing by hand
    pub fn package_content_dir(&self, fpid: &Fpid, package: &str) -> Result<PathBuf> {
        Ok(self
            .require_build_dir(fpid)?
            .join(PACKAGES_DIR)
            .join(package)
            .join(CONTENT_DIR))
    }

    /// Write a spec into the repository and return its build directory
    pub fn publish(&self, spec: &FeaturePackSpec) -> Result<PathBuf> {
        spec.validate()?;
        let dir = self.require_build_dir(spec.fpid())?;
        write_atomic(&dir.join(FEATURE_PACK_FILE), spec.to_toml_string()?.as_bytes())?;
        debug!("Published {} to {}", spec.fpid(), dir.display());
        Ok(dir)
    }

    /// Builds published on a channel, oldest first
    pub fn builds(&self, channel: &Channel) -> Result<Vec<String>> {
        let dir = self.channel_dir(channel);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut builds = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            if entry.path().join(FEATURE_PACK_FILE).is_file() {
                builds.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        builds.sort_by(|a, b| compare_builds(a, b));
        Ok(builds)
    }

    fn require_build_dir(&self, fpid: &Fpid) -> Result<PathBuf> {
        self.build_dir(fpid)
            .ok_or_else(|| Error::MissingVersion(vec![fpid.channel().clone()]))
    }
}

/// Semantic versions compare as versions and sort after anything else
fn compare_builds(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

impl ArtifactResolver for LocalRepository {
    fn resolve(&self, fpid: &Fpid) -> Result<PathBuf> {
        let dir = self.require_build_dir(fpid)?;
        if !dir.join(FEATURE_PACK_FILE).is_file() {
            return Err(Error::NotFound(format!(
                "feature-pack {} in {}",
                fpid,
                self.root.display()
            )));
        }
        Ok(dir)
    }
}

impl SpecSupplier for LocalRepository {
    fn load_spec(&self, fpid: &Fpid) -> Result<FeaturePackSpec> {
        let path = self.resolve(fpid)?.join(FEATURE_PACK_FILE);
        let content = fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let spec = FeaturePackSpec::from_toml_str(&content)?;
        if spec.fpid() != fpid {
            return Err(Error::Description(format!(
                "{} describes {} instead of {}",
                path.display(),
                spec.fpid(),
                fpid
            )));
        }
        Ok(spec)
    }
}

impl UpdateSource for LocalRepository {
    fn latest_build(&self, channel: &Channel) -> Result<Option<Fpid>> {
        Ok(self.builds(channel)?.pop().map(|build| channel.fpid(build)))
    }
}
