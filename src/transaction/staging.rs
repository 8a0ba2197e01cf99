// src/transaction/staging.rs

//! Materializing a provisioning config into a staging directory

use std::path::Path;

use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::ProvisioningConfig;
use crate::error::{Error, Result};
use crate::feature_pack::{CONTENT_DIR, PACKAGES_DIR, Repository};
use crate::filesystem::copy_tree;
use crate::plugin::{PluginContext, PluginRegistry};
use crate::resolver::{self, ResolvedLayout};

/// A fully built installation waiting to be swapped in
///
/// The directory is removed when this is dropped.
pub(crate) struct StagedInstallation {
    pub dir: TempDir,
    pub layout: ResolvedLayout,
}

impl StagedInstallation {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Resolve `config` and build the resulting tree under `tmp_dir`
pub(crate) fn stage(
    config: &ProvisioningConfig,
    repository: &dyn Repository,
    plugins: &PluginRegistry,
    tmp_dir: &Path,
) -> Result<StagedInstallation> {
    let layout = resolver::resolve(config, repository)?;

    let dir = tempfile::Builder::new()
        .prefix("staging-")
        .tempdir_in(tmp_dir)
        .map_err(|e| Error::io(tmp_dir, e))?;
    let root = dir.path();

    for fp in layout.feature_packs() {
        let mut files = 0;
        for package in &fp.packages {
            let content = fp.dir.join(PACKAGES_DIR).join(package).join(CONTENT_DIR);
            if content.is_dir() {
                files += copy_tree(&content, root)?;
            }
            // Patches overlay the same package's content
            for patch in &fp.patches {
                let content = patch.dir.join(PACKAGES_DIR).join(package).join(CONTENT_DIR);
                if content.is_dir() {
                    files += copy_tree(&content, root)?;
                }
            }
        }
        debug!("Staged {}: {} files", fp.fpid(), files);

        plugins.run(&PluginContext {
            feature_pack: fp,
            options: config.options(),
            staging_dir: root,
        })?;
    }

    info!(
        "Staged {} feature-packs in {}",
        layout.len(),
        root.display()
    );
    Ok(StagedInstallation { dir, layout })
}
