// src/transaction/mod.rs

//! Transactional provisioning of an installation directory
//!
//! Every state change (install, uninstall, provision, apply, undo) runs the
//! same pipeline. Nothing outside the state directory changes until the swap.
//!
//! - **Staging**: resolve the new config and build the full tree under
//!   `.installation/tmp/staging-*`
//! - **Diffing**: compare the snapshot recorded after the last apply with the
//!   live tree to find user changes
//! - **Replaying**: carry those changes onto the staged tree
//! - **Swapping**: journaled renames of top-level entries, recovered on the
//!   next [`InstallationManager::open`] if interrupted
//!
//! # Apply Lifecycle
//!
//! ```text
//! IDLE -> STAGING -> DIFFING -> REPLAYING -> SWAPPING -> DONE
//!   ^__________________ any failure ___________________|
//! ```
//!
//! # State Directory
//!
//! ```text
//! <home>/.installation/
//!   provisioning.toml     current provisioning config
//!   baseline.snapshot     hashes of the tree as last provisioned
//!   history/              undo history
//!   tmp/                  staging trees, swap journals and work dirs
//! ```

pub mod history;
pub mod journal;
mod recovery;
mod staging;
mod swap;

pub use history::{DEFAULT_HISTORY_LIMIT, HistoryEntry, StateHistory};
pub use journal::{SwapJournal, SwapRecord};
pub use recovery::RecoveryOutcome;

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{FeaturePackConfig, ProvisioningConfig};
use crate::error::{Error, Result};
use crate::feature_pack::{Repository, UpdateSource};
use crate::filesystem::{FsDiff, FsTree, ReplayReport, copy_tree, remove_entry};
use crate::hash::HashAlgorithm;
use crate::location::{Fpid, Location, Producer};
use crate::plugin::PluginRegistry;
use crate::resolver::ResolvedLayout;

/// Name of the state directory inside the installation
pub const STATE_DIR: &str = ".installation";

/// Current provisioning config inside the state directory
pub const PROVISIONING_FILE: &str = "provisioning.toml";

const BASELINE_FILE: &str = "baseline.snapshot";
const HISTORY_DIR: &str = "history";
const TMP_DIR: &str = "tmp";

/// Write a file atomically: temp file in the same directory, fsync, rename
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(|e| Error::io(parent, e))?;
    temp.write_all(content)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| Error::io(temp.path(), e))?;
    temp.persist(path).map_err(|e| Error::io(path, e.error))?;
    Ok(())
}

/// Move a file or directory, falling back to copy+sync+delete across filesystems
///
/// This handles the EXDEV error that occurs when source and destination are on
/// different filesystems.
pub(crate) fn move_entry(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "Cross-filesystem move detected ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );
            let metadata = fs::symlink_metadata(src).map_err(|e| Error::io(src, e))?;
            if metadata.is_dir() {
                fs::create_dir_all(dst).map_err(|e| Error::io(dst, e))?;
                copy_tree(src, dst)?;
            } else {
                crate::filesystem::copy_entry(src, dst)?;
                if !metadata.file_type().is_symlink() {
                    let file = File::open(dst).map_err(|e| Error::io(dst, e))?;
                    file.sync_all().map_err(|e| Error::io(dst, e))?;
                }
            }
            if let Some(parent) = dst.parent()
                && let Ok(dir) = File::open(parent)
            {
                // Not every filesystem supports directory fsync
                let _ = dir.sync_all();
            }
            remove_entry(src)
        }
        Err(e) => Err(Error::io(src, e)),
    }
}

/// Installation manager configuration
#[derive(Debug, Clone)]
pub struct InstallationConfig {
    /// Installation directory
    pub home: PathBuf,
    /// Record baseline snapshots and undo history
    pub record_state: bool,
    /// Maximum number of past states kept for undo
    pub history_limit: usize,
    /// Hash algorithm for snapshots
    pub hash_algorithm: HashAlgorithm,
}

impl InstallationConfig {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            record_state: true,
            history_limit: DEFAULT_HISTORY_LIMIT,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }

    pub fn with_record_state(mut self, record: bool) -> Self {
        self.record_state = record;
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn with_hash_algorithm(mut self, algorithm: HashAlgorithm) -> Self {
        self.hash_algorithm = algorithm;
        self
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join(STATE_DIR)
    }

    pub fn provisioning_file(&self) -> PathBuf {
        self.state_dir().join(PROVISIONING_FILE)
    }

    fn baseline_file(&self) -> PathBuf {
        self.state_dir().join(BASELINE_FILE)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.state_dir().join(TMP_DIR)
    }
}

/// Apply pipeline phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Idle,
    Staging,
    Diffing,
    Replaying,
    Swapping,
    Done,
}

/// A newer build for one installed feature-pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturePackUpdate {
    pub producer: Producer,
    pub current: Fpid,
    pub latest: Fpid,
}

/// Updates available for an installation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdatePlan {
    updates: Vec<FeaturePackUpdate>,
}

impl UpdatePlan {
    pub fn new(updates: Vec<FeaturePackUpdate>) -> Self {
        Self { updates }
    }

    pub fn updates(&self) -> &[FeaturePackUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }
}

/// Result of a successful apply
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub layout: ResolvedLayout,
    /// User changes carried onto the new tree
    pub replay: ReplayReport,
    /// History entry recorded for the state that was replaced
    pub history_entry: Option<HistoryEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Change,
    Undo,
}

/// Provisions one installation directory
pub struct InstallationManager {
    config: InstallationConfig,
    repository: Box<dyn Repository>,
    plugins: PluginRegistry,
    history: StateHistory,
    provisioning: Option<ProvisioningConfig>,
    state: ApplyState,
}

impl InstallationManager {
    /// Open an installation, recovering any interrupted swap
    ///
    /// `home` may be missing or empty. A non-empty directory that was not
    /// provisioned by this crate is refused.
    pub fn open(
        config: InstallationConfig,
        repository: Box<dyn Repository>,
        plugins: PluginRegistry,
    ) -> Result<Self> {
        let home = &config.home;
        let provisioning_file = config.provisioning_file();
        if home.is_dir() && !provisioning_file.exists() && !swap::top_level_entries(home)?.is_empty() {
            return Err(Error::Description(format!(
                "{} is not empty and was not provisioned",
                home.display()
            )));
        }

        let tmp_dir = config.tmp_dir();
        fs::create_dir_all(&tmp_dir).map_err(|e| Error::io(&tmp_dir, e))?;
        for outcome in recovery::recover_all(home, &tmp_dir)? {
            if let RecoveryOutcome::Corrupted { swap_id, error } = outcome {
                warn!("Swap {} could not be recovered: {}", swap_id, error);
            }
        }

        let provisioning = if provisioning_file.exists() {
            Some(ProvisioningConfig::load(&provisioning_file)?)
        } else {
            None
        };
        let history = StateHistory::open(&config.state_dir().join(HISTORY_DIR), config.history_limit)?;

        info!(
            "Opened installation {} ({})",
            home.display(),
            if provisioning.is_some() { "provisioned" } else { "empty" }
        );
        Ok(Self {
            config,
            repository,
            plugins,
            history,
            provisioning,
            state: ApplyState::Idle,
        })
    }

    pub fn config(&self) -> &InstallationConfig {
        &self.config
    }

    pub fn state(&self) -> ApplyState {
        self.state
    }

    /// Current provisioning config, if the installation was provisioned
    pub fn provisioning_config(&self) -> Option<&ProvisioningConfig> {
        self.provisioning.as_ref()
    }

    pub fn history(&self) -> &StateHistory {
        &self.history
    }

    /// Whether a recorded state exists; an unreadable history counts as none
    pub fn is_undo_available(&self) -> bool {
        match self.history.is_empty() {
            Ok(empty) => !empty,
            Err(e) => {
                warn!("Failed to read undo history: {}", e);
                false
            }
        }
    }

    pub fn set_state_history_limit(&mut self, limit: usize) -> Result<()> {
        self.config.history_limit = limit;
        self.history.set_limit(limit)
    }

    /// Install a feature-pack, keeping any customization of its producer
    pub fn install(&mut self, location: Location) -> Result<ApplyOutcome> {
        if !location.has_build() {
            return Err(Error::MissingVersion(vec![location.channel().clone()]));
        }
        let current = self.current_or_empty();
        let fp = match current.feature_pack(location.producer()) {
            Some(existing) => existing.with_location(location),
            None => FeaturePackConfig::new(location),
        };
        let updated = current.with_feature_pack(fp)?;
        self.apply_config(updated, Intent::Change)
    }

    pub fn uninstall(&mut self, producer: &Producer) -> Result<ApplyOutcome> {
        let updated = self.current_or_empty().without_producer(producer)?;
        self.apply_config(updated, Intent::Change)
    }

    /// Replace the whole provisioning config
    pub fn provision(&mut self, config: ProvisioningConfig) -> Result<ApplyOutcome> {
        config.validate()?;
        self.apply_config(config, Intent::Change)
    }

    /// Move installed feature-packs to the builds named in `plan`
    pub fn apply(&mut self, plan: &UpdatePlan) -> Result<ApplyOutcome> {
        let mut updated = self.current_or_empty();
        for update in plan.updates() {
            let fp = updated.feature_pack(&update.producer).ok_or_else(|| {
                Error::NotFound(format!("feature-pack {} is not installed", update.producer))
            })?;
            let location = match update.latest.build() {
                Some(build) => fp.location().with_build(build),
                None => update.latest.location(),
            };
            let fp = fp.with_location(location);
            updated = updated.with_feature_pack(fp)?;
        }
        self.apply_config(updated, Intent::Change)
    }

    /// Return to the most recent recorded state
    pub fn undo(&mut self) -> Result<ApplyOutcome> {
        let Some((entry, config)) = self.history.latest()? else {
            return Err(Error::UndoUnavailable);
        };
        info!("Undoing to state {} from {}", entry.id, entry.timestamp);
        let outcome = self.apply_config(config, Intent::Undo)?;
        if let Err(e) = self.history.remove(&entry.id) {
            warn!("Failed to drop consumed history entry {}: {}", entry.id, e);
        }
        Ok(outcome)
    }

    /// Newer builds for the installed feature-packs
    pub fn get_updates(&self, source: &dyn UpdateSource) -> Result<UpdatePlan> {
        let Some(current) = &self.provisioning else {
            return Ok(UpdatePlan::default());
        };
        let mut updates = Vec::new();
        for fp in current.feature_packs() {
            let location = fp.location();
            let Some(latest) = source.latest_build(location.channel())? else {
                continue;
            };
            let installed = location.fpid();
            if latest != installed {
                debug!("Update available: {} -> {}", installed, latest);
                updates.push(FeaturePackUpdate {
                    producer: location.producer().clone(),
                    current: installed,
                    latest,
                });
            }
        }
        Ok(UpdatePlan::new(updates))
    }

    /// Write the current provisioning config to `path`
    pub fn export_config(&self, path: &Path) -> Result<()> {
        let current = self
            .provisioning
            .as_ref()
            .ok_or_else(|| Error::NotFound("installation is not provisioned".to_string()))?;
        current.save(path)
    }

    fn current_or_empty(&self) -> ProvisioningConfig {
        self.provisioning.clone().unwrap_or_default()
    }

    fn apply_config(&mut self, config: ProvisioningConfig, intent: Intent) -> Result<ApplyOutcome> {
        let result = self.run_apply(config, intent);
        self.state = match &result {
            Ok(_) => ApplyState::Done,
            Err(e) => {
                warn!("Apply failed: {}", e);
                ApplyState::Idle
            }
        };
        result
    }

    fn run_apply(&mut self, config: ProvisioningConfig, intent: Intent) -> Result<ApplyOutcome> {
        let home = self.config.home.clone();
        let tmp_dir = self.config.tmp_dir();
        let baseline_file = self.config.baseline_file();

        self.state = ApplyState::Staging;
        let staged = staging::stage(&config, self.repository.as_ref(), &self.plugins, &tmp_dir)
            .map_err(staging_error)?;

        self.state = ApplyState::Diffing;
        let diff = if self.config.record_state && self.provisioning.is_some() && baseline_file.exists() {
            Some(self.user_changes(&home, &baseline_file).map_err(|e| Error::DiffFailed(Box::new(e)))?)
        } else {
            None
        };

        self.state = ApplyState::Replaying;
        let replay = match &diff {
            Some(diff) => diff
                .replay(staged.path())
                .map_err(|e| Error::StagingFailed(Box::new(e)))?,
            None => ReplayReport::default(),
        };
        if !replay.conflicts.is_empty() {
            info!(
                "{} locally modified files also changed upstream; new versions saved with .new suffix",
                replay.conflicts.len()
            );
        }

        self.state = ApplyState::Swapping;
        swap::swap_into(&home, staged.path(), &tmp_dir)?;

        let previous = self.provisioning.replace(config.clone());
        if let Err(e) = self.record_new_state(&config, &home, &baseline_file) {
            // The live tree is the new one; a stale baseline would replay it as user changes
            if let Err(cleanup) = remove_entry(&baseline_file) {
                warn!("Failed to drop stale baseline snapshot: {}", cleanup);
            }
            return Err(Error::SwapFailed {
                home,
                message: format!("new installation is live but its state was not recorded: {}", e),
                rolled_back: false,
            });
        }

        let history_entry = match previous {
            Some(previous) if self.config.record_state && intent == Intent::Change => {
                match self.history.push(&previous, &replay, &describe(&config)) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Failed to record undo history: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };

        info!(
            "Provisioned {} with {} feature-packs",
            home.display(),
            staged.layout.len()
        );
        Ok(ApplyOutcome {
            layout: staged.layout,
            replay,
            history_entry,
        })
    }

    /// Persist the provisioning config and baseline describing the swapped-in tree
    fn record_new_state(
        &self,
        config: &ProvisioningConfig,
        home: &Path,
        baseline_file: &Path,
    ) -> Result<()> {
        config.save(&self.config.provisioning_file())?;
        if self.config.record_state {
            FsTree::snapshot_excluding(home, self.config.hash_algorithm, &[STATE_DIR])?
                .persist(baseline_file)
        } else {
            remove_entry(baseline_file)
        }
    }

    fn user_changes(&self, home: &Path, baseline_file: &Path) -> Result<FsDiff> {
        let baseline = FsTree::load(baseline_file)?;
        let live = FsTree::snapshot_excluding(home, baseline.algorithm(), &[STATE_DIR])?;
        FsDiff::compute_with_suppressed(&baseline, &live, &[STATE_DIR])
    }
}

/// Resolution errors pass through; everything else aborts staging
fn staging_error(e: Error) -> Error {
    match e {
        Error::MalformedLocation { .. }
        | Error::Description(_)
        | Error::VersionConflict(_)
        | Error::MissingVersion(_) => e,
        other => Error::StagingFailed(Box::new(other)),
    }
}

fn describe(config: &ProvisioningConfig) -> String {
    let locations: Vec<String> = config
        .feature_packs()
        .iter()
        .map(|fp| fp.location().to_string())
        .collect();
    if locations.is_empty() {
        "empty installation".to_string()
    } else {
        format!("replaced by {}", locations.join(", "))
    }
}
