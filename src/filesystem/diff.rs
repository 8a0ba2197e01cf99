// src/filesystem/diff.rs

//! Differences between two snapshots, and replaying them onto a new tree
//!
//! The orchestrator diffs the snapshot recorded after the last apply (the
//! baseline) against the live installation. Whatever the user changed since
//! then is replayed onto the freshly staged tree before it replaces the live
//! one, so local edits survive re-provisioning.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::filesystem::copy_entry;
use crate::filesystem::tree::{EntryId, FsTree};
use crate::hash::{self, Hash};

/// Suffix of a staged file preserved next to a user-modified one
pub const NEW_SUFFIX: &str = ".new";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Removed,
    Modified,
    /// Changed, but deliberately not carried forward
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub status: DiffStatus,
    pub is_dir: bool,
    pub before_hash: Option<Hash>,
    pub after_hash: Option<Hash>,
}

/// What replay decided for one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplayDecision {
    Keep,
    Remove,
}

/// Outcome of [`FsDiff::replay`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub decisions: BTreeMap<String, ReplayDecision>,
    /// Paths where the staged version was kept aside as `<path>.new`
    pub conflicts: Vec<String>,
}

/// Changes from one snapshot to another, keyed by relative path
#[derive(Debug, Clone, Default)]
pub struct FsDiff {
    entries: BTreeMap<String, DiffEntry>,
    source_root: Option<PathBuf>,
}

impl FsDiff {
    pub fn compute(before: &FsTree, after: &FsTree) -> Result<Self> {
        Self::compute_with_suppressed(before, after, &[])
    }

    /// Diff two trees; changes under any `suppressed` path are recorded as
    /// [`DiffStatus::Suppressed`]
    pub fn compute_with_suppressed(
        before: &FsTree,
        after: &FsTree,
        suppressed: &[&str],
    ) -> Result<Self> {
        if before.algorithm() != after.algorithm() {
            return Err(Error::Description(format!(
                "cannot diff {} snapshot against {} snapshot",
                before.algorithm(),
                after.algorithm()
            )));
        }

        let before_paths: BTreeMap<String, EntryId> = before.iter().into_iter().collect();
        let after_paths: BTreeMap<String, EntryId> = after.iter().into_iter().collect();

        // Files present on both sides need hashing, the rest do not
        let common: Vec<(&String, EntryId, EntryId)> = before_paths
            .iter()
            .filter_map(|(path, b)| after_paths.get(path).map(|a| (path, *b, *a)))
            .filter(|(_, b, a)| !before.entry(*b).is_dir() && !after.entry(*a).is_dir())
            .collect();
        let hashed: Vec<(String, Hash, Hash)> = common
            .par_iter()
            .map(|(path, b, a)| Ok(((*path).clone(), before.hash(*b)?.clone(), after.hash(*a)?.clone())))
            .collect::<Result<_>>()?;
        let hashed: BTreeMap<String, (Hash, Hash)> = hashed
            .into_iter()
            .map(|(path, b, a)| (path, (b, a)))
            .collect();

        let is_suppressed = |path: &str| {
            suppressed.iter().any(|s| {
                path == *s || path.strip_prefix(*s).is_some_and(|rest| rest.starts_with('/'))
            })
        };
        let file_hash = |tree: &FsTree, id: EntryId| -> Result<Option<Hash>> {
            if tree.entry(id).is_dir() {
                Ok(None)
            } else {
                Ok(Some(tree.hash(id)?.clone()))
            }
        };

        let mut entries = BTreeMap::new();
        for (path, b) in &before_paths {
            let b_dir = before.entry(*b).is_dir();
            let entry = match after_paths.get(path) {
                None => Some(DiffEntry {
                    status: DiffStatus::Removed,
                    is_dir: b_dir,
                    before_hash: file_hash(before, *b)?,
                    after_hash: None,
                }),
                Some(a) => {
                    let a_dir = after.entry(*a).is_dir();
                    match hashed.get(path) {
                        Some((bh, ah)) if bh != ah => Some(DiffEntry {
                            status: DiffStatus::Modified,
                            is_dir: false,
                            before_hash: Some(bh.clone()),
                            after_hash: Some(ah.clone()),
                        }),
                        Some(_) => None,
                        None if b_dir != a_dir => Some(DiffEntry {
                            status: DiffStatus::Modified,
                            is_dir: a_dir,
                            before_hash: file_hash(before, *b)?,
                            after_hash: file_hash(after, *a)?,
                        }),
                        None => None,
                    }
                }
            };
            if let Some(entry) = entry {
                entries.insert(path.clone(), entry);
            }
        }
        for (path, a) in &after_paths {
            if before_paths.contains_key(path) {
                continue;
            }
            let is_dir = after.entry(*a).is_dir();
            entries.insert(
                path.clone(),
                DiffEntry {
                    status: DiffStatus::Added,
                    is_dir,
                    before_hash: None,
                    after_hash: if is_dir { None } else { Some(after.hash(*a)?.clone()) },
                },
            );
        }

        for (path, entry) in entries.iter_mut() {
            if is_suppressed(path) {
                entry.status = DiffStatus::Suppressed;
            }
        }

        let diff = Self {
            entries,
            source_root: after.root_path().map(Path::to_path_buf),
        };
        debug!(
            "Diff: {} added, {} removed, {} modified",
            diff.with_status(DiffStatus::Added).count(),
            diff.with_status(DiffStatus::Removed).count(),
            diff.with_status(DiffStatus::Modified).count()
        );
        Ok(diff)
    }

    /// True when no path changed, suppressed paths included
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&DiffEntry> {
        self.entries.get(path)
    }

    pub fn status(&self, path: &str) -> Option<DiffStatus> {
        self.entries.get(path).map(|e| e.status)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &DiffEntry)> {
        self.entries.iter().map(|(p, e)| (p.as_str(), e))
    }

    pub fn with_status(&self, status: DiffStatus) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, e)| e.status == status)
            .map(|(p, _)| p.as_str())
    }

    /// Carry the recorded changes onto the tree at `target`
    ///
    /// Added and modified entries are copied from the diff's live root. When
    /// the staged tree also changed a user-modified file, the staged copy is
    /// kept as `<file>.new`. Deletions are carried forward only where the
    /// staged file still equals the baseline.
    pub fn replay(&self, target: &Path) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        if self.is_empty() {
            return Ok(report);
        }
        let Some(source_root) = &self.source_root else {
            return Err(Error::Description(
                "diff has no live tree to replay from".to_string(),
            ));
        };

        for (path, entry) in &self.entries {
            if !matches!(entry.status, DiffStatus::Added | DiffStatus::Modified) {
                continue;
            }
            let dest = target.join(path);
            if entry.is_dir {
                if dest.is_file() || dest.is_symlink() {
                    fs::remove_file(&dest).map_err(|e| Error::io(&dest, e))?;
                }
                fs::create_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;
                report.decisions.insert(path.clone(), ReplayDecision::Keep);
                continue;
            }

            if dest.is_dir() && !dest.is_symlink() {
                fs::remove_dir_all(&dest).map_err(|e| Error::io(&dest, e))?;
            } else if dest.symlink_metadata().is_ok() {
                let staged = hash::hash_file(self.algorithm_of(entry), &dest)?;
                let staged_changed = Some(&staged) != entry.before_hash.as_ref();
                if staged_changed && Some(&staged) != entry.after_hash.as_ref() {
                    let aside = sibling_with_suffix(&dest, NEW_SUFFIX);
                    fs::rename(&dest, &aside).map_err(|e| Error::io(&dest, e))?;
                    info!("Both sides changed {}; staged copy kept as {}", path, aside.display());
                    report.conflicts.push(path.clone());
                }
            }
            copy_entry(&source_root.join(path), &dest)?;
            report.decisions.insert(path.clone(), ReplayDecision::Keep);
        }

        // Children before parents so emptied directories can go too
        for (path, entry) in self.entries.iter().rev() {
            if entry.status != DiffStatus::Removed {
                continue;
            }
            let dest = target.join(path);
            let decision = if dest.symlink_metadata().is_err() {
                ReplayDecision::Remove
            } else if entry.is_dir {
                if dest.is_dir() && is_empty_dir(&dest)? {
                    fs::remove_dir(&dest).map_err(|e| Error::io(&dest, e))?;
                    ReplayDecision::Remove
                } else {
                    ReplayDecision::Keep
                }
            } else {
                let staged = hash::hash_file(self.algorithm_of(entry), &dest)?;
                if Some(&staged) == entry.before_hash.as_ref() {
                    fs::remove_file(&dest).map_err(|e| Error::io(&dest, e))?;
                    ReplayDecision::Remove
                } else {
                    debug!("Keeping {}: the new version changed it", path);
                    ReplayDecision::Keep
                }
            };
            report.decisions.insert(path.clone(), decision);
        }

        Ok(report)
    }

    fn algorithm_of(&self, entry: &DiffEntry) -> hash::HashAlgorithm {
        entry
            .before_hash
            .as_ref()
            .or(entry.after_hash.as_ref())
            .map(Hash::algorithm)
            .unwrap_or_default()
    }
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)
        .map_err(|e| Error::io(path, e))?
        .next()
        .is_none())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use tempfile::TempDir;

    fn write(root: &Path, path: &str, content: &str) {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }

    fn snap(root: &Path) -> FsTree {
        FsTree::snapshot(root, HashAlgorithm::Sha256).unwrap()
    }

    #[test]
    fn test_diff_of_same_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a/b.txt", "b");
        write(temp.path(), "c.txt", "c");
        let diff = FsDiff::compute(&snap(temp.path()), &snap(temp.path())).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_statuses() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        write(root, "keep.txt", "same");
        write(root, "edit.txt", "v1");
        write(root, "gone/file.txt", "x");
        let before = snap(root);

        write(root, "edit.txt", "v2");
        fs::remove_dir_all(root.join("gone")).unwrap();
        write(root, "new/deep/file.txt", "y");
        let diff = FsDiff::compute(&before, &snap(root)).unwrap();

        assert_eq!(diff.status("keep.txt"), None);
        assert_eq!(diff.status("edit.txt"), Some(DiffStatus::Modified));
        assert_eq!(diff.status("gone"), Some(DiffStatus::Removed));
        assert_eq!(diff.status("gone/file.txt"), Some(DiffStatus::Removed));
        assert_eq!(diff.status("new"), Some(DiffStatus::Added));
        assert_eq!(diff.status("new/deep/file.txt"), Some(DiffStatus::Added));
    }

    #[test]
    fn test_suppressed_changes_are_reported_but_not_replayed() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("live");
        let staged = temp.path().join("staged");
        write(&root, "app.txt", "a");
        fs::create_dir_all(&staged).unwrap();
        let before = snap(&root);
        write(&root, ".state/index", "1");

        let diff = FsDiff::compute_with_suppressed(&before, &snap(&root), &[".state"]).unwrap();
        assert_eq!(diff.status(".state"), Some(DiffStatus::Suppressed));
        assert_eq!(diff.status(".state/index"), Some(DiffStatus::Suppressed));
        assert!(!diff.is_empty());

        let report = diff.replay(&staged).unwrap();
        assert!(report.decisions.is_empty());
        assert!(!staged.join(".state").exists());
    }

    #[test]
    fn test_replay_carries_user_changes() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        let staged = temp.path().join("staged");

        write(&live, "conf/app.conf", "v1");
        write(&live, "docs/readme", "docs");
        write(&live, "lib/old.jar", "old");
        let baseline = snap(&live);

        // User edits the config, adds a file, deletes docs
        write(&live, "conf/app.conf", "user");
        write(&live, "extra.txt", "mine");
        fs::remove_dir_all(live.join("docs")).unwrap();
        let diff = FsDiff::compute(&baseline, &snap(&live)).unwrap();

        // New version: config unchanged, docs unchanged, old.jar gone
        write(&staged, "conf/app.conf", "v1");
        write(&staged, "docs/readme", "docs");
        write(&staged, "lib/new.jar", "new");

        let report = diff.replay(&staged).unwrap();
        assert_eq!(fs::read_to_string(staged.join("conf/app.conf")).unwrap(), "user");
        assert_eq!(fs::read_to_string(staged.join("extra.txt")).unwrap(), "mine");
        assert!(!staged.join("docs").exists());
        assert!(report.conflicts.is_empty());
        assert_eq!(report.decisions.get("extra.txt"), Some(&ReplayDecision::Keep));
        assert_eq!(report.decisions.get("docs/readme"), Some(&ReplayDecision::Remove));
        assert_eq!(report.decisions.get("docs"), Some(&ReplayDecision::Remove));
    }

    #[test]
    fn test_replay_keeps_staged_copy_when_both_changed() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        let staged = temp.path().join("staged");

        write(&live, "conf/app.conf", "v1");
        let baseline = snap(&live);
        write(&live, "conf/app.conf", "user");
        let diff = FsDiff::compute(&baseline, &snap(&live)).unwrap();

        write(&staged, "conf/app.conf", "v2");
        let report = diff.replay(&staged).unwrap();
        assert_eq!(fs::read_to_string(staged.join("conf/app.conf")).unwrap(), "user");
        assert_eq!(fs::read_to_string(staged.join("conf/app.conf.new")).unwrap(), "v2");
        assert_eq!(report.conflicts, vec!["conf/app.conf".to_string()]);
    }

    #[test]
    fn test_replay_keeps_deleted_file_changed_upstream() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("live");
        let staged = temp.path().join("staged");

        write(&live, "conf/app.conf", "v1");
        let baseline = snap(&live);
        fs::remove_file(live.join("conf/app.conf")).unwrap();
        let diff = FsDiff::compute(&baseline, &snap(&live)).unwrap();

        write(&staged, "conf/app.conf", "v2");
        let report = diff.replay(&staged).unwrap();
        assert!(staged.join("conf/app.conf").exists());
        assert_eq!(report.decisions.get("conf/app.conf"), Some(&ReplayDecision::Keep));
    }
}
