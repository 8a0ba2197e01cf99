// src/transaction/recovery.rs

//! Recovery of swaps interrupted by a crash
//!
//! The key principle is:
//!
//! - Before COMMITTED: roll back (move the old entries back into place)
//! - After COMMITTED: roll forward (the new tree is complete, clean up)
//!
//! Leftover staging directories are removed as well; staging never touches
//! the live tree, so they carry nothing worth keeping.

use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::filesystem::remove_entry;

use super::journal::{self, SwapRecord};
use super::swap::{restore_old, top_level_entries, work_dir};

/// Outcome of recovering one interrupted swap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Swap was rolled back; the previous tree is live again
    RolledBack { swap_id: String, reason: String },
    /// Swap had committed; only cleanup was left
    RolledForward { swap_id: String },
    /// Journal had no usable records
    Clean { swap_id: String },
    /// Journal was unreadable, manual intervention needed
    Corrupted { swap_id: String, error: String },
}

/// Recover every interrupted swap under `tmp_dir`
pub fn recover_all(home: &Path, tmp_dir: &Path) -> Result<Vec<RecoveryOutcome>> {
    let mut outcomes = Vec::new();
    for path in journal::find_journals(tmp_dir)? {
        let outcome = recover_single(home, tmp_dir, &path)?;
        info!("Recovered swap: {:?}", outcome);
        outcomes.push(outcome);
    }
    remove_stale_staging(tmp_dir)?;
    Ok(outcomes)
}

fn recover_single(home: &Path, tmp_dir: &Path, path: &Path) -> Result<RecoveryOutcome> {
    let swap_id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.strip_prefix("swap-"))
        .unwrap_or("unknown")
        .to_string();

    let records = match journal::read_records(path) {
        Ok(records) => records,
        Err(e) => {
            warn!("Unreadable swap journal {}: {}", path.display(), e);
            return Ok(RecoveryOutcome::Corrupted {
                swap_id,
                error: e.to_string(),
            });
        }
    };

    let Some(SwapRecord::Begin { old_entries, .. }) = records.first() else {
        // Crashed before the first barrier: nothing was moved
        remove_entry(&work_dir(tmp_dir, &swap_id))?;
        journal::delete_journal(path)?;
        return Ok(RecoveryOutcome::Clean { swap_id });
    };

    let work = work_dir(tmp_dir, &swap_id);
    let old_dir = work.join("old");
    let committed = records.iter().any(|r| matches!(r, SwapRecord::Committed));
    let old_moved = records.iter().any(|r| matches!(r, SwapRecord::OldMoved));

    let outcome = if committed {
        RecoveryOutcome::RolledForward {
            swap_id: swap_id.clone(),
        }
    } else {
        let reason = if old_moved {
            // Whatever sits in home now came from the staged tree
            for name in top_level_entries(home)? {
                remove_entry(&home.join(name))?;
            }
            "crashed while moving the staged tree in"
        } else {
            "crashed while moving the old tree aside"
        };
        restore_old(home, &old_dir, old_entries).map_err(|e| Error::SwapFailed {
            home: home.to_path_buf(),
            message: format!("recovery of swap {} failed: {}", swap_id, e),
            rolled_back: false,
        })?;
        RecoveryOutcome::RolledBack {
            swap_id: swap_id.clone(),
            reason: reason.to_string(),
        }
    };

    remove_entry(&work)?;
    journal::delete_journal(path)?;
    Ok(outcome)
}

fn remove_stale_staging(tmp_dir: &Path) -> Result<()> {
    if !tmp_dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(tmp_dir).map_err(|e| Error::io(tmp_dir, e))? {
        let path = entry.map_err(|e| Error::io(tmp_dir, e))?.path();
        let is_staging = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("staging-"));
        if is_staging {
            info!("Removing stale staging directory {}", path.display());
            remove_entry(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::STATE_DIR;
    use crate::transaction::journal::SwapJournal;
    use chrono::Utc;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        home: std::path::PathBuf,
        tmp: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let tmp = home.join(STATE_DIR).join("tmp");
        fs::create_dir_all(&tmp).unwrap();
        Fixture {
            _temp: temp,
            home,
            tmp,
        }
    }

    fn begin(f: &Fixture, id: &str) -> SwapJournal {
        let mut journal = SwapJournal::create(&f.tmp, id).unwrap();
        journal
            .write_barrier(&SwapRecord::Begin {
                swap_id: id.to_string(),
                home: f.home.clone(),
                staged: f.tmp.join("staging-x"),
                old_entries: vec!["app".to_string()],
                new_entries: vec!["app".to_string()],
                timestamp: Utc::now(),
            })
            .unwrap();
        journal
    }

    #[test]
    fn test_rollback_before_old_moved() {
        let f = fixture();
        let old = work_dir(&f.tmp, "s1").join("old");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("app"), b"old").unwrap();
        drop(begin(&f, "s1"));

        let outcomes = recover_all(&f.home, &f.tmp).unwrap();
        assert!(matches!(outcomes[0], RecoveryOutcome::RolledBack { .. }));
        assert_eq!(fs::read(f.home.join("app")).unwrap(), b"old");
        assert!(!work_dir(&f.tmp, "s1").exists());
    }

    #[test]
    fn test_rollback_after_old_moved_removes_new_entries() {
        let f = fixture();
        let old = work_dir(&f.tmp, "s2").join("old");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("app"), b"old").unwrap();
        fs::write(f.home.join("app"), b"half-new").unwrap();
        let mut journal = begin(&f, "s2");
        journal.write_barrier(&SwapRecord::OldMoved).unwrap();
        drop(journal);

        recover_all(&f.home, &f.tmp).unwrap();
        assert_eq!(fs::read(f.home.join("app")).unwrap(), b"old");
        assert!(journal::find_journals(&f.tmp).unwrap().is_empty());
    }

    #[test]
    fn test_roll_forward_after_commit() {
        let f = fixture();
        let old = work_dir(&f.tmp, "s3").join("old");
        fs::create_dir_all(&old).unwrap();
        fs::write(old.join("app"), b"old").unwrap();
        fs::write(f.home.join("app"), b"new").unwrap();
        let mut journal = begin(&f, "s3");
        journal.write_barrier(&SwapRecord::OldMoved).unwrap();
        journal.write_barrier(&SwapRecord::Committed).unwrap();
        drop(journal);

        let outcomes = recover_all(&f.home, &f.tmp).unwrap();
        assert_eq!(
            outcomes,
            vec![RecoveryOutcome::RolledForward {
                swap_id: "s3".to_string()
            }]
        );
        assert_eq!(fs::read(f.home.join("app")).unwrap(), b"new");
        assert!(!work_dir(&f.tmp, "s3").exists());
    }

    #[test]
    fn test_stale_staging_removed() {
        let f = fixture();
        fs::create_dir_all(f.tmp.join("staging-abc/bin")).unwrap();
        assert!(recover_all(&f.home, &f.tmp).unwrap().is_empty());
        assert!(!f.tmp.join("staging-abc").exists());
    }
}
