// src/transaction/swap.rs

//! Swapping a staged tree into the live installation
//!
//! # Swap Lifecycle
//!
//! ```text
//! BEGIN -> old entries moved aside -> OLD_MOVED -> staged entries moved in -> COMMITTED -> cleanup
//!                                                                                 ^
//!                                                        Point of no return (roll forward after)
//! ```
//!
//! Only top-level entries move, so each step is one rename per entry. The
//! state directory never moves.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::filesystem::remove_entry;

use super::journal::{SwapJournal, SwapRecord};
use super::{STATE_DIR, move_entry};

/// Work directory of a swap, holding the old entries under `old/`
pub(crate) fn work_dir(tmp_dir: &Path, swap_id: &str) -> PathBuf {
    tmp_dir.join(format!("swap-{}", swap_id))
}

/// Sorted top-level names of `dir`, the state directory excluded
pub(crate) fn top_level_entries(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != STATE_DIR {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Replace the contents of `home` with the contents of `staged`
pub(crate) fn swap_into(home: &Path, staged: &Path, tmp_dir: &Path) -> Result<()> {
    swap_with(home, staged, tmp_dir, move_entry)
}

/// [`swap_into`] with the mover used for staged entries
fn swap_with<F>(home: &Path, staged: &Path, tmp_dir: &Path, mut move_in: F) -> Result<()>
where
    F: FnMut(&Path, &Path) -> Result<()>,
{
    let swap_id = Uuid::new_v4().to_string();
    let work = work_dir(tmp_dir, &swap_id);
    let old_dir = work.join("old");
    let failed = |message: String, rolled_back: bool| Error::SwapFailed {
        home: home.to_path_buf(),
        message,
        rolled_back,
    };

    let old_entries = top_level_entries(home).map_err(|e| failed(e.to_string(), true))?;
    let new_entries = top_level_entries(staged).map_err(|e| failed(e.to_string(), true))?;
    fs::create_dir_all(&old_dir).map_err(|e| failed(Error::io(&old_dir, e).to_string(), true))?;

    let mut journal =
        SwapJournal::create(tmp_dir, &swap_id).map_err(|e| failed(e.to_string(), true))?;
    journal
        .write_barrier(&SwapRecord::Begin {
            swap_id: swap_id.clone(),
            home: home.to_path_buf(),
            staged: staged.to_path_buf(),
            old_entries: old_entries.clone(),
            new_entries: new_entries.clone(),
            timestamp: Utc::now(),
        })
        .map_err(|e| failed(e.to_string(), true))?;

    debug!(
        "Swap {}: {} old entries out, {} new entries in",
        swap_id,
        old_entries.len(),
        new_entries.len()
    );

    let mut moved_out = Vec::new();
    for name in &old_entries {
        if let Err(e) = move_entry(&home.join(name), &old_dir.join(name)) {
            let rolled_back = restore_old(home, &old_dir, &moved_out).is_ok();
            settle(journal, &work, rolled_back);
            return Err(failed(e.to_string(), rolled_back));
        }
        moved_out.push(name.clone());
    }
    if let Err(e) = journal.write_barrier(&SwapRecord::OldMoved) {
        let rolled_back = restore_old(home, &old_dir, &moved_out).is_ok();
        settle(journal, &work, rolled_back);
        return Err(failed(e.to_string(), rolled_back));
    }

    let mut moved_in = Vec::new();
    for name in &new_entries {
        if let Err(e) = move_in(&staged.join(name), &home.join(name)) {
            let rolled_back = remove_new(home, staged, &moved_in).is_ok()
                && restore_old(home, &old_dir, &moved_out).is_ok();
            settle(journal, &work, rolled_back);
            return Err(failed(e.to_string(), rolled_back));
        }
        moved_in.push(name.clone());
    }
    if let Err(e) = journal.write_barrier(&SwapRecord::Committed) {
        let rolled_back = remove_new(home, staged, &moved_in).is_ok()
            && restore_old(home, &old_dir, &moved_out).is_ok();
        settle(journal, &work, rolled_back);
        return Err(failed(e.to_string(), rolled_back));
    }

    info!("Swapped {} entries into {}", new_entries.len(), home.display());
    settle(journal, &work, true);
    Ok(())
}

/// Move old entries from the work directory back into `home`
pub(crate) fn restore_old(home: &Path, old_dir: &Path, names: &[String]) -> Result<()> {
    for name in names.iter().rev() {
        let source = old_dir.join(name);
        if source.symlink_metadata().is_err() {
            continue;
        }
        let target = home.join(name);
        remove_entry(&target)?;
        move_entry(&source, &target)?;
    }
    Ok(())
}

/// Return moved-in entries to the staging directory
fn remove_new(home: &Path, staged: &Path, names: &[String]) -> Result<()> {
    for name in names.iter().rev() {
        move_entry(&home.join(name), &staged.join(name))?;
    }
    Ok(())
}

/// Drop the work directory and journal once the outcome is final
///
/// After a failed rollback both stay behind for recovery.
fn settle(journal: SwapJournal, work: &Path, rolled_back: bool) {
    if !rolled_back {
        warn!(
            "Swap rollback incomplete; leaving {} for recovery",
            journal.path().display()
        );
        return;
    }
    if let Err(e) = remove_entry(work) {
        warn!("Failed to remove swap work directory: {}", e);
    }
    if let Err(e) = journal.delete() {
        warn!("Failed to remove swap journal: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::journal::find_journals;
    use tempfile::TempDir;

    #[test]
    fn test_swap_replaces_everything_but_state_dir() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let tmp = home.join(STATE_DIR).join("tmp");
        let staged = tmp.join("staging-1");
        fs::create_dir_all(home.join("old-dir")).unwrap();
        fs::write(home.join("old-dir/file"), b"old").unwrap();
        fs::write(home.join("shared"), b"old").unwrap();
        fs::create_dir_all(&staged).unwrap();
        fs::write(staged.join("shared"), b"new").unwrap();
        fs::write(staged.join("added"), b"new").unwrap();

        swap_into(&home, &staged, &tmp).unwrap();

        assert!(!home.join("old-dir").exists());
        assert_eq!(fs::read(home.join("shared")).unwrap(), b"new");
        assert_eq!(fs::read(home.join("added")).unwrap(), b"new");
        assert!(home.join(STATE_DIR).exists());
        // Work directory and journal are gone
        assert_eq!(
            top_level_entries(&tmp).unwrap(),
            vec!["staging-1".to_string()]
        );
        assert!(fs::read_dir(&staged).unwrap().next().is_none());
    }

    #[test]
    fn test_failed_move_in_restores_old_tree() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home");
        let tmp = home.join(STATE_DIR).join("tmp");
        let staged = tmp.join("staging-1");
        fs::create_dir_all(home.join("bin")).unwrap();
        fs::write(home.join("bin/app"), b"old").unwrap();
        fs::write(home.join("notes"), b"mine").unwrap();
        fs::create_dir_all(staged.join("bin")).unwrap();
        fs::write(staged.join("bin/app"), b"new").unwrap();
        fs::write(staged.join("lib"), b"new").unwrap();

        // "bin" moves in, then "lib" fails
        let err = swap_with(&home, &staged, &tmp, |src, dst| {
            if src.ends_with("lib") {
                return Err(Error::io(src, std::io::Error::other("device busy")));
            }
            move_entry(src, dst)
        })
        .unwrap_err();

        match err {
            Error::SwapFailed { rolled_back, .. } => assert!(rolled_back),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(home.join("bin/app")).unwrap(), b"old");
        assert_eq!(fs::read(home.join("notes")).unwrap(), b"mine");
        assert!(!home.join("lib").exists());
        // Staged entries are back in place and the journal is gone
        assert_eq!(fs::read(staged.join("bin/app")).unwrap(), b"new");
        assert!(staged.join("lib").exists());
        assert!(find_journals(&tmp).unwrap().is_empty());
        assert_eq!(
            top_level_entries(&tmp).unwrap(),
            vec!["staging-1".to_string()]
        );
    }

    #[test]
    fn test_top_level_entries_sorted() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join(STATE_DIR)).unwrap();
        fs::write(temp.path().join("b"), b"").unwrap();
        fs::write(temp.path().join("a"), b"").unwrap();
        assert_eq!(
            top_level_entries(temp.path()).unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
    }
}
