// src/lock.rs

//! Exclusive lock on an installation
//!
//! The engine itself assumes callers serialize applies on one home. Processes
//! that share an installation take this lock around their
//! [`InstallationManager`](crate::InstallationManager) calls.
//!
//! ```ignore
//! let _lock = InstallationLock::acquire(&home)?;
//! manager.install(location)?;
//! // released on drop
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::transaction::STATE_DIR;

/// Lock file inside the state directory
pub const LOCK_FILE: &str = "keel.lock";

const MAX_RETRIES: u32 = 5;

/// Exclusive `flock` on `<home>/.installation/keel.lock`
#[derive(Debug)]
pub struct InstallationLock {
    file: File,
    path: PathBuf,
}

impl InstallationLock {
    /// Acquire the lock, retrying with exponential backoff
    ///
    /// Waits 100ms, 200ms, 400ms and 800ms between the five attempts.
    pub fn acquire(home: &Path) -> Result<Self> {
        let path = Self::path_for(home);
        let file = open_lock_file(&path)?;

        for attempt in 0..MAX_RETRIES {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    info!("Acquired installation lock at {}", path.display());
                    return Ok(Self { file, path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    debug!("Installation lock busy (attempt {})", attempt + 1);
                    if attempt < MAX_RETRIES - 1 {
                        std::thread::sleep(Duration::from_millis(100 * (1 << attempt)));
                    }
                }
                Err(e) => return Err(Error::io(&path, e)),
            }
        }
        Err(Error::Locked {
            path,
            attempts: MAX_RETRIES,
        })
    }

    /// Try once without waiting; `None` when another holder has it
    pub fn try_acquire(home: &Path) -> Result<Option<Self>> {
        let path = Self::path_for(home);
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::io(&path, e)),
        }
    }

    pub fn path_for(home: &Path) -> PathBuf {
        home.join(STATE_DIR).join(LOCK_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallationLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!("Released installation lock at {}", self.path.display());
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| Error::io(path, e))
}
