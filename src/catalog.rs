// src/catalog.rs

//! Background warm-up of update lookups
//!
//! [`CatalogWarmer`] asks an [`UpdateSource`] for the latest build of each
//! channel on a worker thread so a later `get_updates` answers from memory.
//! Lookups are best effort: failures are logged and the channel falls back
//! to a direct lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::feature_pack::UpdateSource;
use crate::location::{Channel, Fpid};

/// How long `shutdown` waits for the worker by default
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Cache = Arc<Mutex<HashMap<Channel, Option<Fpid>>>>;

fn lock(cache: &Cache) -> MutexGuard<'_, HashMap<Channel, Option<Fpid>>> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CatalogWarmer {
    source: Arc<dyn UpdateSource + Send + Sync>,
    closed: Arc<AtomicBool>,
    cache: Cache,
    done: mpsc::Receiver<()>,
    worker: Option<JoinHandle<()>>,
}

impl CatalogWarmer {
    /// Start looking up `channels` in the background
    pub fn spawn(source: Arc<dyn UpdateSource + Send + Sync>, channels: Vec<Channel>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let cache: Cache = Arc::default();
        let (done_tx, done) = mpsc::channel();

        let worker = {
            let source = Arc::clone(&source);
            let closed = Arc::clone(&closed);
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                debug!("Catalog warmer started for {} channels", channels.len());
                for channel in channels {
                    if closed.load(Ordering::SeqCst) {
                        debug!("Catalog warmer closed early");
                        break;
                    }
                    match source.latest_build(&channel) {
                        Ok(latest) => {
                            lock(&cache).insert(channel, latest);
                        }
                        Err(e) => warn!("Catalog lookup for {} failed: {}", channel, e),
                    }
                }
                let _ = done_tx.send(());
            })
        };

        Self {
            source,
            closed,
            cache,
            done,
            worker: Some(worker),
        }
    }

    /// Channels looked up so far
    pub fn warmed(&self) -> usize {
        lock(&self.cache).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the warmer and wait up to `grace` for the worker to stop
    ///
    /// Returns `false` when the worker was still busy after the grace
    /// period; it is then left to finish its current lookup on its own.
    pub fn shutdown(&mut self, grace: Duration) -> bool {
        self.closed.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return true;
        };
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.join().is_err() {
                    warn!("Catalog warmer thread panicked");
                }
                info!("Catalog warmer stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("Catalog warmer did not stop within {:?}", grace);
                false
            }
        }
    }
}

impl UpdateSource for CatalogWarmer {
    fn latest_build(&self, channel: &Channel) -> Result<Option<Fpid>> {
        if let Some(latest) = lock(&self.cache).get(channel) {
            return Ok(latest.clone());
        }
        self.source.latest_build(channel)
    }
}

impl Drop for CatalogWarmer {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
