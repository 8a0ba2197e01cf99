// src/error.rs

//! Error types for the provisioning engine
//!
//! Every fallible operation in the crate returns [`Result`]. Variants are
//! grouped by the phase that produces them: identity parsing, description
//! validation, graph resolution, the side-effect free apply phases, and the
//! swap that mutates the live installation.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hash::HashError;
use crate::location::{Channel, Fpid};

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// One channel that resolved to more than one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConflict {
    pub channel: Channel,
    pub fpids: Vec<Fpid>,
}

impl fmt::Display for ChannelConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let builds: Vec<String> = self.fpids.iter().map(|fpid| fpid.to_string()).collect();
        write!(f, "{} resolves to {}", self.channel, builds.join(", "))
    }
}

fn join_conflicts(conflicts: &[ChannelConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_channels(channels: &[Channel]) -> String {
    channels
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn swap_outcome(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        " (rolled back, installation unchanged)"
    } else {
        " (installation may be inconsistent, manual inspection recommended)"
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Unparseable feature-pack location string
    #[error("malformed feature-pack location '{input}': {reason}")]
    MalformedLocation { input: String, reason: String },

    /// Invalid customization or feature-pack description
    #[error("invalid description: {0}")]
    Description(String),

    /// Channels that resolved to more than one build
    #[error("version conflict: {}", join_conflicts(.0))]
    VersionConflict(Vec<ChannelConflict>),

    /// Channels reached without any build
    #[error("missing version for {}", join_channels(.0))]
    MissingVersion(Vec<Channel>),

    /// Staging aborted; the live installation was not touched
    #[error("staging failed: {0}")]
    StagingFailed(#[source] Box<Error>),

    /// Detecting user changes failed; the live installation was not touched
    #[error("failed to diff the installation against its last recorded state: {0}")]
    DiffFailed(#[source] Box<Error>),

    /// Swapping the staged tree into place failed
    #[error("failed to swap the staged installation into {}: {message}{}", .home.display(), swap_outcome(.rolled_back))]
    SwapFailed {
        home: PathBuf,
        message: String,
        rolled_back: bool,
    },

    /// A history entry referenced by the index is unusable
    #[error("undo history entry {id} is corrupted: {reason}")]
    HistoryCorrupted { id: String, reason: String },

    /// No recorded state to return to
    #[error("no undo history is available")]
    UndoUnavailable,

    /// A plugin hook failed while materializing content
    #[error("plugin '{plugin}' failed for {fpid}: {message}")]
    Plugin {
        plugin: String,
        fpid: String,
        message: String,
    },

    /// Another process holds the installation lock
    #[error("installation is locked by another process ({} attempts at {})", .attempts, .path.display())]
    Locked { path: PathBuf, attempts: u32 },

    /// A referenced artifact, producer or entry does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A persisted snapshot or journal failed its integrity check
    #[error("corrupted record in {} at line {line}: {reason}", .path.display())]
    Corrupted {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Hash(#[from] HashError),

    #[error("failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to write TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn malformed(input: &str, reason: impl Into<String>) -> Self {
        Self::MalformedLocation {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised before any side effect on the live installation
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StagingFailed(_) | Self::DiffFailed(_))
    }
}
