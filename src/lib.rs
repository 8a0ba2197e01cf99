// src/lib.rs

//! Keel: feature-pack provisioning engine
//!
//! Installs layered feature-packs into an installation directory and keeps
//! it consistent across upgrades and undo.
//!
//! # Architecture
//!
//! - Identities: `producer[@universe]:channel[/frequency][#build]` locations
//! - Resolution: version pinning along dependency branches, then package and
//!   config selection filtered through a stack of customizations
//! - Snapshots: hashed trees of the installation to detect user changes
//! - Transactions: stage, diff, replay and swap, with a crash-safe journal and
//!   a bounded undo history

pub mod catalog;
pub mod config;
mod error;
pub mod feature_pack;
pub mod filesystem;
pub mod hash;
pub mod location;
pub mod lock;
pub mod plugin;
pub mod repository;
pub mod resolver;
pub mod transaction;

pub use catalog::{CatalogWarmer, DEFAULT_SHUTDOWN_GRACE};
pub use config::{ConfigId, FeaturePackConfig, ProvisioningConfig};
pub use error::{ChannelConflict, Error, Result};
pub use feature_pack::{
    ArtifactResolver, FeaturePackSpec, PackageSpec, Repository, SpecSupplier, UpdateSource,
};
pub use filesystem::{DiffStatus, FsDiff, FsTree, ReplayDecision, ReplayReport};
pub use hash::{Hash, HashAlgorithm, Hasher};
pub use location::{Channel, Fpid, Location, Producer};
pub use lock::InstallationLock;
pub use plugin::{PluginContext, PluginHook, PluginRegistry};
pub use repository::LocalRepository;
pub use resolver::{DependencyStack, ResolvedFeaturePack, ResolvedLayout, VersionResolver};
pub use transaction::{
    ApplyOutcome, ApplyState, FeaturePackUpdate, HistoryEntry, InstallationConfig,
    InstallationManager, RecoveryOutcome, StateHistory, UpdatePlan,
};
