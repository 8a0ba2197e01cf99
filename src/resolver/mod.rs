// src/resolver/mod.rs

//! Feature-pack graph resolution
//!
//! Resolution runs in two passes over the graph rooted at a
//! [`ProvisioningConfig`]:
//!
//! 1. [`VersionResolver`] pins every channel to one build and fails on
//!    missing builds or conflicting branches.
//! 2. [`LayoutBuilder`] walks the pinned graph with a [`DependencyStack`]
//!    and selects the packages and configs each feature-pack contributes.

pub mod layout;
pub mod stack;
pub mod version;

pub use layout::{LayoutBuilder, ResolvedFeaturePack, ResolvedLayout, ResolvedPatch};
pub use stack::DependencyStack;
pub use version::{ResolvedVersions, VersionResolver};

use tracing::debug;

use crate::config::ProvisioningConfig;
use crate::error::Result;
use crate::feature_pack::Repository;

/// Resolve versions, then the installable layout
pub fn resolve(config: &ProvisioningConfig, repository: &dyn Repository) -> Result<ResolvedLayout> {
    let versions = VersionResolver::resolve(config, repository)?;
    debug!("Resolved {} feature-pack builds", versions.len());
    LayoutBuilder::new(config, &versions, repository).build()
}
