//! Stack-Manifest: dependency manifests and the test matrix for stackcheck
//!
//! Reads each stack's `pyproject.toml` in either the Poetry or the PEP 621
//! layout, normalizes it to group names plus bare package names, and expands
//! all stacks under a root into the ordered list of (stack, group) cases.
//!
//! ## Layer 0 - Inputs
//!
//! Focus: deterministic, schema-faithful normalization. Nothing here spawns
//! processes or caches manifests.

pub mod error;
pub mod matrix;
pub mod schema;

pub use error::{ManifestError, MatrixError};
pub use matrix::{
    dependencies_for, discover, expand, groups_for, Case, Matrix, Stack, DEFAULT_MANIFEST_FILE,
};
pub use schema::{
    package_name, Manifest, PoetryDependency, PoetryManifest, ProjectManifest, BASE_GROUP,
};

/// Result type for manifest operations
pub type Result<T> = std::result::Result<T, ManifestError>;
