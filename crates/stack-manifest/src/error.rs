//! Error types for stack-manifest

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors raised while reading a stack manifest.
///
/// All of these are fatal for the stack they concern: a manifest that cannot
/// be read is never treated as declaring zero dependencies.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Manifest file does not exist
    #[error("Manifest not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Manifest exists but could not be read
    #[error("Failed to read manifest {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest is not valid TOML, or a known table has the wrong shape
    #[error("Failed to parse manifest {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Neither `[tool.poetry]` nor `[project]` is present
    #[error("Manifest {} declares neither [tool.poetry] nor [project]", path.display())]
    UnknownSchema { path: PathBuf },

    /// The detected schema lacks a field it cannot do without
    #[error("Manifest {} is missing required field `{field}`", path.display())]
    MissingField { path: PathBuf, field: &'static str },

    /// Caller asked for a group the manifest does not define
    #[error("Group '{group}' is not defined in {}", path.display())]
    UnknownGroup { path: PathBuf, group: String },
}

/// Errors raised while discovering stacks or expanding the case matrix.
#[derive(Error, Debug)]
pub enum MatrixError {
    /// The stacks root exists but could not be listed
    #[error("Failed to scan stacks directory {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stack's manifest is broken
    #[error("Stack '{stack}': {source}")]
    Manifest {
        stack: String,
        #[source]
        source: ManifestError,
    },

    /// Two cases ended up with the same `<stack>-<group>` id
    #[error("Duplicate case id '{id}' produced by stacks '{first}' and '{second}'")]
    DuplicateCaseId {
        id: String,
        first: String,
        second: String,
    },
}
