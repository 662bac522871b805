//! Error taxonomy for case execution.

use crate::sandbox::ProvisionStep;
use std::path::PathBuf;

/// Errors raised while spawning or waiting on a subprocess.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting on {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal errors while building a case's sandbox.
///
/// Any of these aborts the case. Nothing is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Failed to create sandbox directory for {case}: {source}")]
    Workdir {
        case: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to {step} for {case} (exit code {exit_code}): {diagnostics}")]
    StepFailed {
        case: String,
        step: ProvisionStep,
        exit_code: i32,
        diagnostics: String,
    },

    #[error("Python executable not found at {}", path.display())]
    InterpreterMissing { path: PathBuf },

    #[error(transparent)]
    Runner(#[from] RunnerError),
}

/// Errors loading the stackcheck configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
