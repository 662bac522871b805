//! stackcheck configuration.
//!
//! Loaded from `stackcheck.toml` when present; every field has a default so
//! an empty or missing file is a valid configuration.

use crate::error::ConfigError;
use crate::sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};
use stack_manifest::DEFAULT_MANIFEST_FILE;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Config file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stackcheck.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StackcheckConfig {
    /// Directory whose subdirectories are stacks.
    pub stacks_dir: PathBuf,
    /// Manifest file name inside each stack.
    pub manifest_file: String,
    /// Per-package import timeout in seconds.
    pub import_timeout_secs: u64,
    pub sandbox: SandboxConfig,
}

impl Default for StackcheckConfig {
    fn default() -> Self {
        Self {
            stacks_dir: PathBuf::from("stacks"),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            import_timeout_secs: crate::imports::IMPORT_TIMEOUT.as_secs(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl StackcheckConfig {
    /// Parse a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Load `explicit` if given, else `stackcheck.toml` in the working
    /// directory if it exists, else defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let implicit = Path::new(DEFAULT_CONFIG_FILE);
                if implicit.is_file() {
                    Self::from_file(implicit)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.import_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "import_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.manifest_file.trim().is_empty() {
            return Err(ConfigError::Invalid("manifest_file must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn import_timeout(&self) -> Duration {
        Duration::from_secs(self.import_timeout_secs)
    }
}
