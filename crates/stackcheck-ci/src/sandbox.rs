//! Per-case sandbox provisioning.
//!
//! A sandbox is a fresh virtualenv in its own temporary directory with Poetry
//! installed into it, into which Poetry then installs exactly the case's group.
//! Steps run in order and the first failure aborts the case.

use crate::error::ProvisionError;
use crate::runner::{EnvOverrides, Invocation, ProcessOutcome, ProcessRunner};
use serde::{Deserialize, Serialize};
use stack_manifest::Case;
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Name of the venv directory inside the sandbox workdir.
const VENV_DIR: &str = "venv";

/// Sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    /// Interpreter used to create each venv.
    pub host_python: PathBuf,
    /// Parent directory for sandboxes (system temp dir when unset).
    pub root: Option<PathBuf>,
    /// Leave sandbox directories on disk after the case finishes.
    pub keep: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let host_python = if cfg!(windows) { "python" } else { "python3" };
        Self {
            host_python: PathBuf::from(host_python),
            root: None,
            keep: false,
        }
    }
}

/// Directory layout of a venv on the current platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvLayout {
    /// `bin/python`
    Posix,
    /// `Scripts\python.exe`
    Windows,
}

impl EnvLayout {
    pub fn host() -> Self {
        if cfg!(windows) {
            EnvLayout::Windows
        } else {
            EnvLayout::Posix
        }
    }

    /// Path of the console script `name` inside the venv at `env`.
    pub fn executable(&self, env: &Path, name: &str) -> PathBuf {
        match self {
            EnvLayout::Posix => env.join("bin").join(name),
            EnvLayout::Windows => env.join("Scripts").join(format!("{name}.exe")),
        }
    }
}

/// Ordered provisioning steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateVenv,
    UpgradePip,
    InstallPoetry,
    InstallGroup,
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProvisionStep::CreateVenv => "create venv",
            ProvisionStep::UpgradePip => "upgrade pip",
            ProvisionStep::InstallPoetry => "install poetry",
            ProvisionStep::InstallGroup => "install dependencies",
        };
        f.write_str(label)
    }
}

/// A provisioned environment owned by one case.
///
/// The workdir is deleted on drop unless it was kept.
#[derive(Debug)]
pub struct Sandbox {
    dir: TempDir,
    layout: EnvLayout,
    kept: bool,
}

impl Sandbox {
    /// Root of the venv.
    pub fn env_path(&self) -> PathBuf {
        self.dir.path().join(VENV_DIR)
    }

    /// Directory holding the venv, removed with the sandbox unless kept.
    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    pub fn python(&self) -> PathBuf {
        self.layout.executable(&self.env_path(), "python")
    }

    pub fn poetry(&self) -> PathBuf {
        self.layout.executable(&self.env_path(), "poetry")
    }

    /// Whether the workdir survives this value.
    pub fn is_kept(&self) -> bool {
        self.kept
    }
}

/// `poetry` arguments installing one group of a case.
pub fn install_args(case: &Case) -> Vec<String> {
    let mut args = vec!["install".to_string()];
    if !case.is_base() {
        args.push("-E".to_string());
        args.push(case.group.clone());
    }
    args.push("--no-root".to_string());
    args
}

/// Environment for the Poetry install: target the sandbox venv explicitly and
/// drop `PYTHONHOME`, which would redirect interpreter home detection.
pub fn install_env(env_path: &Path) -> EnvOverrides {
    EnvOverrides::new()
        .with_var("VIRTUAL_ENV", env_path.to_string_lossy())
        .without_var("PYTHONHOME")
}

/// Builds sandboxes through a [`ProcessRunner`].
pub struct SandboxProvisioner<'a> {
    runner: &'a dyn ProcessRunner,
    config: &'a SandboxConfig,
    layout: EnvLayout,
}

impl<'a> SandboxProvisioner<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, config: &'a SandboxConfig) -> Self {
        Self {
            runner,
            config,
            layout: EnvLayout::host(),
        }
    }

    pub fn with_layout(mut self, layout: EnvLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Create a sandbox for `case` and install its group into it.
    pub async fn provision(&self, case: &Case) -> Result<Sandbox, ProvisionError> {
        let case_id = case.id();
        let sandbox = self.create_workdir(&case_id)?;
        let env_path = sandbox.env_path();

        info!(case = %case_id, "Building environment for '{}'", case);

        self.run_step(
            &case_id,
            ProvisionStep::CreateVenv,
            Invocation::new(&self.config.host_python)
                .args(["-m", "venv"])
                .arg(env_path.to_string_lossy()),
        )
        .await?;

        let python = sandbox.python();
        if !python.exists() {
            return Err(ProvisionError::InterpreterMissing { path: python });
        }
        info!(case = %case_id, "Virtual environment created");

        self.run_step(
            &case_id,
            ProvisionStep::UpgradePip,
            Invocation::new(&python).args(["-m", "pip", "install", "--upgrade", "pip"]),
        )
        .await?;
        info!(case = %case_id, "Pip upgraded");

        self.run_step(
            &case_id,
            ProvisionStep::InstallPoetry,
            Invocation::new(&python).args(["-m", "pip", "install", "poetry"]),
        )
        .await?;
        info!(case = %case_id, "Poetry installed");

        info!(
            case = %case_id,
            group = %case.group,
            "Installing group (this may take a few minutes)"
        );
        self.run_step(
            &case_id,
            ProvisionStep::InstallGroup,
            Invocation::new(sandbox.poetry())
                .args(install_args(case))
                .current_dir(&case.stack.path)
                .env(install_env(&env_path)),
        )
        .await?;
        info!(case = %case_id, group = %case.group, "Group installed successfully");

        Ok(sandbox)
    }

    fn create_workdir(&self, case_id: &str) -> Result<Sandbox, ProvisionError> {
        let prefix = format!("{case_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).keep(self.config.keep);

        let created = match &self.config.root {
            Some(root) => std::fs::create_dir_all(root).and_then(|_| builder.tempdir_in(root)),
            None => builder.tempdir(),
        };
        let dir = created.map_err(|source| ProvisionError::Workdir {
            case: case_id.to_string(),
            source,
        })?;

        if self.config.keep {
            info!(case = %case_id, path = %dir.path().display(), "Keeping sandbox");
        }

        Ok(Sandbox {
            dir,
            layout: self.layout,
            kept: self.config.keep,
        })
    }

    async fn run_step(
        &self,
        case_id: &str,
        step: ProvisionStep,
        invocation: Invocation,
    ) -> Result<(), ProvisionError> {
        debug!(case = %case_id, %step, command = %invocation, "Running provisioning step");

        match self.runner.run(&invocation).await? {
            ProcessOutcome::Completed(output) if output.passed() => Ok(()),
            ProcessOutcome::Completed(output) => Err(ProvisionError::StepFailed {
                case: case_id.to_string(),
                step,
                exit_code: output.exit_code,
                diagnostics: output.diagnostics().to_string(),
            }),
            ProcessOutcome::TimedOut { limit } => Err(ProvisionError::StepFailed {
                case: case_id.to_string(),
                step,
                exit_code: -1,
                diagnostics: format!("timed out after {}s", limit.as_secs()),
            }),
        }
    }
}
