//! Subprocess execution with captured output and an optional timeout.

use crate::error::RunnerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Environment changes applied to a single invocation.
///
/// Built up front and handed to the runner; the parent process environment is
/// never touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    set: BTreeMap<String, String>,
    remove: BTreeSet<String>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key` for the child.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        self.remove.remove(&key);
        self.set.insert(key, value.into());
        self
    }

    /// Drop `key` from the inherited environment.
    pub fn without_var(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set.remove(&key);
        self.remove.insert(key);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.set.get(key).map(String::as_str)
    }

    pub fn removes(&self, key: &str) -> bool {
        self.remove.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    fn apply(&self, command: &mut Command) {
        for key in &self.remove {
            command.env_remove(key);
        }
        command.envs(&self.set);
    }
}

/// A fully described subprocess call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: EnvOverrides,
    /// `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: EnvOverrides::default(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, env: EnvOverrides) -> Self {
        self.env = env;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl ProcessOutput {
    /// Whether this process exited 0.
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// The stream to show a user when the process failed: stderr, or stdout
    /// if stderr is blank.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(ProcessOutput),
    /// The child outlived its timeout and was killed.
    TimedOut { limit: Duration },
}

/// Executes invocations. The seam between case logic and the OS.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutcome, RunnerError>;
}

/// Runs invocations as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutcome, RunnerError> {
        let start = Instant::now();

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        invocation.env.apply(&mut command);

        let child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: invocation.program_name(),
            source,
        })?;

        let waited = match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(waited) => waited,
                // The child future was dropped, which kills the process.
                Err(_) => return Ok(ProcessOutcome::TimedOut { limit }),
            },
            None => child.wait_with_output().await,
        };
        let output = waited.map_err(|source| RunnerError::Wait {
            program: invocation.program_name(),
            source,
        })?;

        Ok(ProcessOutcome::Completed(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: start.elapsed().as_millis() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides_set_then_remove() {
        let env = EnvOverrides::new()
            .with_var("VIRTUAL_ENV", "/tmp/venv")
            .without_var("PYTHONHOME");
        assert_eq!(env.get("VIRTUAL_ENV"), Some("/tmp/venv"));
        assert!(env.removes("PYTHONHOME"));

        let env = env.without_var("VIRTUAL_ENV");
        assert_eq!(env.get("VIRTUAL_ENV"), None);
        assert!(env.removes("VIRTUAL_ENV"));
    }

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("poetry").args(["install", "-E", "gpu", "--no-root"]);
        assert_eq!(inv.to_string(), "poetry install -E gpu --no-root");
    }

    #[test]
    fn test_diagnostics_falls_back_to_stdout() {
        let out = ProcessOutput {
            exit_code: 1,
            stdout: "resolver said no".to_string(),
            stderr: "  \n".to_string(),
            duration_ms: 5,
        };
        assert!(!out.passed());
        assert_eq!(out.diagnostics(), "resolver said no");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_simple_command() {
        let inv = Invocation::new("echo").arg("hello");
        let outcome = SystemRunner.run(&inv).await.expect("execute failed");
        match outcome {
            ProcessOutcome::Completed(out) => {
                assert!(out.passed());
                assert!(out.stdout.contains("hello"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_failing_command() {
        let outcome = SystemRunner
            .run(&Invocation::new("false"))
            .await
            .expect("execute failed");
        assert!(matches!(outcome, ProcessOutcome::Completed(ref out) if !out.passed()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_env_overrides_reach_child() {
        let inv = Invocation::new("sh")
            .args(["-c", "echo \"$STACKCHECK_PROBE:${HOME:-unset}\""])
            .env(
                EnvOverrides::new()
                    .with_var("STACKCHECK_PROBE", "on")
                    .without_var("HOME"),
            );
        let ProcessOutcome::Completed(out) = SystemRunner.run(&inv).await.unwrap() else {
            panic!("timed out");
        };
        assert_eq!(out.stdout.trim(), "on:unset");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_distinct_outcome() {
        let inv = Invocation::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));
        let outcome = SystemRunner.run(&inv).await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::TimedOut {
                limit: Duration::from_millis(200)
            }
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let inv = Invocation::new("/definitely/not/a/real/binary");
        let err = SystemRunner.run(&inv).await.unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }
}
