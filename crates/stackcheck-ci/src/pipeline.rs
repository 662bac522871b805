//! Case orchestration: provision, import, probe, report.

use crate::config::StackcheckConfig;
use crate::imports::{verify_imports, ImportReport};
use crate::probes::{probe_cuda, probe_versions, ProbeResult};
use crate::runner::ProcessRunner;
use crate::sandbox::{EnvLayout, SandboxProvisioner};
use chrono::{DateTime, Utc};
use stack_manifest::{Case, Matrix};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// How a case ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseOutcome {
    /// The stack's manifest could not be read; nothing was provisioned.
    ConfigError(String),
    /// Sandbox setup failed; nothing was verified.
    ProvisionFailed(String),
    Verified {
        imports: ImportReport,
        versions: ProbeResult,
        cuda: ProbeResult,
    },
}

/// Result of one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseReport {
    /// `<stack>-<group>`
    pub case_id: String,
    /// `<stack>[<group>]`
    pub label: String,
    pub dependencies: Vec<String>,
    pub outcome: CaseOutcome,
    pub duration_ms: u64,
    /// Sandbox left on disk, when kept.
    pub kept_sandbox: Option<PathBuf>,
}

impl CaseReport {
    pub fn passed(&self) -> bool {
        match &self.outcome {
            CaseOutcome::ConfigError(_) | CaseOutcome::ProvisionFailed(_) => false,
            CaseOutcome::Verified {
                imports,
                versions,
                cuda,
            } => imports.passed() && versions.passed() && cuda.passed(),
        }
    }

    /// Human-readable reasons this case failed, empty if it passed.
    pub fn failure_messages(&self) -> Vec<String> {
        match &self.outcome {
            CaseOutcome::ConfigError(msg) => vec![format!("'{}': {}", self.label, msg)],
            CaseOutcome::ProvisionFailed(msg) => vec![msg.clone()],
            CaseOutcome::Verified {
                imports,
                versions,
                cuda,
            } => {
                let mut messages: Vec<String> = imports.failure_message().into_iter().collect();
                for check in versions.failures().into_iter().chain(cuda.failures()) {
                    messages.push(format!("'{}': {}", self.label, check.detail));
                }
                messages
            }
        }
    }
}

/// Result of running a matrix.
#[derive(Debug, Clone)]
pub struct MatrixReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub cases: Vec<CaseReport>,
    /// Cases not run because of `fail_fast`.
    pub not_run: usize,
    pub duration_ms: u64,
}

impl MatrixReport {
    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|c| c.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.cases.iter().filter(|c| !c.passed()).count()
    }
}

/// Options for [`CasePipeline::run`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Stop after the first failing case.
    pub fail_fast: bool,
}

/// Runs cases one after another through a [`ProcessRunner`].
pub struct CasePipeline<'a> {
    runner: &'a dyn ProcessRunner,
    config: &'a StackcheckConfig,
    layout: EnvLayout,
}

impl<'a> CasePipeline<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, config: &'a StackcheckConfig) -> Self {
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

    /// Provision and verify a single case.
    ///
    /// Every failure, including an unreadable manifest, ends up in the report.
    pub async fn run_case(&self, case: &Case) -> CaseReport {
        let start = Instant::now();
        let (dependencies, outcome, kept_sandbox) = match case.dependencies() {
            Ok(dependencies) => {
                let (outcome, kept) = self.verify(case, &dependencies).await;
                (dependencies, outcome, kept)
            }
            Err(e) => {
                error!(case = %case.id(), error = %e, "Manifest unreadable");
                (Vec::new(), CaseOutcome::ConfigError(e.to_string()), None)
            }
        };
        finish(case, dependencies, outcome, kept_sandbox, start)
    }

    async fn verify(
        &self,
        case: &Case,
        dependencies: &[String],
    ) -> (CaseOutcome, Option<PathBuf>) {
        let provisioner =
            SandboxProvisioner::new(self.runner, &self.config.sandbox).with_layout(self.layout);

        let sandbox = match provisioner.provision(case).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                error!(case = %case.id(), error = %e, "Provisioning failed");
                return (CaseOutcome::ProvisionFailed(e.to_string()), None);
            }
        };

        let python = sandbox.python();
        let imports = verify_imports(
            self.runner,
            &python,
            &case.to_string(),
            dependencies,
            self.config.import_timeout(),
        )
        .await;
        let versions = probe_versions(self.runner, &python, dependencies).await;
        let cuda = probe_cuda(self.runner, &python, dependencies).await;

        let kept = sandbox.is_kept().then(|| sandbox.workdir().to_path_buf());
        (
            CaseOutcome::Verified {
                imports,
                versions,
                cuda,
            },
            kept,
        )
    }

    /// Run every case of `matrix` in order.
    ///
    /// Once a stack's manifest fails to load, its remaining cases are reported
    /// with the same error without touching the manifest again. Other stacks
    /// still run.
    pub async fn run(&self, matrix: &Matrix, options: RunOptions) -> MatrixReport {
        let start = Instant::now();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, cases = matrix.len(), "Starting stackcheck run");

        let mut broken: BTreeMap<String, String> = BTreeMap::new();
        let mut cases = Vec::new();
        for case in matrix.cases() {
            let report = match broken.get(&case.stack.name) {
                Some(msg) => {
                    warn!(case = %case.id(), "Skipping case of stack with a broken manifest");
                    let outcome = CaseOutcome::ConfigError(msg.clone());
                    finish(case, Vec::new(), outcome, None, Instant::now())
                }
                None => {
                    let span = info_span!("case", id = %case.id());
                    self.run_case(case).instrument(span).await
                }
            };
            if let CaseOutcome::ConfigError(msg) = &report.outcome {
                broken
                    .entry(case.stack.name.clone())
                    .or_insert_with(|| msg.clone());
            }

            let failed = !report.passed();
            cases.push(report);
            if failed && options.fail_fast {
                info!(run_id = %run_id, "Stopping after first failure");
                break;
            }
        }

        let not_run = matrix.len() - cases.len();
        MatrixReport {
            run_id,
            started_at,
            cases,
            not_run,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn finish(
    case: &Case,
    dependencies: Vec<String>,
    outcome: CaseOutcome,
    kept_sandbox: Option<PathBuf>,
    start: Instant,
) -> CaseReport {
    let report = CaseReport {
        case_id: case.id(),
        label: case.to_string(),
        dependencies,
        outcome,
        duration_ms: start.elapsed().as_millis() as u64,
        kept_sandbox,
    };

    if report.passed() {
        info!(case = %report.case_id, duration_ms = report.duration_ms, "Case passed");
    } else {
        error!(case = %report.case_id, duration_ms = report.duration_ms, "Case failed");
    }
    report
}
