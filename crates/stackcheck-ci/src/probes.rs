//! Capability probes run after imports: framework versions and the CUDA query.

use crate::runner::{Invocation, ProcessOutcome, ProcessRunner};
use std::path::Path;
use tracing::{info, warn};

/// A framework whose `__version__` must be readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framework {
    /// Distribution name as it appears in a dependency list
    pub package: &'static str,
    /// Module to import
    pub module: &'static str,
}

pub const VERSIONED_FRAMEWORKS: &[Framework] = &[
    Framework {
        package: "torch",
        module: "torch",
    },
    Framework {
        package: "transformers",
        module: "transformers",
    },
    Framework {
        package: "pytorch-lightning",
        module: "pytorch_lightning",
    },
    Framework {
        package: "ultralytics",
        module: "ultralytics",
    },
    Framework {
        package: "mmdet",
        module: "mmdet",
    },
];

/// Package that enables the CUDA probe.
pub const CUDA_PACKAGE: &str = "torch";

const CUDA_SCRIPT: &str = "\
import torch
is_available = torch.cuda.is_available()
print(f\"CUDA available: {is_available}\")
if is_available:
    print(f\"Device: {torch.cuda.get_device_name(0)}\")
";

impl Framework {
    pub fn version_script(&self) -> String {
        format!("import {0}; print({0}.__version__)", self.module)
    }
}

/// One executed check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCheck {
    pub name: String,
    pub passed: bool,
    /// Version or probe output on success, error text on failure
    pub detail: String,
}

/// Result of a probe family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Nothing in the dependency list triggers this probe
    Skipped(String),
    Ran(Vec<ProbeCheck>),
}

impl ProbeResult {
    /// Skipped counts as passing.
    pub fn passed(&self) -> bool {
        match self {
            ProbeResult::Skipped(_) => true,
            ProbeResult::Ran(checks) => checks.iter().all(|c| c.passed),
        }
    }

    pub fn failures(&self) -> Vec<&ProbeCheck> {
        match self {
            ProbeResult::Skipped(_) => Vec::new(),
            ProbeResult::Ran(checks) => checks.iter().filter(|c| !c.passed).collect(),
        }
    }
}

fn declares(dependencies: &[String], package: &str) -> bool {
    dependencies.iter().any(|d| d.eq_ignore_ascii_case(package))
}

/// Print `__version__` for each known framework present in `dependencies`.
///
/// Fails a framework on non-zero exit or blank output.
pub async fn probe_versions(
    runner: &dyn ProcessRunner,
    python: &Path,
    dependencies: &[String],
) -> ProbeResult {
    let present: Vec<&Framework> = VERSIONED_FRAMEWORKS
        .iter()
        .filter(|fw| declares(dependencies, fw.package))
        .collect();
    if present.is_empty() {
        return ProbeResult::Skipped(
            "No major frameworks in this group's dependencies".to_string(),
        );
    }

    let mut checks = Vec::new();
    for framework in present {
        let invocation = Invocation::new(python).arg("-c").arg(framework.version_script());
        let check = match runner.run(&invocation).await {
            Ok(ProcessOutcome::Completed(out)) if out.passed() => {
                let version = out.stdout.trim().to_string();
                if version.is_empty() {
                    ProbeCheck {
                        name: framework.package.to_string(),
                        passed: false,
                        detail: format!("Could not get version for {}", framework.package),
                    }
                } else {
                    info!(framework = framework.package, %version, "Framework version");
                    ProbeCheck {
                        name: framework.package.to_string(),
                        passed: true,
                        detail: version,
                    }
                }
            }
            Ok(ProcessOutcome::Completed(out)) => ProbeCheck {
                name: framework.package.to_string(),
                passed: false,
                detail: format!(
                    "Failed to get version for {}: {}",
                    framework.package,
                    out.stderr.trim()
                ),
            },
            Ok(ProcessOutcome::TimedOut { limit }) => ProbeCheck {
                name: framework.package.to_string(),
                passed: false,
                detail: format!("Version probe timed out after {}s", limit.as_secs()),
            },
            Err(e) => ProbeCheck {
                name: framework.package.to_string(),
                passed: false,
                detail: e.to_string(),
            },
        };
        if !check.passed {
            warn!(framework = framework.package, detail = %check.detail, "Version probe failed");
        }
        checks.push(check);
    }
    ProbeResult::Ran(checks)
}

/// Exercise `torch.cuda` without requiring a GPU.
///
/// Passes when the query itself runs; whether CUDA is available is only
/// reported in the detail.
pub async fn probe_cuda(
    runner: &dyn ProcessRunner,
    python: &Path,
    dependencies: &[String],
) -> ProbeResult {
    if !declares(dependencies, CUDA_PACKAGE) {
        return ProbeResult::Skipped("torch not in this stack".to_string());
    }

    let invocation = Invocation::new(python).arg("-c").arg(CUDA_SCRIPT);
    let check = match runner.run(&invocation).await {
        Ok(ProcessOutcome::Completed(out)) if out.passed() => {
            let detail = out.stdout.trim().to_string();
            info!(%detail, "torch CUDA query");
            ProbeCheck {
                name: "torch-cuda".to_string(),
                passed: true,
                detail,
            }
        }
        Ok(ProcessOutcome::Completed(out)) => ProbeCheck {
            name: "torch-cuda".to_string(),
            passed: false,
            detail: format!("torch CUDA test failed: {}", out.stderr.trim()),
        },
        Ok(ProcessOutcome::TimedOut { limit }) => ProbeCheck {
            name: "torch-cuda".to_string(),
            passed: false,
            detail: format!("torch CUDA test timed out after {}s", limit.as_secs()),
        },
        Err(e) => ProbeCheck {
            name: "torch-cuda".to_string(),
            passed: false,
            detail: e.to_string(),
        },
    };
    ProbeResult::Ran(vec![check])
}
