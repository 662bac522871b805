//! Import verification: can every declared package be loaded in the sandbox?

use crate::runner::{Invocation, ProcessOutcome, ProcessRunner};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-package import timeout.
pub const IMPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Packages whose distribution name does not match what they import as.
///
/// Keys are lower-case; lookups lower-case the package name first.
pub const IMPORT_OVERRIDES: &[(&str, &str)] = &[
    ("pyyaml", "import yaml"),
    ("python-dotenv", "from dotenv import load_dotenv"),
    ("pillow", "from PIL import Image"),
    ("opencv-python", "import cv2"),
    ("opencv-contrib-python", "import cv2"),
    ("opencv-python-headless", "import cv2"),
    ("scikit-learn", "import sklearn"),
    ("scikit-image", "import skimage"),
    ("pytorch-lightning", "import pytorch_lightning"),
    ("rouge-score", "from rouge_score import rouge_scorer"),
    ("beautifulsoup4", "import bs4"),
    ("protobuf", "import google.protobuf"),
];

/// The Python statement that loads `package`.
///
/// Listed packages use their override; anything else imports the package
/// name with hyphens turned into underscores.
pub fn import_statement(package: &str) -> String {
    let key = package.to_ascii_lowercase();
    IMPORT_OVERRIDES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, stmt)| stmt.to_string())
        .unwrap_or_else(|| format!("import {}", package.replace('-', "_")))
}

/// What happened when one package was imported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportStatus {
    Imported,
    Failed { exit_code: i32, stderr: String },
    TimedOut { limit: Duration },
}

/// Import result for a single dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub package: String,
    pub statement: String,
    pub status: ImportStatus,
}

impl ImportOutcome {
    pub fn passed(&self) -> bool {
        self.status == ImportStatus::Imported
    }

    /// Failure text shown under the package name, `None` on success.
    pub fn reason(&self) -> Option<String> {
        match &self.status {
            ImportStatus::Imported => None,
            ImportStatus::Failed { stderr, .. } => Some(stderr.trim().to_string()),
            ImportStatus::TimedOut { limit } => {
                Some(format!("Import timeout (>{}s)", limit.as_secs()))
            }
        }
    }
}

/// All import outcomes of one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// `<stack>[<group>]`
    pub label: String,
    pub outcomes: Vec<ImportOutcome>,
}

impl ImportReport {
    /// True only if there was at least one dependency and all imported.
    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(ImportOutcome::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ImportOutcome> {
        self.outcomes.iter().filter(|o| !o.passed())
    }

    /// Aggregated message naming every broken package, or `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        if self.outcomes.is_empty() {
            return Some(format!(
                "No dependencies found to test in '{}'",
                self.label
            ));
        }
        if self.passed() {
            return None;
        }

        let mut msg = format!("Failed to import packages in '{}':\n\n", self.label);
        for failure in self.failures() {
            msg.push_str(&format!("  ✗ {}\n", failure.package));
            if let Some(reason) = failure.reason().filter(|r| !r.is_empty()) {
                for line in reason.lines() {
                    msg.push_str(&format!("     {}\n", line));
                }
            }
        }
        Some(msg)
    }
}

/// Import every dependency with `python`, one subprocess each.
///
/// Never stops early: a failing package is recorded and the next one is
/// tried, so the report lists every broken import.
pub async fn verify_imports(
    runner: &dyn ProcessRunner,
    python: &Path,
    label: &str,
    dependencies: &[String],
    timeout: Duration,
) -> ImportReport {
    let mut outcomes = Vec::with_capacity(dependencies.len());

    for package in dependencies {
        let statement = import_statement(package);
        let invocation = Invocation::new(python)
            .arg("-c")
            .arg(statement.as_str())
            .timeout(timeout);

        let status = match runner.run(&invocation).await {
            Ok(ProcessOutcome::Completed(output)) if output.passed() => ImportStatus::Imported,
            Ok(ProcessOutcome::Completed(output)) => ImportStatus::Failed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            },
            Ok(ProcessOutcome::TimedOut { limit }) => ImportStatus::TimedOut { limit },
            Err(e) => ImportStatus::Failed {
                exit_code: -1,
                stderr: e.to_string(),
            },
        };

        if status == ImportStatus::Imported {
            debug!(case = %label, %package, "Imported");
        } else {
            warn!(case = %label, %package, statement = %statement, "Import failed");
        }

        outcomes.push(ImportOutcome {
            package: package.clone(),
            statement,
            status,
        });
    }

    ImportReport {
        label: label.to_string(),
        outcomes,
    }
}
