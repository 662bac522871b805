//! Gate evaluation for pass/fail criteria over a matrix run.

use crate::pipeline::MatrixReport;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Matrix gate rules.
pub struct MatrixGate;

impl MatrixGate {
    /// Evaluate whether the run is green.
    ///
    /// Gate rule:
    /// - At least one case must have run
    /// - Every case must pass; each failing case contributes all of its
    ///   failure messages
    /// - Cases skipped by fail-fast are reported as a violation
    pub fn evaluate(report: &MatrixReport) -> GateVerdict {
        let mut violations = Vec::new();

        if report.cases.is_empty() && report.not_run == 0 {
            violations.push("No cases were run".to_string());
        }

        for case in report.cases.iter().filter(|c| !c.passed()) {
            violations.extend(case.failure_messages());
        }

        if report.not_run > 0 {
            violations.push(format!(
                "{} case(s) not run after the first failure",
                report.not_run
            ));
        }

        let passed = violations.is_empty();
        let message = if passed {
            format!("All {} case(s) passed", report.cases.len())
        } else {
            format!(
                "Gate failed: {}/{} case(s) failed",
                report.failed_count(),
                report.cases.len() + report.not_run
            )
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}
