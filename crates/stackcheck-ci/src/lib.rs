//! stackcheck CI - install-and-import verification of stack groups
//!
//! For every (stack, group) case:
//! - Provisions a fresh venv with Poetry and installs the group
//! - Imports every declared package in its own subprocess
//! - Probes framework versions and the torch CUDA query
//! - Aggregates the results into a pass/fail gate

pub mod config;
pub mod error;
pub mod gate;
pub mod imports;
pub mod pipeline;
pub mod probes;
pub mod runner;
pub mod sandbox;
pub mod telemetry;

// Re-export key types
pub use config::StackcheckConfig;
pub use error::{ConfigError, ProvisionError, RunnerError};
pub use gate::{GateVerdict, MatrixGate};
pub use imports::{
    import_statement, verify_imports, ImportOutcome, ImportReport, ImportStatus,
};
pub use pipeline::{CaseOutcome, CasePipeline, CaseReport, MatrixReport, RunOptions};
pub use probes::{probe_cuda, probe_versions, ProbeCheck, ProbeResult};
pub use runner::{
    EnvOverrides, Invocation, ProcessOutcome, ProcessOutput, ProcessRunner, SystemRunner,
};
pub use sandbox::{EnvLayout, ProvisionStep, Sandbox, SandboxConfig, SandboxProvisioner};
pub use telemetry::{init_tracing, level_for};
