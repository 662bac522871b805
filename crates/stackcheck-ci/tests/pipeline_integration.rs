//! Integration tests for the case pipeline with a scripted process runner.

use async_trait::async_trait;
use stack_manifest::{discover, expand, Case, DEFAULT_MANIFEST_FILE};
use stackcheck_ci::{
    CaseOutcome, CasePipeline, EnvLayout, ImportStatus, Invocation, MatrixGate, ProbeResult,
    ProcessOutcome, ProcessOutput, ProcessRunner, ProvisionError, ProvisionStep, RunOptions,
    RunnerError, SandboxProvisioner, StackcheckConfig,
};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

type Handler = Box<dyn Fn(&Invocation) -> ProcessOutcome + Send + Sync>;

/// Records every invocation and answers from a handler.
///
/// `python -m venv <dir>` also lays down `<dir>/bin/python` so that the
/// provisioner finds an interpreter.
struct ScriptedRunner {
    handler: Handler,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    fn new(handler: impl Fn(&Invocation) -> ProcessOutcome + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    fn import_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|inv| inv.args.first().map(String::as_str) == Some("-c"))
            .map(|inv| inv.args[1].clone())
            .filter(|stmt| !stmt.contains("__version__") && !stmt.contains("cuda"))
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutcome, RunnerError> {
        self.calls.lock().unwrap().push(invocation.clone());
        if invocation.args.get(1).map(String::as_str) == Some("venv") {
            let bin = Path::new(&invocation.args[2]).join("bin");
            std::fs::create_dir_all(&bin).unwrap();
            std::fs::write(bin.join("python"), "").unwrap();
        }
        Ok((self.handler)(invocation))
    }
}

fn exited(exit_code: i32, stdout: &str, stderr: &str) -> ProcessOutcome {
    ProcessOutcome::Completed(ProcessOutput {
        exit_code,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration_ms: 1,
    })
}

/// Everything succeeds; probes print plausible output.
fn healthy(invocation: &Invocation) -> ProcessOutcome {
    match invocation.args.get(1) {
        Some(stmt) if stmt.contains("__version__") => exited(0, "2.2.1+cu121\n", ""),
        Some(stmt) if stmt.contains("cuda") => exited(0, "CUDA available: False\n", ""),
        _ => exited(0, "", ""),
    }
}

fn import_of(invocation: &Invocation) -> Option<&str> {
    match invocation.args.as_slice() {
        [flag, stmt] if flag == "-c" => Some(stmt.as_str()),
        _ => None,
    }
}

struct Fixture {
    dir: TempDir,
    config: StackcheckConfig,
}

impl Fixture {
    fn new(stacks: &[(&str, &str)]) -> Self {
        let dir = tempdir().unwrap();
        for (name, manifest) in stacks {
            let stack = dir.path().join("stacks").join(name);
            std::fs::create_dir_all(&stack).unwrap();
            std::fs::write(stack.join(DEFAULT_MANIFEST_FILE), manifest).unwrap();
        }
        let mut config = StackcheckConfig::default();
        config.stacks_dir = dir.path().join("stacks");
        config.sandbox.root = Some(dir.path().join("sandboxes"));
        Self { dir, config }
    }

    fn case(&self, id: &str) -> Case {
        let stacks = discover(&self.config.stacks_dir, DEFAULT_MANIFEST_FILE).unwrap();
        expand(&stacks)
            .unwrap()
            .into_iter()
            .find(|c| c.id() == id)
            .expect("case not in matrix")
    }

    fn pipeline<'a>(&'a self, runner: &'a ScriptedRunner) -> CasePipeline<'a> {
        CasePipeline::new(runner, &self.config).with_layout(EnvLayout::Posix)
    }
}

const NLP: &str = r#"
[project]
name = "nlp"
dependencies = ["numpy>=1.26", "opencv-python>=4.9"]

[project.optional-dependencies]
gpu = ["torch>=2.2"]
"#;

const AUDIO: &str = r#"
[tool.poetry.dependencies]
python = "^3.11"
librosa = "^0.10"
soundfile = "^0.12"
whisper = { version = "*", optional = true }

[tool.poetry.extras]
asr = ["whisper"]
empty = []
"#;

/// Test: a healthy case runs every step in order and passes
#[tokio::test]
async fn test_successful_case() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(healthy);
    let case = fx.case("nlp-gpu");

    let report = fx.pipeline(&runner).run_case(&case).await;
    assert!(report.passed(), "{:?}", report.failure_messages());
    assert_eq!(report.dependencies, vec!["numpy", "opencv-python", "torch"]);

    let calls = runner.calls();
    assert_eq!(calls[0].program, fx.config.sandbox.host_python);
    assert_eq!(calls[0].args[..2], ["-m", "venv"]);
    assert_eq!(calls[1].args, ["-m", "pip", "install", "--upgrade", "pip"]);
    assert_eq!(calls[2].args, ["-m", "pip", "install", "poetry"]);
    assert!(calls[1].program.ends_with("venv/bin/python"));

    let install = &calls[3];
    assert!(install.program.ends_with("venv/bin/poetry"));
    assert_eq!(install.args, ["install", "-E", "gpu", "--no-root"]);
    assert_eq!(install.cwd.as_deref(), Some(case.stack.path.as_path()));
    let venv = install.env.get("VIRTUAL_ENV").unwrap();
    assert!(venv.ends_with("venv"));
    assert!(install.env.removes("PYTHONHOME"));
    assert!(install.timeout.is_none());

    assert_eq!(
        runner.import_calls(),
        vec!["import numpy", "import cv2", "import torch"]
    );
    let import_timeouts: Vec<_> = calls
        .iter()
        .filter(|c| import_of(c).is_some_and(|s| !s.contains("__version__") && !s.contains("cuda")))
        .map(|c| c.timeout)
        .collect();
    assert_eq!(import_timeouts, vec![Some(Duration::from_secs(30)); 3]);

    match &report.outcome {
        CaseOutcome::Verified { versions, cuda, .. } => {
            assert!(matches!(
                versions,
                ProbeResult::Ran(checks) if checks[0].detail == "2.2.1+cu121"
            ));
            assert!(matches!(cuda, ProbeResult::Ran(checks) if checks[0].passed));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// Test: the base group installs without extras and skips probes without torch
#[tokio::test]
async fn test_base_case_installs_without_extras() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(healthy);

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-base")).await;
    assert!(report.passed());
    assert_eq!(runner.calls()[3].args, ["install", "--no-root"]);

    match &report.outcome {
        CaseOutcome::Verified { versions, cuda, .. } => {
            assert!(matches!(versions, ProbeResult::Skipped(_)));
            assert!(matches!(cuda, ProbeResult::Skipped(_)));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

/// Test: a failing install embeds the captured stderr verbatim and stops the case
#[tokio::test]
async fn test_install_failure_is_fatal_with_diagnostics() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let stderr = "Because nlp depends on torch (>=2.2) which doesn't match any versions,\n \
                  version solving failed.\n";
    let runner = ScriptedRunner::new(move |inv| {
        if inv.args.first().map(String::as_str) == Some("install") {
            exited(1, "", stderr)
        } else {
            healthy(inv)
        }
    });
    let case = fx.case("nlp-gpu");

    let provisioner =
        SandboxProvisioner::new(&runner, &fx.config.sandbox).with_layout(EnvLayout::Posix);
    let err = provisioner.provision(&case).await.unwrap_err();
    match &err {
        ProvisionError::StepFailed {
            step,
            exit_code,
            diagnostics,
            ..
        } => {
            assert_eq!(*step, ProvisionStep::InstallGroup);
            assert_eq!(*exit_code, 1);
            assert_eq!(diagnostics, stderr);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains(stderr));

    let report = fx.pipeline(&runner).run_case(&case).await;
    assert!(!report.passed());
    assert!(matches!(
        report.outcome,
        CaseOutcome::ProvisionFailed(ref msg) if msg.contains(stderr)
    ));
    assert!(runner.import_calls().is_empty());
}

/// Test: an early step failure skips the remaining steps
#[tokio::test]
async fn test_pip_upgrade_failure_stops_provisioning() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(|inv| {
        if inv.args.contains(&"--upgrade".to_string()) {
            exited(2, "", "network unreachable")
        } else {
            healthy(inv)
        }
    });

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-base")).await;
    assert!(!report.passed());
    assert_eq!(runner.calls().len(), 2);
    assert!(report.failure_messages()[0].starts_with("Failed to upgrade pip for nlp-base"));
}

/// Test: import failures are collected, never short-circuited
#[tokio::test]
async fn test_import_failures_are_all_reported() {
    let fx = Fixture::new(&[(
        "vision",
        "[project]\ndependencies = [\"alpha\", \"beta\", \"gamma\"]\n",
    )]);
    let runner = ScriptedRunner::new(|inv| match import_of(inv) {
        Some("import alpha") => exited(1, "", "ModuleNotFoundError: No module named 'alpha'"),
        Some("import gamma") => exited(1, "", "ImportError: gamma needs libfoo"),
        _ => healthy(inv),
    });

    let report = fx.pipeline(&runner).run_case(&fx.case("vision-base")).await;
    assert!(!report.passed());
    assert_eq!(runner.import_calls().len(), 3);

    let messages = report.failure_messages().join("\n");
    assert!(messages.contains("Failed to import packages in 'vision[base]'"));
    assert!(messages.contains("✗ alpha"));
    assert!(messages.contains("No module named 'alpha'"));
    assert!(messages.contains("✗ gamma"));
    assert!(messages.contains("gamma needs libfoo"));
    assert!(!messages.contains("✗ beta"));
}

/// Test: an import timeout has its own reason string
#[tokio::test]
async fn test_import_timeout_reason() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(|inv| match import_of(inv) {
        Some("import torch") => ProcessOutcome::TimedOut {
            limit: Duration::from_secs(30),
        },
        _ => healthy(inv),
    });

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-gpu")).await;
    let CaseOutcome::Verified { imports, .. } = &report.outcome else {
        panic!("expected verification");
    };
    let torch = imports.outcomes.iter().find(|o| o.package == "torch").unwrap();
    assert!(matches!(torch.status, ImportStatus::TimedOut { .. }));
    assert_eq!(torch.reason().unwrap(), "Import timeout (>30s)");
    assert!(!report.passed());
}

/// Test: an empty group fails instead of passing vacuously
#[tokio::test]
async fn test_empty_group_fails() {
    let fx = Fixture::new(&[("audio", AUDIO)]);
    let runner = ScriptedRunner::new(healthy);

    let report = fx.pipeline(&runner).run_case(&fx.case("audio-empty")).await;
    assert!(report.dependencies.is_empty());
    assert!(!report.passed());
    assert_eq!(
        report.failure_messages(),
        vec!["No dependencies found to test in 'audio[empty]'"]
    );
}

/// Test: blank version output fails the case
#[tokio::test]
async fn test_blank_version_fails() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(|inv| match import_of(inv) {
        Some(stmt) if stmt.contains("__version__") => exited(0, "  \n", ""),
        _ => healthy(inv),
    });

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-gpu")).await;
    assert!(!report.passed());
    assert!(report
        .failure_messages()
        .iter()
        .any(|m| m.contains("Could not get version for torch")));
}

/// Test: the CUDA probe passes whether or not a GPU is reported
#[tokio::test]
async fn test_cuda_probe_only_needs_query() {
    let fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(|inv| match import_of(inv) {
        Some(stmt) if stmt.contains("cuda") => {
            exited(0, "CUDA available: True\nDevice: NVIDIA A100\n", "")
        }
        _ => healthy(inv),
    });

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-gpu")).await;
    assert!(report.passed());
}

/// Test: full matrix run with fail-fast stops at the first failing case
#[tokio::test]
async fn test_matrix_run_fail_fast() {
    let fx = Fixture::new(&[("audio", AUDIO), ("nlp", NLP)]);
    let runner = ScriptedRunner::new(healthy);
    let stacks = discover(&fx.config.stacks_dir, DEFAULT_MANIFEST_FILE).unwrap();
    let matrix = expand(&stacks).unwrap();
    assert_eq!(
        matrix.ids(),
        vec!["audio-asr", "audio-base", "audio-empty", "nlp-base", "nlp-gpu"]
    );

    let full = fx
        .pipeline(&runner)
        .run(&matrix, RunOptions::default())
        .await;
    assert_eq!(full.cases.len(), 5);
    assert_eq!(full.failed_count(), 1);
    let verdict = MatrixGate::evaluate(&full);
    assert!(!verdict.passed);
    assert!(verdict.violations[0].contains("audio[empty]"));

    let stopped = fx
        .pipeline(&runner)
        .run(&matrix, RunOptions { fail_fast: true })
        .await;
    assert_eq!(stopped.cases.len(), 3);
    assert_eq!(stopped.not_run, 2);
}

/// Test: sandboxes are removed after the case unless kept
#[tokio::test]
async fn test_sandbox_cleanup_and_keep() {
    let mut fx = Fixture::new(&[("nlp", NLP)]);
    let runner = ScriptedRunner::new(healthy);
    let sandboxes = fx.dir.path().join("sandboxes");

    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-base")).await;
    assert!(report.kept_sandbox.is_none());
    assert_eq!(std::fs::read_dir(&sandboxes).unwrap().count(), 0);

    fx.config.sandbox.keep = true;
    let report = fx.pipeline(&runner).run_case(&fx.case("nlp-base")).await;
    let kept = report.kept_sandbox.expect("sandbox should be kept");
    assert!(kept.join("venv/bin/python").exists());
    assert!(kept
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("nlp-base-"));
}

/// Test: a manifest that disappears mid-run only fails its own stack
#[tokio::test]
async fn test_broken_manifest_fails_only_its_stack() {
    let fx = Fixture::new(&[("audio", AUDIO), ("nlp", NLP)]);
    let runner = ScriptedRunner::new(healthy);
    let stacks = discover(&fx.config.stacks_dir, DEFAULT_MANIFEST_FILE).unwrap();
    let matrix = expand(&stacks).unwrap();
    std::fs::remove_file(fx.config.stacks_dir.join("nlp").join(DEFAULT_MANIFEST_FILE)).unwrap();

    let report = fx.pipeline(&runner).run(&matrix, RunOptions::default()).await;
    assert_eq!(report.cases.len(), 5);
    assert_eq!(report.not_run, 0);

    let audio: Vec<_> = report
        .cases
        .iter()
        .filter(|c| c.case_id.starts_with("audio-"))
        .collect();
    assert_eq!(audio.len(), 3);
    assert!(audio.iter().all(|c| matches!(c.outcome, CaseOutcome::Verified { .. })));
    assert_eq!(report.passed_count(), 2);

    for id in ["nlp-base", "nlp-gpu"] {
        let case = report.cases.iter().find(|c| c.case_id == id).unwrap();
        assert!(!case.passed());
        assert!(matches!(
            &case.outcome,
            CaseOutcome::ConfigError(msg) if msg.contains("Manifest not found")
        ));
    }
    // Sandbox paths carry the case id, so no nlp sandbox was ever created.
    assert!(runner.calls().iter().all(|c| !c.to_string().contains("nlp-")));

    let verdict = MatrixGate::evaluate(&report);
    assert!(!verdict.passed);
    assert!(verdict
        .violations
        .iter()
        .any(|v| v.starts_with("'nlp[base]': Manifest not found")));
}
