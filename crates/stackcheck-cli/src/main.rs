//! stackcheck - install-and-import verification for ML stacks
//!
//! ## Commands
//!
//! - `list`: Show every (stack, group) case and its dependencies
//! - `deps`: Print the package names of one stack group
//! - `run`: Provision, import and probe every matching case

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stack_manifest::{discover, expand, Matrix, Stack};
use stackcheck_ci::{
    init_tracing, level_for, CaseOutcome, CasePipeline, MatrixGate, MatrixReport, RunOptions,
    StackcheckConfig, SystemRunner,
};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "stackcheck")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Verify that every stack group installs and imports cleanly", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Config file (default: ./stackcheck.toml if present)
    #[arg(long, global = true, env = "STACKCHECK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory containing the stacks (overrides the config file)
    #[arg(long, global = true, env = "STACKCHECK_STACKS_DIR")]
    stacks_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every case of the test matrix
    List {
        /// Print the matrix as JSON
        #[arg(long = "as-json")]
        as_json: bool,
    },

    /// Print the dependencies of one stack group
    Deps {
        /// Stack directory name
        stack: String,

        /// Group name
        #[arg(default_value = "base")]
        group: String,
    },

    /// Run the matrix
    Run {
        /// Only run cases whose id contains this pattern
        #[arg(short = 'k', long = "filter")]
        filter: Option<String>,

        /// Leave sandboxes on disk after the run
        #[arg(long)]
        keep_sandboxes: bool,

        /// Stop after the first failing case
        #[arg(long)]
        fail_fast: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let mut config = StackcheckConfig::load(cli.config.as_deref())
        .context("Failed to load stackcheck configuration")?;
    if let Some(dir) = cli.stacks_dir {
        config.stacks_dir = dir;
    }

    match cli.command {
        Commands::List { as_json } => cmd_list(&config, as_json),
        Commands::Deps { stack, group } => cmd_deps(&config, &stack, &group),
        Commands::Run {
            filter,
            keep_sandboxes,
            fail_fast,
        } => {
            if keep_sandboxes {
                config.sandbox.keep = true;
            }
            cmd_run(&config, filter.as_deref(), RunOptions { fail_fast }).await
        }
    }
}

fn load_stacks(config: &StackcheckConfig) -> Result<Vec<Stack>> {
    discover(&config.stacks_dir, &config.manifest_file).with_context(|| {
        format!("Failed to scan stacks in {}", config.stacks_dir.display())
    })
}

fn load_matrix(config: &StackcheckConfig) -> Result<Matrix> {
    let stacks = load_stacks(config)?;
    let matrix = expand(&stacks).context("Failed to build test matrix")?;
    info!(
        stacks = stacks.len(),
        cases = matrix.len(),
        "Loaded test matrix"
    );
    Ok(matrix)
}

#[derive(Debug, Serialize)]
struct ListedCase {
    id: String,
    stack: String,
    group: String,
    dependencies: Vec<String>,
}

fn listed_cases(matrix: &Matrix) -> Result<Vec<ListedCase>> {
    matrix
        .cases()
        .iter()
        .map(|case| {
            let dependencies = case
                .dependencies()
                .with_context(|| format!("Failed to read dependencies of {case}"))?;
            Ok(ListedCase {
                id: case.id(),
                stack: case.stack.name.clone(),
                group: case.group.clone(),
                dependencies,
            })
        })
        .collect()
}

/// List every case of the matrix
fn cmd_list(config: &StackcheckConfig, as_json: bool) -> Result<()> {
    let matrix = load_matrix(config)?;
    let cases = listed_cases(&matrix)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&cases)?);
        return Ok(());
    }

    if cases.is_empty() {
        println!("No stacks found in {}", config.stacks_dir.display());
        return Ok(());
    }

    for case in &cases {
        println!("{} ({} packages)", case.id, case.dependencies.len());
        for dep in &case.dependencies {
            println!("  {}", dep);
        }
    }
    println!("\n{} case(s)", cases.len());
    Ok(())
}

fn find_stack(config: &StackcheckConfig, name: &str) -> Result<Stack> {
    load_stacks(config)?
        .into_iter()
        .find(|stack| stack.name == name)
        .with_context(|| {
            format!(
                "No stack named '{}' in {}",
                name,
                config.stacks_dir.display()
            )
        })
}

/// Print the package names of one group, one per line
fn cmd_deps(config: &StackcheckConfig, stack: &str, group: &str) -> Result<()> {
    let stack = find_stack(config, stack)?;
    let deps = stack.dependencies(group)?;
    for dep in deps {
        println!("{}", dep);
    }
    Ok(())
}

/// Run every matching case and gate the result
async fn cmd_run(
    config: &StackcheckConfig,
    filter: Option<&str>,
    options: RunOptions,
) -> Result<()> {
    let mut matrix = load_matrix(config)?;
    if let Some(pattern) = filter {
        matrix = matrix.filter(pattern);
        info!(pattern, cases = matrix.len(), "Filtered test matrix");
    }

    let runner = SystemRunner;
    let pipeline = CasePipeline::new(&runner, config);
    let report = pipeline.run(&matrix, options).await;

    print_report(&report);

    let verdict = MatrixGate::evaluate(&report);
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("{}", verdict.message);

    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {}", violation.replace('\n', "\n    "));
        }
    }

    if verdict.passed {
        println!("\n✓ All stacks verified!");
        Ok(())
    } else {
        anyhow::bail!("stackcheck failed")
    }
}

fn print_report(report: &MatrixReport) {
    let success = report.failed_count() == 0 && report.not_run == 0;
    println!("Run ID: {}", report.run_id);
    println!("Started: {}", report.started_at.to_rfc3339());
    println!("Status: {}", if success { "✓ PASSED" } else { "✗ FAILED" });
    println!("Duration: {}ms", report.duration_ms);
    println!();

    for case in &report.cases {
        let status = if case.passed() { "✓" } else { "✗" };
        let detail = match &case.outcome {
            CaseOutcome::ConfigError(_) => "manifest error".to_string(),
            CaseOutcome::ProvisionFailed(_) => "provisioning failed".to_string(),
            CaseOutcome::Verified { imports, .. } => format!(
                "{}/{} imports",
                imports.outcomes.iter().filter(|o| o.passed()).count(),
                imports.outcomes.len()
            ),
        };
        println!("  {} {} ({}, {}ms)", status, case.case_id, detail, case.duration_ms);
        if let Some(path) = &case.kept_sandbox {
            println!("      sandbox kept at {}", path.display());
        }
    }

    println!();
    println!(
        "Summary: {}/{} cases passed",
        report.passed_count(),
        report.cases.len() + report.not_run
    );
}
