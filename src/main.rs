//! marshal CLI - concurrent test execution orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use marshal::config;
use marshal::model::ExecutionPlan;
use marshal::orchestrator::Orchestrator;
use marshal::report::{self, ConsoleProgress};

#[derive(Parser)]
#[command(name = "marshal")]
#[command(about = "Concurrent test execution orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "marshal.toml")]
    config: PathBuf,

    /// Verbose output.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher: recovers in-flight work, then schedules and
    /// runs submitted plans until interrupted.
    Run {
        /// Exit once the queue drains and nothing is active, instead of
        /// running until interrupted. Useful for CI invocations that
        /// submit a plan and wait for it inline.
        #[arg(long)]
        until_idle: bool,
    },

    /// Submit a plan (JSON) for execution by a running or future `run`.
    Submit {
        /// Path to an `ExecutionPlan` JSON file.
        plan: PathBuf,
    },

    /// Print a point-in-time status snapshot, replaying persisted state.
    Status,

    /// Print operational state (running/degraded/stopped) and an
    /// environment-pool summary.
    Health,

    /// Fetch one test's terminal result, if it has reached one.
    Result {
        test_id: String,
    },

    /// Request cancellation of a test (only reliable against the same
    /// resident process; see DESIGN.md).
    Cancel {
        test_id: String,
    },

    /// Validate a configuration file without starting anything.
    Validate,

    /// Write a starter configuration file.
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { until_idle } => run(&cli.config, until_idle).await,
        Commands::Submit { plan } => submit(&cli.config, &plan).await,
        Commands::Status => status(&cli.config).await,
        Commands::Health => health(&cli.config).await,
        Commands::Result { test_id } => show_result(&cli.config, &test_id).await,
        Commands::Cancel { test_id } => cancel(&cli.config, &test_id).await,
        Commands::Validate => validate(&cli.config),
        Commands::Init => init(&cli.config),
    }
}

async fn load(config_path: &Path) -> Result<Orchestrator> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    Orchestrator::new(config).await
}

async fn run(config_path: &Path, until_idle: bool) -> Result<()> {
    let orchestrator = load(config_path).await?;
    let handles = orchestrator.spawn_background_loops();
    info!("marshal dispatcher running");

    let progress = ConsoleProgress::new(orchestrator.status_snapshot().per_test_status.len() as u64);
    let mut reported = std::collections::HashSet::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !until_idle => {
                info!("shutdown requested");
                orchestrator.request_shutdown();
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
        }

        let snapshot = orchestrator.status_snapshot();
        progress.set_total(snapshot.per_test_status.len() as u64);
        for (test_id, test_status) in &snapshot.per_test_status {
            if test_status.is_terminal() && reported.insert(test_id.clone())
                && let Some(result) = orchestrator.get_result(test_id).await
            {
                progress.report_terminal(&result);
            }
        }

        if until_idle && snapshot.queued_count == 0 && snapshot.active_count == 0 {
            orchestrator.request_shutdown();
            break;
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    progress.finish();

    let snapshot = orchestrator.status_snapshot();
    report::print_summary(&snapshot);

    let mut results = Vec::new();
    for test_id in snapshot.per_test_status.keys() {
        if let Some(result) = orchestrator.get_result(test_id).await {
            results.push(result);
        }
    }
    if !results.is_empty() {
        report::write_junit_report(&results, Path::new("test-results/junit.xml"))
            .context("failed to write JUnit report")?;
    }
    Ok(())
}

async fn submit(config_path: &Path, plan_path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(plan_path)
        .with_context(|| format!("failed to read plan file {}", plan_path.display()))?;
    let plan: ExecutionPlan =
        serde_json::from_str(&content).with_context(|| format!("failed to parse plan file {}", plan_path.display()))?;

    let orchestrator = load(config_path).await?;
    orchestrator
        .submit_plan(plan.clone())
        .await
        .with_context(|| format!("failed to submit plan {}", plan.plan_id))?;
    println!("submitted plan {} ({} tests)", plan.plan_id, plan.tests.len());
    Ok(())
}

async fn status(config_path: &Path) -> Result<()> {
    let orchestrator = load(config_path).await?;
    let snapshot = orchestrator.status_snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn health(config_path: &Path) -> Result<()> {
    let orchestrator = load(config_path).await?;
    let health = orchestrator.health().await;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}

async fn show_result(config_path: &Path, test_id: &str) -> Result<()> {
    let orchestrator = load(config_path).await?;
    match orchestrator.get_result(test_id).await {
        Some(result) => println!("{}", serde_json::to_string_pretty(&result)?),
        None => println!("no terminal result for {test_id} yet"),
    }
    Ok(())
}

async fn cancel(config_path: &Path, test_id: &str) -> Result<()> {
    let orchestrator = load(config_path).await?;
    orchestrator.cancel(test_id).await;
    println!("cancellation requested for {test_id}");
    Ok(())
}

fn validate(config_path: &Path) -> Result<()> {
    let config = config::load_config(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    println!(
        "configuration is valid: {} environment group(s)",
        config.environments.len()
    );
    Ok(())
}

fn init(config_path: &Path) -> Result<()> {
    let starter = r#"[orchestrator]
max_concurrent_runs = 4
default_timeout_ms = 900000
timeout_grace_ms = 5000
queue_poll_interval_ms = 2000
env_idle_reclaim_seconds = 300
env_reset_failure_threshold = 2
retry_on_env_failure = true
persistence_root = ".marshal"

[[environments]]
type = "process"
id_prefix = "local"
count = 4
architecture = "x86_64"

[environments.capacity]
memory_mb = 2048
cpu = 2

[report]
output_dir = "test-results"
junit = true
junit_file = "junit.xml"
"#;
    std::fs::write(config_path, starter)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    println!("wrote starter configuration to {}", config_path.display());
    Ok(())
}
