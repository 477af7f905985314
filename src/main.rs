use std::io::{self, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pm_analysis::{
    archive::{ArchiveManager, SetupOutcome, TeardownOutcome},
    dataset::{self, DatasetLayout, VerifyReport},
    discovery::{DiscoveryError, ScriptDiscovery},
    monitoring,
    runner::{summarize, BatchReport, BatchRunner, RunContext, Runnable},
    types::{HarnessConfig, LoggingConfig},
    utils::time::format_duration,
};

/// Exit code when a single analysis name does not resolve.
const EXIT_NOT_FOUND: u8 = 2;
/// Exit code when the run is interrupted by a signal.
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "pm-analysis")]
#[command(about = "Prediction-market dataset harness: extract the snapshot, run analyses, clean up", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to config/harness.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of analyses running at once
    #[arg(short, long)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reassemble and extract the dataset archive
    Setup,
    /// Run every analysis, or a single one by name
    Analysis {
        /// Analysis name, with or without its file extension
        name: Option<String>,
    },
    /// Remove the extracted dataset
    Teardown,
    /// List discoverable analyses
    List,
    /// Check record invariants on a sample of the extracted dataset
    Verify {
        /// Rows to check per table
        #[arg(long, default_value_t = 10_000)]
        sample: usize,
    },
}

impl Commands {
    fn verb(&self) -> &'static str {
        match self {
            Commands::Setup => "setup",
            Commands::Analysis { name: None } => "analysis",
            Commands::Analysis { name: Some(_) } => "analysis-one",
            Commands::Teardown => "teardown",
            Commands::List => "list",
            Commands::Verify { .. } => "verify",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    let cli = Cli::parse();
    let mut cfg = match HarnessConfig::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Some(jobs) = cli.jobs {
        cfg.runner.concurrency = Some(jobs);
    }

    init_tracing(&cfg.logging);
    monitoring::logger::log_startup(&cfg, cli.command.verb());

    match run(cli.command, cfg).await {
        Ok(code) => code,
        Err(e) => {
            error!(target: "harness", error = %format!("{e:#}"), "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(cfg: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if cfg.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(command: Commands, cfg: HarnessConfig) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Setup => setup(&cfg).await,
        Commands::Teardown => teardown(&cfg).await,
        Commands::Analysis { name: None } => run_all(&cfg).await,
        Commands::Analysis { name: Some(name) } => run_single(&cfg, &name).await,
        Commands::List => list(&cfg),
        Commands::Verify { sample } => verify(&cfg, sample).await,
    }
}

fn archive_manager(cfg: &HarnessConfig) -> ArchiveManager {
    ArchiveManager::new(cfg.archive.clone(), cfg.paths.dataset_root.clone())
}

async fn setup(cfg: &HarnessConfig) -> anyhow::Result<ExitCode> {
    let manager = archive_manager(cfg);
    match manager.setup().await {
        Ok(SetupOutcome::Extracted { parts }) => {
            println!(
                "dataset extracted to {} ({parts} archive parts)",
                manager.dataset_root().display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Ok(SetupOutcome::AlreadyReady) => {
            println!("dataset already ready at {}", manager.dataset_root().display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(target: "archive", error = %e, "setup failed");
            eprintln!("setup failed: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn teardown(cfg: &HarnessConfig) -> anyhow::Result<ExitCode> {
    let manager = archive_manager(cfg);
    match manager.teardown().await {
        Ok(TeardownOutcome::Removed) => {
            println!("removed {}", manager.dataset_root().display())
        }
        Ok(TeardownOutcome::NotPresent) => {
            println!("nothing to remove at {}", manager.dataset_root().display())
        }
        Err(e) => {
            warn!(target: "archive", error = %e, "teardown incomplete");
            eprintln!("teardown incomplete: {e}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn batch_runner(cfg: &HarnessConfig) -> anyhow::Result<BatchRunner> {
    let ctx = RunContext::from_paths(&cfg.paths).context("resolving run paths")?;
    if !ctx.dataset_root.exists() {
        warn!(
            target: "harness",
            dataset_root = %ctx.dataset_root.display(),
            "dataset root does not exist; run `setup` first"
        );
    }
    let period = Duration::from_secs(cfg.runner.progress_interval_secs);
    Ok(BatchRunner::new(ctx).with_progress_interval(Some(period)))
}

async fn run_all(cfg: &HarnessConfig) -> anyhow::Result<ExitCode> {
    let discovery = ScriptDiscovery::new(&cfg.analysis);
    let units: Vec<Arc<dyn Runnable>> = discovery
        .list_all()?
        .map(|unit| Arc::new(unit) as Arc<dyn Runnable>)
        .collect();
    if units.is_empty() {
        warn!(
            target: "harness",
            dir = %discovery.dir().display(),
            "no analyses found"
        );
    }

    let runner = batch_runner(cfg)?;
    let limit = cfg.runner.concurrency_limit();
    let started_at = Utc::now();

    let results = tokio::select! {
        results = runner.run_many(units, limit) => results,
        _ = shutdown_signal() => {
            warn!(target: "harness", "interrupted, stopping running analyses");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    let status = summarize(&results, &mut io::stdout().lock())?;

    let report = BatchReport::new(
        &results,
        started_at,
        Utc::now(),
        limit,
        runner.metrics().peak_in_flight(),
    );
    report.log();
    if cfg.runner.write_report {
        match report.write_to(&runner.context().output_dir) {
            Ok(path) => info!(target: "harness", path = %path.display(), "run report written"),
            Err(e) => warn!(target: "harness", error = %format!("{e:#}"), "failed to write run report"),
        }
    }

    Ok(ExitCode::from(status.exit_code()))
}

async fn run_single(cfg: &HarnessConfig, name: &str) -> anyhow::Result<ExitCode> {
    let discovery = ScriptDiscovery::new(&cfg.analysis);
    let unit = match discovery.resolve(name) {
        Ok(unit) => unit,
        Err(e @ (DiscoveryError::NotFound { .. } | DiscoveryError::Ambiguous { .. })) => {
            eprintln!("{e}");
            return Ok(ExitCode::from(EXIT_NOT_FOUND));
        }
        Err(e) => return Err(e.into()),
    };

    let runner = batch_runner(cfg)?;
    let result = tokio::select! {
        result = runner.run_one(&unit) => result,
        _ = shutdown_signal() => {
            warn!(target: "harness", unit = %unit.name, "interrupted, stopping analysis");
            return Ok(ExitCode::from(EXIT_INTERRUPTED));
        }
    };

    io::stdout().write_all(result.stdout.as_bytes())?;
    io::stderr().write_all(result.stderr.as_bytes())?;

    let outcome = if result.succeeded { "succeeded" } else { "failed" };
    println!(
        "{} {outcome} in {}",
        result.name,
        format_duration(result.duration)
    );

    Ok(if result.succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn list(cfg: &HarnessConfig) -> anyhow::Result<ExitCode> {
    let discovery = ScriptDiscovery::new(&cfg.analysis);
    let mut out = io::stdout().lock();
    for unit in discovery.list_all()? {
        writeln!(out, "{}\t{}", unit.name, unit.path.display())?;
    }
    Ok(ExitCode::SUCCESS)
}

async fn verify(cfg: &HarnessConfig, sample: usize) -> anyhow::Result<ExitCode> {
    let layout = DatasetLayout::new(cfg.paths.dataset_root.clone());
    let report = tokio::task::spawn_blocking(move || dataset::verify(&layout, sample))
        .await
        .context("verification task failed")??;

    print_verify_report(&report, &mut io::stdout().lock())?;

    Ok(if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_verify_report<W: Write>(report: &VerifyReport, out: &mut W) -> io::Result<()> {
    for check in [&report.markets, &report.trades] {
        writeln!(
            out,
            "{}: {} rows checked across {} partitions, {} violations",
            check.table, check.rows_checked, check.partitions, check.violation_count
        )?;
        for v in &check.violations {
            writeln!(out, "  - {}: {}", v.key, v.violation)?;
        }
        if check.violation_count > check.violations.len() {
            writeln!(
                out,
                "  ... {} more",
                check.violation_count - check.violations.len()
            )?;
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(target: "harness", error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(target: "harness", error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
