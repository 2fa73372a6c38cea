use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use armada::config::ArmadaConfig;
use armada::error::Result;
use armada::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "armada",
    about = "Run a massively-parallel autonomous build against a target repository."
)]
struct Cli {
    /// Build request, e.g. "Build the API server according to SPEC.md"
    request: String,

    /// Path to config.toml (defaults to ./armada.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target repository working copy (overrides config)
    #[arg(long)]
    repo: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("armada=debug")
    } else {
        EnvFilter::new("armada=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("armada.toml"));
    let mut config = ArmadaConfig::load(&config_path).await?;
    if let Some(repo) = cli.repo {
        config.target_repo_path = repo;
    }
    if config.log_path.as_os_str().is_empty() {
        config.log_path = PathBuf::from("armada-run.jsonl");
    }

    let orchestrator = Orchestrator::new(config)?;
    let snapshot = orchestrator.run(&cli.request).await;

    println!();
    println!("Run finished.");
    println!(
        "  tasks:   {} done / {} failed / {} pending",
        snapshot.completed_tasks, snapshot.failed_tasks, snapshot.pending_tasks
    );
    println!(
        "  merges:  {} merged / {} failed / {} conflicts",
        snapshot.total_merged, snapshot.total_merge_failed, snapshot.total_conflicts
    );
    println!(
        "  tokens:  {}  ({:.0} commits/hr)",
        snapshot.total_tokens_used, snapshot.commits_per_hour
    );
    if let Some(passed) = snapshot.finalization_passed {
        println!("  finalization: {}", if passed { "passed" } else { "failed" });
    }

    Ok(())
}
