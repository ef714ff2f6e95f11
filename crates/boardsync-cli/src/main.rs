use std::path::PathBuf;

use anyhow::{bail, Result};
use boardsync_sync::{BoardInput, SyncConfig, SyncOptions};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "boardsync")]
#[command(about = "Reconcile the project board into the project tables")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass against the live board or a recorded fixture.
    Sync(SyncArgs),
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Load configuration and reference data without writing.
    Check,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Replay recorded board pages instead of calling the board API.
    #[arg(long, value_name = "PAGES_JSON")]
    fixture: Option<PathBuf>,
    #[arg(long)]
    projects_only: bool,
    #[arg(long)]
    no_reports: bool,
    /// Exit non-zero when a partition or record failed.
    #[arg(long)]
    strict: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn sync(args: SyncArgs) -> Result<()> {
    let mut config = SyncConfig::from_env();
    if args.no_reports {
        config.write_reports = false;
    }
    let input = match args.fixture {
        Some(path) => BoardInput::Fixture(path),
        None => BoardInput::Live,
    };
    let options = SyncOptions {
        projects_only: args.projects_only,
    };

    let outcome = boardsync_sync::run_sync_once(&config, input, options).await?;
    let report = &outcome.report;
    println!(
        "sync {}: run_id={} projects(+{} ~{} ={} skipped {}) assignments(+{} dates {} ={}) unresolved={} failed_partitions={}",
        if report.is_partial() { "partial" } else { "complete" },
        report.run_id,
        report.projects.inserted,
        report.projects.updated,
        report.projects.unchanged,
        report.projects.skipped,
        report.assignments.inserted,
        report.assignments.updated_dates,
        report.assignments.unchanged,
        report.unresolved.len(),
        report.failed_partitions.len(),
    );
    if let Some(dir) = &outcome.reports_dir {
        println!("report written to {}", dir.display());
    }

    if args.strict && report.is_partial() {
        bail!("sync run {} finished partially", report.run_id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let markdown =
                boardsync_sync::report_recent_markdown(runs, Some(&config.workspace_root))?;
            println!("{markdown}");
        }
        Commands::Check => {
            let config = SyncConfig::from_env();
            let check = boardsync_sync::check_store(&config).await?;
            println!(
                "store ok: board={} partitions={} developers={} teams={} team_name_map={} aliases={}",
                check.board_id,
                check.partitions,
                check.developers,
                check.teams,
                check.team_name_mappings,
                check.aliases,
            );
        }
    }

    Ok(())
}
