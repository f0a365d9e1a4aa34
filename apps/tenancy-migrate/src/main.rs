//! `migrate`: apply, revert and inspect tenant-isolation schema steps.

mod settings;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tenancy_db::TenancyDb;
use tenancy_db::config::{LoggingConfig, TenancyConfig};
use tenancy_db::migrate::{MigrateError, Orchestrator};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Parser)]
#[command(name = "migrate", version, about = "Tenant isolation schema evolution")]
struct Cli {
    /// Path to the configuration file (default: config/tenancy.yaml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log verbosity (-v debug, -vv trace); overrides the configured level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
enum Command {
    /// Apply pending steps
    Up {
        /// Stop after this sequence id
        #[arg(long)]
        to: Option<i64>,
    },
    /// Revert the most recently applied steps
    Down {
        #[arg(default_value_t = 1)]
        n: usize,
    },
    /// List every step with its applied timestamp or `pending`
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match settings::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.logging, cli.verbose);

    match run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<MigrateError>() {
                Some(MigrateError::Step {
                    sequence_id,
                    source,
                }) => eprintln!("error: step {sequence_id} failed: {source}"),
                _ => eprintln!("error: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &TenancyConfig) -> Result<()> {
    let db = TenancyDb::connect(&config.database.dsn, config.database.connect_opts()).await?;
    let orchestrator = Orchestrator::new(&db);
    let steps = &config.steps;

    match command {
        Command::Up { to } => {
            let report = orchestrator.apply(steps, to).await?;
            for step in &report.applied {
                println!("applied {} {}", step.sequence_id, step.description);
                for change in &step.changes {
                    println!("  {change}");
                }
            }
            println!(
                "{} applied, {} already up to date",
                report.applied.len(),
                report.skipped
            );
        }
        Command::Down { n } => {
            let report = orchestrator.revert(steps, n).await?;
            for step in &report.reverted {
                println!("reverted {} {}", step.sequence_id, step.description);
                for change in &step.changes {
                    println!("  {change}");
                }
            }
            println!("{} reverted", report.reverted.len());
        }
        Command::Status => {
            for status in orchestrator.status(steps).await? {
                let state = status
                    .applied_at
                    .map_or_else(|| "pending".to_owned(), |ts| format!("applied {}", ts.to_rfc3339()));
                println!("{:>6}  {:<40}  {state}", status.sequence_id, status.description);
            }
        }
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig, verbose: u8) {
    let level = match verbose {
        0 => config.level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let registry = tracing_subscriber::registry().with(filter);
    // Logs go to stderr so stdout stays a clean report.
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
