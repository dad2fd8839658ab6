//! Placedex CLI - Place indexing tool
//!
//! Computes the search-ready state of a geocoding database, rank by rank.

mod commands;

use clap::{Parser, Subcommand};
use placedex_core::config::DEFAULT_DSN;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "placedex")]
#[command(about = "Rank-ordered, resumable indexing of a geocoding place database")]
#[command(version)]
struct Cli {
    /// Increase verboseness of output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print only errors and warnings
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Database connection string (libpq keyword form or postgres:// URL)
    #[arg(long, global = true, env = "PLACEDEX_DATABASE_DSN", default_value = DEFAULT_DSN)]
    dsn: String,

    /// Number of parallel workers (0 or less: number of CPUs)
    #[arg(
        short = 'j',
        long,
        global = true,
        env = "PLACEDEX_THREADS",
        allow_negative_numbers = true
    )]
    threads: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index new and modified places
    Index {
        /// Index only administrative boundaries
        #[arg(long, conflicts_with = "no_boundaries")]
        boundaries_only: bool,

        /// Index everything except administrative boundaries
        #[arg(long)]
        no_boundaries: bool,

        /// Minimum/starting rank
        #[arg(short = 'r', long, default_value = "0", allow_negative_numbers = true)]
        minrank: i64,

        /// Maximum/finishing rank
        #[arg(short = 'R', long, default_value = "30", allow_negative_numbers = true)]
        maxrank: i64,

        /// Places claimed per worker transaction
        #[arg(long, default_value = "100")]
        batch_size: usize,

        /// Retries after transient database errors
        #[arg(long, default_value = "3")]
        max_retries: u32,

        /// Skip places whose computation fails instead of aborting the run
        #[arg(long)]
        skip_failed: bool,
    },

    /// Show indexing progress and pending places per rank
    Status {
        /// Output format (json, table)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => EnvFilter::new("warn"),
        (false, 0) => EnvFilter::new("info"),
        (false, 1) => EnvFilter::new("debug"),
        (false, _) => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Execute command
    match cli.command {
        Commands::Index {
            boundaries_only,
            no_boundaries,
            minrank,
            maxrank,
            batch_size,
            max_retries,
            skip_failed,
        } => {
            commands::index::run(commands::index::IndexArgs {
                dsn: cli.dsn,
                threads: worker_threads(cli.threads),
                boundaries_only,
                no_boundaries,
                minrank,
                maxrank,
                batch_size,
                max_retries,
                skip_failed,
            })
            .await
        }
        Commands::Status { format } => commands::status::run(&cli.dsn, &format).await,
    }
}

/// A non-positive thread count leaves the choice to the engine
fn worker_threads(requested: Option<i64>) -> Option<usize> {
    requested
        .and_then(|n| usize::try_from(n).ok())
        .filter(|n| *n > 0)
}
