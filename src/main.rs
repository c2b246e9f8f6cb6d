// ABOUTME: CLI entry point for record-sync
// ABOUTME: Parses commands and routes to the compare and sync handlers

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use record_sync::commands::{self, StorageTarget};

#[derive(Parser)]
#[command(name = "record-sync")]
#[command(about = "Reconcile persisted records against a new snapshot", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct InputArgs {
    /// TOML file describing the table, sync options and scope
    #[arg(long)]
    config: PathBuf,
    /// JSON array of objects forming the new snapshot
    #[arg(long)]
    input: PathBuf,
}

#[derive(Args, Clone)]
struct TargetArgs {
    /// SQLite database file holding the persisted records
    #[arg(long, conflicts_with = "postgres")]
    sqlite: Option<PathBuf>,
    /// PostgreSQL connection URL holding the persisted records
    #[arg(long, env = "RECORD_SYNC_POSTGRES_URL")]
    postgres: Option<String>,
    /// PostgreSQL schema containing the table
    #[arg(long = "pg-schema", default_value = "public")]
    pg_schema: String,
}

impl TargetArgs {
    fn into_target(self) -> anyhow::Result<StorageTarget> {
        StorageTarget::from_args(self.sqlite, self.postgres, self.pg_schema)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the snapshot against persisted records without writing
    Compare {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Apply the snapshot: create added, update changed, delete removed records
    Sync {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        target: TargetArgs,
        /// Do not insert added records
        #[arg(long)]
        skip_creates: bool,
        /// Do not write updated records
        #[arg(long)]
        skip_updates: bool,
        /// Do not delete removed records
        #[arg(long)]
        skip_deletes: bool,
        /// Maximum records per storage write
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Compare { input, target } => {
            commands::compare(commands::compare::CompareOptions {
                config: input.config,
                input: input.input,
                target: target.into_target()?,
            })
            .await
        }
        Commands::Sync {
            input,
            target,
            skip_creates,
            skip_updates,
            skip_deletes,
            batch_size,
        } => {
            commands::sync(commands::sync::SyncOptions {
                config: input.config,
                input: input.input,
                target: target.into_target()?,
                skip_creates,
                skip_updates,
                skip_deletes,
                batch_size,
            })
            .await
        }
    }
}
