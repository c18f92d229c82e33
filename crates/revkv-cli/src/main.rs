//! revkv - exercise the revisioned key-value backend

use clap::{Parser, Subcommand};
use revkv_cli::{run_bench, run_smoke, BenchOptions, NodeConfig};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "revkv")]
#[command(about = "Revisioned key-value backend over a size-limited row store")]
#[command(version)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "REVKV_CONFIG")]
    config: Option<PathBuf>,

    /// Override the backend row size
    #[arg(long)]
    row_size: Option<usize>,

    /// Enable debug logging
    #[arg(short, long, env = "REVKV_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Insert, update, read back and provoke a conflict on one key
    Smoke,
    /// Run concurrent update loops
    Bench {
        #[arg(long, default_value = "8")]
        writers: usize,
        #[arg(long, default_value = "100")]
        updates: usize,
        #[arg(long, default_value = "4096")]
        value_size: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("revkv={0},revkv_core={0},revkv_cli={0}", log_level).into()
    });
    if args.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(row_size) = args.row_size {
        config.backend.max_row_size = row_size;
        config.medium_max_row_size = config.medium_max_row_size.max(row_size);
    }
    tracing::debug!(?config, "Loaded configuration");

    match args.command {
        Command::Smoke => {
            let report = run_smoke(&config).await?;
            println!(
                "smoke ok: created={} updated={} updated_again={} chunks={} events={}",
                report.created,
                report.first_update,
                report.second_update,
                report.chunks_per_update,
                report.events
            );
        }
        Command::Bench {
            writers,
            updates,
            value_size,
        } => {
            let options = BenchOptions {
                writers,
                updates_per_writer: updates,
                value_size,
            };
            let report = run_bench(&config, &options).await?;
            println!(
                "bench: {} ops in {:?} ({:.0} ops/s), revision {}",
                report.operations,
                report.elapsed,
                report.ops_per_second(),
                report.final_revision
            );
        }
    }

    Ok(())
}
