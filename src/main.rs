//! splitwatch - real-time split-purchase (structuring) detector
//!
//! Reads newline-delimited JSON purchase events, aggregates them per
//! (actor, asset) and reports sequences of similar-sized buys.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

use splitwatch::cli::commands;
use splitwatch::config::Config;

/// Split-purchase detector
#[derive(Parser)]
#[command(name = "splitwatch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "SPLITWATCH_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detector on a live event stream
    Run {
        /// JSONL event file, or "-" for stdin (default)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Replay a recorded JSONL event file and flush at the end
    Replay {
        /// JSONL event file
        input: PathBuf,
    },

    /// Show current configuration (credentials masked)
    Config,

    /// Score a hypothetical purchase sequence
    Score {
        /// Purchase amounts in USD, in order
        #[arg(required = true, num_args = 1..)]
        amounts: Vec<f64>,

        /// Minutes between the first and last purchase
        #[arg(long, default_value = "20")]
        minutes: f64,

        /// Actor age in days
        #[arg(long)]
        actor_age_days: Option<f64>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("splitwatch=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { input } => commands::run(&config, input.as_deref()).await,
        Commands::Replay { input } => commands::replay(&config, &input).await,
        Commands::Config => commands::show_config(&config),
        Commands::Score {
            amounts,
            minutes,
            actor_age_days,
        } => commands::score(&config, &amounts, minutes, actor_age_days),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
