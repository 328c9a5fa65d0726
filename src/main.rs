//! Event Pipeline - Main Entry Point
//!
//! Reads raw events as JSON lines and drives each one through the pipeline
//! with the dry-run steps, then prints a summary with the collected metrics.

use clap::{Parser, Subcommand};
use event_pipeline::config::IngestionConfig;
use event_pipeline::harness::{build_context, drive_events, replay_dead_letters, RunSummary};
use event_pipeline::observability::{init_default_logging, MetricsCollector};
use event_pipeline::pipeline::ALL_STEPS;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{error, info};

/// Event ingestion pipeline runner
#[derive(Parser)]
#[command(name = "event-pipeline")]
#[command(about = "Run analytics events through the ingestion pipeline")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "EVENT_PIPELINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run raw events (one JSON document per line) through the pipeline
    Run {
        /// Input file; reads stdin when omitted
        #[arg(short, long, value_name = "FILE")]
        input: Option<PathBuf>,
    },
    /// Re-run the original events stored in a dead-letter file
    Replay {
        /// Dead-letter file to read records from
        #[arg(value_name = "FILE")]
        dead_letter_file: PathBuf,
    },
    /// List the registered pipeline steps
    Steps,
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run { input } => run_events(config, input).await,
        Commands::Replay { dead_letter_file } => {
            replay(config, &dead_letter_file).await
        }
        Commands::Steps => list_steps(),
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(
    config_path: Option<&Path>,
) -> Result<IngestionConfig, Box<dyn std::error::Error>> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(IngestionConfig::load_from_file(path)?)
        }
        None => {
            for path_str in ["pipeline.toml", "config/pipeline.toml"] {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(IngestionConfig::load_from_file(&path)?);
                }
            }

            info!("No configuration file found, using defaults");
            Ok(IngestionConfig::default())
        }
    }
}

async fn run_events(
    config: IngestionConfig,
    input: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(MetricsCollector::new());
    let context = build_context(&config, metrics.clone()).await?;

    let summary = match input {
        Some(path) => {
            info!("Reading events from: {}", path.display());
            let file = tokio::fs::File::open(&path).await?;
            drive_events(context, file, config.pipeline.max_concurrent_events).await?
        }
        None => {
            info!("Reading events from stdin");
            drive_events(
                context,
                tokio::io::stdin(),
                config.pipeline.max_concurrent_events,
            )
            .await?
        }
    };

    print_report(&summary, &metrics)
}

async fn replay(
    config: IngestionConfig,
    dead_letter_file: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = Arc::new(MetricsCollector::new());
    let summary = replay_dead_letters(&config, dead_letter_file, metrics.clone()).await?;
    print_report(&summary, &metrics)
}

fn print_report(
    summary: &RunSummary,
    metrics: &MetricsCollector,
) -> Result<(), Box<dyn std::error::Error>> {
    let report = serde_json::json!({
        "summary": summary,
        "metrics": metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    info!(
        events = summary.events,
        completed = summary.completed,
        failed = summary.failed,
        dead_lettered = summary.dead_lettered,
        "Run complete"
    );
    Ok(())
}

fn list_steps() -> Result<(), Box<dyn std::error::Error>> {
    for step in ALL_STEPS {
        let marker = if step.is_pre_durability() {
            "dead-letters on failure"
        } else {
            "after event storage"
        };
        println!("{:<28} {}", step.as_str(), marker);
    }
    Ok(())
}

fn handle_config_command(
    config: IngestionConfig,
    show: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(&config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
