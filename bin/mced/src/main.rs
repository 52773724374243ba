//! ---
//! mce_section: "01-core-functionality"
//! mce_subsection: "binary"
//! mce_type: "source"
//! mce_scope: "code"
//! mce_description: "Binary entrypoint for the MCE daemon."
//! mce_version: "v0.1.0"
//! mce_owner: "tbd"
//! ---
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mce_common::config::AppConfig;
use mce_common::logging::init_tracing;
use mce_engine::{CollectionPipeline, PipelineConfig, SourceSettings};
use mce_metrics::{new_registry, spawn_http_server, PipelineMetrics};
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Message collection engine daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the collection pipeline")]
    Run,
    #[command(about = "Load and validate the configuration, then exit")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/example.toml"));
    candidates.push(PathBuf::from("/etc/mce/config.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_daemon(loaded.config, loaded.source).await,
        Commands::CheckConfig => {
            println!("configuration at {} is valid", loaded.source.display());
            Ok(())
        }
    }
}

async fn run_daemon(config: AppConfig, config_path: PathBuf) -> Result<()> {
    init_tracing("mced", &config.logging)?;
    info!(config_path = %config_path.display(), "configuration loaded");

    let mut metrics = None;
    let mut metrics_server = None;
    if config.metrics.enabled {
        let registry = new_registry();
        metrics = Some(PipelineMetrics::new(registry.clone())?);
        metrics_server = Some(spawn_http_server(registry, config.metrics.listen)?);
    } else {
        info!("metrics exporter disabled by configuration");
    }

    let mut pipeline = CollectionPipeline::new(build_pipeline_config(&config));
    if let Some(metrics) = metrics {
        pipeline = pipeline.with_metrics(metrics);
    }
    let handle = pipeline.start()?;

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

fn build_pipeline_config(config: &AppConfig) -> PipelineConfig {
    PipelineConfig {
        source: SourceSettings::new(
            config.source_api.base_url.clone(),
            config.source_api.auth_token.clone(),
        )
        .with_timeout(config.source_timeout())
        .with_rate_limit(config.source_api.rate_limit, config.rate_limit_period()),
        processing_base_url: config.processing_api.base_url.clone(),
        processing_timeout: config.processing_timeout(),
        processing_workers: config.processing_workers(),
        storage_base_url: config.storage_api.base_url.clone(),
        storage_timeout: config.storage_timeout(),
        storage_workers: config.storage_workers(),
    }
}
