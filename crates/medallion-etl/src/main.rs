//! medallion-etl - bronze/silver/gold batch pipeline

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medallion_common::logging::{init_logging, LogConfig, LogLevel};
use medallion_etl::config::PipelineConfig;
use medallion_etl::execution_log::{ExecutionLog, PgExecutionLog};
use medallion_etl::layers::{BronzeSources, LayerRegistry};
use medallion_etl::orchestrator::PipelineOrchestrator;
use medallion_etl::scheduler::PipelineScheduler;
use medallion_etl::sink::postgres::lazy_pool;
use medallion_etl::sink::PgWarehouse;
use medallion_etl::Layer;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "medallion-etl")]
#[command(author, version, about = "Bronze/silver/gold batch pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the pipeline on a fixed interval until interrupted (default)
    Run,

    /// Run one bronze → silver → gold cycle
    Once,

    /// Run a single layer with retry and execution logging
    Layer {
        /// bronze, silver or gold
        layer: Layer,
    },

    /// Show the most recent execution log entries
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::from_env_with(
        LogConfig::default()
            .with_level(log_level)
            .with_file_prefix("medallion-etl"),
    )?;
    let _guard = init_logging(&log_config)?;

    let config = PipelineConfig::load().context("Failed to load pipeline configuration")?;
    let log_store = &config.warehouse.execution_log;
    let execution_log = Arc::new(PgExecutionLog::new(
        lazy_pool(&log_store.url, &config.warehouse)?,
        log_store.schema.clone(),
    ));

    match cli.command.unwrap_or(Command::Run) {
        Command::History { limit } => {
            for entry in execution_log.recent(limit).await? {
                println!(
                    "{}  {:<16} {:<8} {}",
                    entry.execution_time.format("%Y-%m-%d %H:%M:%S"),
                    entry.step,
                    entry.status,
                    entry.message
                );
            }
        },
        Command::Once => {
            let orchestrator = build_orchestrator(&config, execution_log, true)?;
            let report = orchestrator.run_cycle().await?;
            info!(layers = report.layers.len(), "Pipeline cycle finished");
        },
        Command::Layer { layer } => {
            let orchestrator =
                build_orchestrator(&config, execution_log, layer == Layer::Bronze)?;
            let report = orchestrator.run_layer(layer).await?;
            info!(layer = %layer, attempts = report.attempts, "{}", report.totals());
        },
        Command::Run => {
            let orchestrator = Arc::new(build_orchestrator(&config, execution_log, true)?);
            let cancel = CancellationToken::new();

            let shutdown = cancel.clone();
            tokio::spawn(async move {
                shutdown_signal().await;
                info!("Shutdown requested, finishing current cycle");
                shutdown.cancel();
            });

            let cycles = PipelineScheduler::new(orchestrator, config.schedule.interval(), cancel)
                .spawn()
                .await?;
            info!(cycles, "Scheduler shut down gracefully");
        },
    }

    Ok(())
}

fn build_orchestrator(
    config: &PipelineConfig,
    execution_log: Arc<dyn ExecutionLog>,
    with_sources: bool,
) -> Result<PipelineOrchestrator> {
    let warehouse = Arc::new(PgWarehouse::connect_lazy(&config.warehouse)?);

    let registry = if with_sources {
        let sources = BronzeSources::from_config(config)?;
        LayerRegistry::new(sources, warehouse.clone(), warehouse)
    } else {
        LayerRegistry::downstream(warehouse.clone(), warehouse)
    };

    Ok(PipelineOrchestrator::new(
        registry.steps(),
        execution_log,
        config.retry.into(),
    ))
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
