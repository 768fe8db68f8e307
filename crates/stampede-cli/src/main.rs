//! Headless CLI: `stampede run <config>`, `stampede worker --port <p>`,
//! `stampede distributed <config> --workers <list> --strategy <s>`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;

use stampede_core::distributed::Coordinator;
use stampede_core::engine::{run_test, EngineEvent};
use stampede_core::model::{
    io::read_config, DistributedConfig, DistributionStrategy, WorkerSpec,
};
use stampede_core::worker;
use stampede_core::StampedeError;

#[derive(Parser)]
#[command(name = "stampede", version, about = "Distributed load-generation engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a test configuration locally.
    Run {
        /// Path to the JSON test configuration.
        config: PathBuf,
        /// Write the final summary as JSON to this path.
        #[arg(long)]
        summary: Option<PathBuf>,
    },
    /// Serve the worker HTTP protocol for a coordinator.
    Worker {
        #[arg(long, default_value_t = worker::DEFAULT_WORKER_PORT)]
        port: u16,
    },
    /// Coordinate a test across remote workers.
    Distributed {
        /// Path to the JSON test configuration.
        config: PathBuf,
        /// Worker addresses (`host:port`), comma separated. Overrides the
        /// configuration's own worker list when given.
        #[arg(long, value_delimiter = ',')]
        workers: Vec<String>,
        #[arg(long, value_enum, default_value_t = StrategyArg::Even)]
        strategy: StrategyArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Even,
    CapacityBased,
    RoundRobin,
    Geographic,
}

impl From<StrategyArg> for DistributionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Even => DistributionStrategy::Even,
            StrategyArg::CapacityBased => DistributionStrategy::CapacityBased,
            StrategyArg::RoundRobin => DistributionStrategy::RoundRobin,
            StrategyArg::Geographic => DistributionStrategy::Geographic,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command {
        Command::Run { config, summary } => run(config, summary).await,
        Command::Worker { port } => worker::serve(port).await.map(|()| true),
        Command::Distributed {
            config,
            workers,
            strategy,
        } => distributed(config, workers, strategy.into()).await,
    };

    match outcome {
        // Individual step failures still exit 0; only escalated aborts and
        // configuration errors are non-zero.
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            tracing::error!("run failed (escalated abort)");
            ExitCode::FAILURE
        }
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config_path: PathBuf, summary_path: Option<PathBuf>) -> Result<bool, StampedeError> {
    let config = read_config(&config_path).await?;
    let test_name = config.name.clone();
    tracing::info!(test = %test_name, "starting run");

    let (event_tx, mut event_rx) = mpsc::channel(4096);
    let handle = run_test(config, event_tx).await?;

    let cancel = handle.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping test");
            cancel.cancel();
        }
    });

    let mut final_summary = None;
    let mut failed = false;
    while let Some(event) = event_rx.recv().await {
        match event {
            EngineEvent::Progress {
                completed_requests,
                total_errors,
                active_vus,
                current_rps,
                p95_ms,
                ..
            } => {
                tracing::info!(
                    requests = completed_requests,
                    errors = total_errors,
                    active_vus,
                    rps = format!("{current_rps:.1}"),
                    p95_ms,
                    "progress"
                );
            }
            EngineEvent::Complete {
                summary,
                failed: run_failed,
            } => {
                final_summary = Some(summary);
                failed = run_failed;
                break;
            }
            _ => {}
        }
    }
    handle.wait().await;

    if let Some(summary) = final_summary {
        let json = serde_json::to_string_pretty(&summary)?;
        match &summary_path {
            Some(path) => tokio::fs::write(path, &json).await?,
            None => println!("{json}"),
        }
        tracing::info!(
            total = summary.total_requests,
            success_rate = format!("{:.2}%", summary.success_rate),
            rps = format!("{:.1}", summary.requests_per_second),
            "run complete"
        );
    }

    Ok(!failed)
}

async fn distributed(
    config_path: PathBuf,
    worker_addresses: Vec<String>,
    strategy: DistributionStrategy,
) -> Result<bool, StampedeError> {
    let mut config = read_config(&config_path).await?;

    // CLI-supplied workers replace the configuration's distributed section.
    if !worker_addresses.is_empty() {
        let workers = worker_addresses
            .into_iter()
            .map(|address| WorkerSpec {
                address,
                capacity: 1,
                region: None,
            })
            .collect();
        let mut section = config.distributed.take().unwrap_or(DistributedConfig {
            workers: Vec::new(),
            strategy,
            heartbeat_interval: None,
            retry_failed: false,
            synchronized: true,
        });
        section.workers = workers;
        section.strategy = strategy;
        config.distributed = Some(section);
    }

    let coordinator = std::sync::Arc::new(Coordinator::new(config)?);

    {
        let coordinator = std::sync::Arc::clone(&coordinator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; stopping workers");
                coordinator.stop().await;
            }
        });
    }

    let combined = coordinator.run().await?;
    println!("{}", serde_json::to_string_pretty(&combined)?);
    tracing::info!(
        total = combined.total_requests,
        workers = combined.workers.len(),
        success_rate = format!("{:.2}%", combined.success_rate),
        "distributed run complete"
    );
    Ok(true)
}
