#![warn(missing_docs)]

//! `flowrepo-node`: opens a flow repository, runs its maintenance tasks and
//! shuts it down cleanly on Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use flowrepo_core::RepositoryConfig;
use flowrepo_session::{FlowRepository, MaintenanceTasks};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line of the repository node.
#[derive(Debug, Parser)]
#[command(name = "flowrepo-node", version, about = "Durable FlowFile repository node")]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(long, env = "FLOWREPO_CONFIG", default_value = "/etc/flowrepo/flowrepo.toml")]
    config: PathBuf,

    /// Overrides `data_dir` from the configuration.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Recover, print the repository status and exit.
    #[arg(long)]
    check: bool,

    /// Seconds between status log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    status_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = if cli.config.exists() {
        RepositoryConfig::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", cli.config.display());
        RepositoryConfig::default()
    };
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }

    let repo = tokio::task::spawn_blocking(move || FlowRepository::open(config))
        .await?
        .context("opening flow repository")?;
    log_status(&repo);

    if cli.check {
        tokio::task::spawn_blocking(move || repo.shutdown()).await??;
        return Ok(());
    }

    let maintenance = MaintenanceTasks::start(repo.clone());
    let status_every = Duration::from_secs(cli.status_interval_secs);
    let status_repo = repo.clone();
    let status_task = tokio::spawn(async move {
        if status_every.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(status_every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            log_status(&status_repo);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("shutdown requested");
    status_task.abort();
    let stats = maintenance.shutdown().await?;
    tracing::info!(live_flowfiles = stats.live_flowfiles, "final checkpoint written");
    Ok(())
}

fn log_status(repo: &FlowRepository) {
    let status = repo.status();
    for (id, size) in &status.connections {
        tracing::info!(
            connection = %id,
            queued = size.object_count(),
            queued_bytes = size.byte_count(),
            swapped = size.swapped_count,
            in_flight = size.in_flight_count,
            "queue status"
        );
    }
    tracing::info!(
        containers = status.content.tracked_containers,
        live_flowfiles = status.ledger.live_flowfiles,
        generation = status.ledger.generation,
        "repository status"
    );
}
