//! fleetd: the fleetgrid daemon.
//!
//! Single binary that assembles the fleet controller:
//! - Fleet state and checkpoint store (redb)
//! - Metric registry and synthetic load feed
//! - Health probes
//! - Autoscaler and rollout engine, arbitrated by the reconciler
//! - In-memory fleet driver
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleet.toml
//! fleetd validate --config fleet.toml
//! ```

mod config;
mod simulation;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetgrid_health::ProbeBoard;
use fleetgrid_metrics::MetricsRegistry;
use fleetgrid_reconcile::{ControllerHandle, FleetController, Reconciler, SimDriver};
use fleetgrid_rollout::RolloutSpec;
use fleetgrid_state::FleetStore;

use crate::config::DaemonConfig;
use crate::simulation::LoadFeeder;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller against a simulated fleet.
    Run {
        /// Path to fleet.toml.
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Check a configuration file and exit.
    Validate {
        #[arg(long, default_value = "fleet.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            let config = DaemonConfig::from_file(&config)?;
            run(config).await
        }
        Command::Validate { config } => {
            let parsed = DaemonConfig::from_file(&config)?;
            println!(
                "{}: ok ({} desired in [{}, {}], scaling {}, rollout {})",
                config.display(),
                parsed.fleet.desired_capacity,
                parsed.fleet.min_capacity,
                parsed.fleet.max_capacity,
                if parsed.scaling.is_some() { "on" } else { "off" },
                parsed
                    .rollout
                    .as_ref()
                    .map_or("none", |r| r.target_version.as_str()),
            );
            Ok(())
        }
    }
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    info!(stable = %config.fleet.stable_version, "fleetgrid daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let metrics = Arc::new(MetricsRegistry::default());
    let probes = Arc::new(ProbeBoard::default());
    let driver = Arc::new(SimDriver::with_probes(probes.clone()));

    let mut reconciler = Reconciler::new(
        config.initial_state()?,
        metrics.clone(),
        probes,
        driver,
        config.reconciler.clone(),
    )
    .with_health(config.health.clone());

    if let Some(dir) = &config.fleet.data_dir {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("fleetgrid.redb");
        let store = FleetStore::open(&path)?;
        info!(path = ?path, "fleet store opened");
        reconciler = reconciler.with_store(store)?;
    }
    reconciler.set_policy(config.scaling.clone())?;

    let (controller, handle) = FleetController::new(reconciler, &config.reconciler);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let controller_task = tokio::spawn(controller.run(shutdown_rx.clone()));

    let feeder = LoadFeeder::new(config.simulation.clone(), metrics, handle.clone());
    let feeder_task = tokio::spawn(feeder.run(shutdown_rx));

    let rollout_task = config.rollout.clone().map(|spec| {
        let handle = handle.clone();
        let shutdown = shutdown_tx.subscribe();
        let poll = config.reconciler.tick_interval();
        tokio::spawn(submit_when_settled(handle, spec, poll, shutdown))
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for ctrl-c, shutting down"),
    }
    let _ = shutdown_tx.send(true);

    if let Some(task) = rollout_task {
        let _ = task.await;
    }
    let _ = feeder_task.await;
    let reconciler = controller_task.await?;

    let status = serde_json::to_string_pretty(&reconciler.fleet_status())?;
    info!(%status, "final fleet status");
    info!("fleetgrid daemon stopped");
    Ok(())
}

/// Submit the configured rollout once the baseline fleet is fully ready.
async fn submit_when_settled(
    handle: ControllerHandle,
    spec: RolloutSpec,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match handle.fleet_status().await {
            Ok(status) if status.active_rollout.is_some() => {
                info!("a rollout is already active, skipping configured rollout");
                return;
            }
            Ok(status) if status.ready >= status.desired_capacity => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "controller unavailable, configured rollout not submitted");
                return;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = shutdown.changed() => return,
        }
    }

    match handle.start_rollout(spec).await {
        Ok(id) => info!(rollout = %id, "configured rollout submitted"),
        Err(e) => warn!(error = %e, "configured rollout rejected"),
    }
}
