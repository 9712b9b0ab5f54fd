//! Fleet operator
//!
//! Keeps the streaming instance fleet at its target shape: a warm pool of
//! free instances per region and track, a parked reserve of stopped
//! on-demand instances, and no instance reused after its session closed.

use std::sync::Arc;

use anyhow::Result;
use psfleet_operator::{
    config,
    db::Database,
    provider::Ec2Connector,
    scheduler::{FleetTick, TickWorker},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet operator");
    info!(
        environment = %config.environment,
        tick_interval_secs = config.tick_interval.as_secs(),
        spot_free_target = config.policy.spot.free_target,
        on_demand_free_target = config.policy.on_demand.free_target,
        on_demand_stopped_target = config.policy.on_demand.stopped_target,
        dry_run_probe = config.provider.dry_run_probe,
        "Configuration loaded"
    );

    // Connect to database
    let db = match Database::connect(&config.database).await {
        Ok(db) => {
            info!("Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    // Run migrations in dev mode
    if config.dev_mode {
        info!("Running database migrations (dev mode)");
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let ledger = Arc::new(db.ledger());
    let connector = Arc::new(Ec2Connector::new(
        config.credentials.clone(),
        config.provider.clone(),
    ));
    let tick = FleetTick::new(ledger, connector, config.reconciler_settings());
    let worker = TickWorker::new(tick, config.tick_interval);

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut worker_handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    // Wait for shutdown signal (Ctrl+C) or a fatal worker exit
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut worker_handle => {
            return match result {
                Ok(Ok(())) => {
                    info!("Fleet tick worker exited");
                    Ok(())
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Fleet tick worker failed");
                    Err(e.into())
                }
                Err(e) => {
                    error!(error = %e, "Fleet tick worker panicked");
                    Err(e.into())
                }
            };
        }
    }

    // Signal shutdown and let an in-flight tick finish
    let _ = shutdown_tx.send(true);

    info!("Waiting for fleet tick worker to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(60);
    match tokio::time::timeout(shutdown_timeout, worker_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "Fleet tick worker failed during shutdown"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Fleet tick worker did not shut down in time"),
    }

    info!("Fleet operator shutdown complete");
    Ok(())
}
