//! Fleet tick background worker.
//!
//! Runs [`FleetTick`] on a fixed interval. Ticks never overlap: the next
//! one starts only after the previous one returned.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use super::tick::{FleetTick, TickError};

pub struct TickWorker {
    tick: FleetTick,
    interval: Duration,
}

impl TickWorker {
    pub fn new(tick: FleetTick, interval: Duration) -> Self {
        Self { tick, interval }
    }

    /// Run ticks until shutdown is signaled. The first tick runs
    /// immediately. Returns early with the error of a fatal tick.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), TickError> {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting fleet tick worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick.run().await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            error!(error = %e, "Fatal tick error, stopping worker");
                            return Err(e);
                        }
                        Err(e) => error!(error = %e, "Tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Fleet tick worker shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}
