//! One pass over every region.

use std::sync::Arc;

use psfleet_id::RegionId;
use psfleet_reconcile::Track;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use super::error::{ReconcileError, ReconcileResult, Scope};
use super::occupancy::OccupancyUpdater;
use super::reaper::{ClosedSessionReaper, ReapOutcome};
use super::reconciler::{InstanceReconciler, TrackOutcome, COMPONENT as RECONCILER};
use super::ReconcilerSettings;
use crate::db::{DbError, LedgerRepository, Region};
use crate::provider::ProviderConnector;

/// Errors that end a tick early.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("failed to list regions: {0}")]
    Regions(#[source] DbError),

    #[error("tick aborted: {0}")]
    Aborted(#[source] ReconcileError),
}

impl TickError {
    /// Whether the process should stop instead of waiting for the next tick.
    pub fn is_fatal(&self) -> bool {
        match self {
            TickError::Regions(e) => e.is_connectivity(),
            TickError::Aborted(e) => e.is_fatal(),
        }
    }
}

/// Outcome of one region/track reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackReport {
    pub region_id: RegionId,
    pub track: Track,
    pub outcome: TrackOutcome,
}

/// What a tick did, including the per-region failures it skipped past.
#[derive(Debug, Default)]
pub struct TickReport {
    pub regions: usize,
    pub tracks: Vec<TrackReport>,
    pub occupied: u64,
    pub reaped: ReapOutcome,
    pub failures: Vec<ReconcileError>,
}

impl TickReport {
    pub fn outcome(&self, region_id: RegionId, track: Track) -> Option<&TrackOutcome> {
        self.tracks
            .iter()
            .find(|report| report.region_id == region_id && report.track == track)
            .map(|report| &report.outcome)
    }

    /// Keep going after a routine failure; stop on a fatal one.
    fn absorb(&mut self, err: ReconcileError) -> Result<(), TickError> {
        let scope = err.scope();
        let (component, region_id, track) = (
            scope.component,
            scope.region_id,
            scope.track.map(|track| track.as_str()),
        );
        if err.is_fatal() {
            error!(component, %region_id, track, error = %err, "Ledger unreachable, aborting tick");
            return Err(TickError::Aborted(err));
        }
        warn!(component, %region_id, track, error = %err, "Region step failed, continuing");
        self.failures.push(err);
        Ok(())
    }
}

/// A full reconciliation pass: tracks in order over all regions, then
/// occupancy, then the closed-session reaper.
pub struct FleetTick {
    ledger: Arc<dyn LedgerRepository>,
    connector: Arc<dyn ProviderConnector>,
    reconciler: InstanceReconciler,
    occupancy: OccupancyUpdater,
    reaper: ClosedSessionReaper,
}

impl FleetTick {
    pub fn new(
        ledger: Arc<dyn LedgerRepository>,
        connector: Arc<dyn ProviderConnector>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            reconciler: InstanceReconciler::new(ledger.clone(), settings),
            occupancy: OccupancyUpdater::new(ledger.clone()),
            reaper: ClosedSessionReaper::new(ledger.clone(), connector.clone()),
            ledger,
            connector,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<TickReport, TickError> {
        let mut regions = self.ledger.list_regions().await.map_err(TickError::Regions)?;
        regions.sort_by_key(|region| region.id);

        let mut report = TickReport {
            regions: regions.len(),
            ..Default::default()
        };

        for track in Track::ALL {
            for region in &regions {
                match self.reconcile_track(region, track).await {
                    Ok(outcome) => report.tracks.push(TrackReport {
                        region_id: region.id,
                        track,
                        outcome,
                    }),
                    Err(e) => report.absorb(e)?,
                }
            }
        }

        for region in &regions {
            match self.occupancy.update(region).await {
                Ok(marked) => report.occupied += marked,
                Err(e) => report.absorb(e)?,
            }
        }

        for region in &regions {
            match self.reaper.reap(region).await {
                Ok(outcome) => {
                    report.reaped.terminated += outcome.terminated;
                    report.reaped.marked += outcome.marked;
                }
                Err(e) => report.absorb(e)?,
            }
        }

        info!(
            regions = report.regions,
            occupied = report.occupied,
            reaped = report.reaped.terminated,
            failures = report.failures.len(),
            "Tick complete"
        );
        Ok(report)
    }

    /// The provider client lives only for this region and track.
    async fn reconcile_track(&self, region: &Region, track: Track) -> ReconcileResult<TrackOutcome> {
        let scope = Scope::new(RECONCILER, region.id, Some(track));
        let provider = self
            .connector
            .connect(region)
            .await
            .map_err(|e| scope.provider(e))?;
        self.reconciler
            .reconcile(region, track, provider.as_ref())
            .await
    }
}
