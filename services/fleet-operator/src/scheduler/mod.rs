//! Fleet reconciliation.
//!
//! One tick walks every region and:
//! - Reconciles each track against its capacity policy ([`InstanceReconciler`])
//! - Marks instances with a running session as occupied ([`OccupancyUpdater`])
//! - Terminates instances whose session has closed ([`ClosedSessionReaper`])
//!
//! [`TickWorker`] repeats the tick on a fixed interval until shutdown.

mod error;
mod occupancy;
mod reaper;
mod reconciler;
mod tick;
mod worker;

pub use error::{ReconcileError, ReconcileResult, Scope};
pub use occupancy::OccupancyUpdater;
pub use reaper::{ClosedSessionReaper, ReapOutcome};
pub use reconciler::{InstanceReconciler, TrackOutcome};
pub use tick::{FleetTick, TickError, TickReport, TrackReport};
pub use worker::TickWorker;

use psfleet_id::ProviderInstanceId;
use psfleet_reconcile::CapacityPolicy;
use tracing::debug;

use crate::provider::{ComputeProvider, ProviderResult, TrackTemplates};

/// Everything the instance reconciler needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub policy: CapacityPolicy,
    pub templates: TrackTemplates,

    /// Port recorded on new reservations.
    pub instance_port: u16,
}

/// Terminate `ids`, counting instances the provider no longer knows as
/// already terminated.
pub(crate) async fn terminate_absent_ok(
    provider: &dyn ComputeProvider,
    ids: &[ProviderInstanceId],
) -> ProviderResult<()> {
    match provider.terminate(ids).await {
        Err(e) if e.is_not_found() => {
            debug!(error = %e, "Instances already gone");
            Ok(())
        }
        other => other,
    }
}
