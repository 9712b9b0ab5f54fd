//! Marks free instances as occupied once their session runs.

use std::sync::Arc;

use tracing::{info, instrument};

use super::error::{ReconcileResult, Scope};
use crate::db::{LedgerRepository, Region};

const COMPONENT: &str = "occupancy-updater";

pub struct OccupancyUpdater {
    ledger: Arc<dyn LedgerRepository>,
}

impl OccupancyUpdater {
    pub fn new(ledger: Arc<dyn LedgerRepository>) -> Self {
        Self { ledger }
    }

    /// Only `free` rows in `region` move; other statuses are left as they are.
    #[instrument(skip(self, region), fields(region_id = %region.id))]
    pub async fn update(&self, region: &Region) -> ReconcileResult<u64> {
        let scope = Scope::new(COMPONENT, region.id, None);
        let marked = self
            .ledger
            .mark_occupied_from_running_sessions(region.id)
            .await
            .map_err(|e| scope.ledger(e))?;

        if marked > 0 {
            info!(marked, "Marked instances occupied");
        }
        Ok(marked)
    }
}
