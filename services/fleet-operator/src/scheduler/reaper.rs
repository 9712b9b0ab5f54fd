//! Terminates instances whose session has closed.
//!
//! Used instances are never handed to a second session.

use std::sync::Arc;

use psfleet_id::ProviderInstanceId;
use psfleet_reconcile::InstanceStatus;
use tracing::{debug, info, instrument};

use super::error::{ReconcileResult, Scope};
use super::terminate_absent_ok;
use crate::db::{InstanceKey, InstancePatch, LedgerRepository, Region};
use crate::provider::ProviderConnector;

const COMPONENT: &str = "closed-session-reaper";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapOutcome {
    pub terminated: u32,

    /// Rows moved to `deleted`.
    pub marked: u32,
}

pub struct ClosedSessionReaper {
    ledger: Arc<dyn LedgerRepository>,
    connector: Arc<dyn ProviderConnector>,
}

impl ClosedSessionReaper {
    pub fn new(ledger: Arc<dyn LedgerRepository>, connector: Arc<dyn ProviderConnector>) -> Self {
        Self { ledger, connector }
    }

    /// No provider client is built for a region without closed sessions.
    #[instrument(skip(self, region), fields(region_id = %region.id, region = %region.name))]
    pub async fn reap(&self, region: &Region) -> ReconcileResult<ReapOutcome> {
        let scope = Scope::new(COMPONENT, region.id, None);

        let closed = self
            .ledger
            .list_instances_with_closed_sessions(region.id)
            .await
            .map_err(|e| scope.ledger(e))?;
        if closed.is_empty() {
            return Ok(ReapOutcome::default());
        }

        let provider = self
            .connector
            .connect(region)
            .await
            .map_err(|e| scope.provider(e))?;

        let ids: Vec<ProviderInstanceId> =
            closed.iter().map(|c| c.provider_id.clone()).collect();
        terminate_absent_ok(provider.as_ref(), &ids)
            .await
            .map_err(|e| scope.provider(e))?;

        let mut outcome = ReapOutcome {
            terminated: u32::try_from(ids.len()).unwrap_or(u32::MAX),
            marked: 0,
        };
        let patch = InstancePatch {
            status: Some(InstanceStatus::Deleted),
            ..Default::default()
        };
        for instance in &closed {
            let affected = self
                .ledger
                .update_instance(&InstanceKey::Provider(instance.provider_id.clone()), &patch)
                .await
                .map_err(|e| scope.ledger(e))?;
            if affected > 0 {
                outcome.marked += 1;
            } else {
                debug!(provider_id = %instance.provider_id, "Instance already retired");
            }
        }

        info!(
            terminated = outcome.terminated,
            marked = outcome.marked,
            "Reaped instances with closed sessions"
        );
        Ok(outcome)
    }
}
