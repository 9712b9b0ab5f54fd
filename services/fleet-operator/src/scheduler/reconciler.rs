//! Per-region, per-track instance reconciliation.
//!
//! Each call reads one snapshot (ledger counts, provider instances, ledger
//! identifiers), asks the planner for a single [`Action`] and applies it.
//! Reservations are always written before anything is launched.

use std::sync::Arc;

use psfleet_id::ProviderInstanceId;
use psfleet_reconcile::{
    assign_ready, partition_vanished, plan, ready_unbound, unbound_supply, Action, Assignment,
    InstanceRef, InstanceStatus, ReclaimSelection, Track, TrackIdentifiers,
};
use tracing::{debug, info, instrument, warn};

use super::error::{ReconcileResult, Scope};
use super::{terminate_absent_ok, ReconcilerSettings};
use crate::db::{InstanceKey, InstancePatch, LedgerRepository, NewInstance, Region};
use crate::provider::{observed_instances, ComputeProvider, DescribeFilter, LaunchTemplate};

pub(crate) const COMPONENT: &str = "instance-reconciler";

/// Rows read for selection. `deleted` rows never take part.
const LIVE_STATUSES: [InstanceStatus; 4] = [
    InstanceStatus::Pending,
    InstanceStatus::Free,
    InstanceStatus::Occupied,
    InstanceStatus::Stopped,
];

/// What one region/track reconciliation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackOutcome {
    pub action: Action,
    pub reserved: u32,
    pub launched: u32,
    pub promoted: u32,

    /// Ready instances with no pending row left to bind to.
    pub unmatched_ready: u32,
    pub stopped: u32,
    pub terminated: u32,

    /// Free rows whose instance the provider no longer reports.
    pub retired: u32,
}

impl TrackOutcome {
    fn new(action: Action) -> Self {
        Self {
            action,
            reserved: 0,
            launched: 0,
            promoted: 0,
            unmatched_ready: 0,
            stopped: 0,
            terminated: 0,
            retired: 0,
        }
    }

    pub fn changed_anything(&self) -> bool {
        self.reserved
            + self.launched
            + self.promoted
            + self.stopped
            + self.terminated
            + self.retired
            > 0
    }
}

/// Drives one region/track toward its capacity policy.
pub struct InstanceReconciler {
    ledger: Arc<dyn LedgerRepository>,
    settings: ReconcilerSettings,
}

impl InstanceReconciler {
    pub fn new(ledger: Arc<dyn LedgerRepository>, settings: ReconcilerSettings) -> Self {
        Self { ledger, settings }
    }

    /// Reconcile `track` in `region` using a provider client built for
    /// that region.
    #[instrument(skip(self, region, track, provider), fields(region_id = %region.id, region = %region.name, track = %track))]
    pub async fn reconcile(
        &self,
        region: &Region,
        track: Track,
        provider: &dyn ComputeProvider,
    ) -> ReconcileResult<TrackOutcome> {
        let scope = Scope::new(COMPONENT, region.id, Some(track));
        let template = self.settings.templates.for_track(track);

        let counts = self
            .ledger
            .count_instances(region.id, track)
            .await
            .map_err(|e| scope.ledger(e))?;

        let observed = provider
            .describe(&DescribeFilter::for_template(template))
            .await
            .map(observed_instances)
            .map_err(|e| scope.provider(e))?;

        let refs = self
            .ledger
            .list_instance_identifiers(region.id, track, &LIVE_STATUSES)
            .await
            .map_err(|e| scope.ledger(e))?;
        let ids = TrackIdentifiers::from_refs(refs);
        if !ids.unaddressable_free.is_empty() {
            warn!(
                instance_ids = ?ids.unaddressable_free,
                "Free rows without a provider id, leaving them alone"
            );
        }

        let supply = unbound_supply(track, &observed, &ids.bound);
        let action = plan(track, &counts, &self.settings.policy, supply);
        debug!(
            total = counts.total,
            free = counts.free,
            pending = counts.pending,
            stopped = counts.stopped,
            observed = observed.len(),
            supply,
            action = %action,
            "Planned track"
        );

        let mut outcome = TrackOutcome::new(action);

        let (matched, vanished) = partition_vanished(&ids.free, &observed);
        outcome.retired = self.retire_vanished(&scope, provider, &vanished).await?;

        match action {
            Action::Reclaim(counts) => {
                let selection = ReclaimSelection::choose(&matched, counts, outcome.retired);
                if selection.is_empty() {
                    debug!(retired = outcome.retired, "Excess already covered by vanished rows");
                } else {
                    outcome.terminated = self
                        .terminate_free(&scope, provider, &selection.terminate)
                        .await?;
                    outcome.stopped = self.stop_free(&scope, provider, &selection.stop).await?;
                }
            }
            Action::Promote => {
                let assignment = assign_ready(ready_unbound(&observed, &ids.bound), ids.pending);
                outcome.unmatched_ready = len_u32(assignment.unmatched.len());
                outcome.promoted = self.promote(&scope, assignment).await?;
            }
            Action::Reserve { count } => {
                outcome.reserved = self.reserve(&scope, region, track, count).await?;
            }
            Action::Launch { count } => {
                outcome.launched = self.launch(&scope, provider, template, count).await?;
            }
            Action::Steady => {}
        }

        if outcome.changed_anything() {
            info!(
                action = %outcome.action,
                reserved = outcome.reserved,
                launched = outcome.launched,
                promoted = outcome.promoted,
                stopped = outcome.stopped,
                terminated = outcome.terminated,
                retired = outcome.retired,
                "Track reconciled"
            );
        }
        Ok(outcome)
    }

    /// Insert `count` pending reservations. A failed insert costs one
    /// reservation; lost connectivity ends the call.
    async fn reserve(
        &self,
        scope: &Scope,
        region: &Region,
        track: Track,
        count: u32,
    ) -> ReconcileResult<u32> {
        let mut reserved = 0;
        for _ in 0..count {
            let instance = NewInstance::reservation(region.id, track, self.settings.instance_port);
            match self.ledger.insert_instance(&instance).await {
                Ok(()) => {
                    reserved += 1;
                    debug!(instance_id = %instance.id, "Reserved instance");
                }
                Err(e) if e.is_connectivity() => return Err(scope.ledger(e)),
                Err(e) => warn!(error = %e, "Failed to insert reservation"),
            }
        }
        info!(requested = count, reserved, "Reserved instances");
        Ok(reserved)
    }

    async fn launch(
        &self,
        scope: &Scope,
        provider: &dyn ComputeProvider,
        template: &LaunchTemplate,
        count: u32,
    ) -> ReconcileResult<u32> {
        let launched = provider
            .launch(template, count)
            .await
            .map_err(|e| scope.provider(e))?;

        let provider_ids: Vec<&str> = launched.iter().map(|i| i.provider_id.as_str()).collect();
        info!(
            requested = count,
            launched = launched.len(),
            provider_ids = ?provider_ids,
            "Launch requested"
        );
        Ok(len_u32(launched.len()))
    }

    /// Bind each assigned ready instance to its pending row.
    async fn promote(&self, scope: &Scope, assignment: Assignment) -> ReconcileResult<u32> {
        if !assignment.unmatched.is_empty() {
            let unmatched: Vec<&str> = assignment
                .unmatched
                .iter()
                .map(|i| i.provider_id.as_str())
                .collect();
            warn!(provider_ids = ?unmatched, "Ready instances without a pending reservation");
        }

        let mut promoted = 0;
        for (row, instance) in assignment.pairs {
            let patch = InstancePatch {
                provider_id: Some(instance.provider_id.clone()),
                host: instance.public_address.clone(),
                status: Some(InstanceStatus::Free),
                expected_status: Some(InstanceStatus::Pending),
                ..Default::default()
            };
            let affected = self
                .ledger
                .update_instance(&InstanceKey::Ledger(row), &patch)
                .await
                .map_err(|e| scope.ledger(e))?;

            if affected == 0 {
                warn!(instance_id = %row, "Reservation changed before promotion, skipping");
                continue;
            }
            promoted += 1;
            info!(
                instance_id = %row,
                provider_id = %instance.provider_id,
                host = ?instance.public_address,
                "Promoted instance"
            );
        }
        Ok(promoted)
    }

    async fn terminate_free(
        &self,
        scope: &Scope,
        provider: &dyn ComputeProvider,
        rows: &[InstanceRef],
    ) -> ReconcileResult<u32> {
        if rows.is_empty() {
            return Ok(0);
        }
        terminate_absent_ok(provider, &provider_ids(rows))
            .await
            .map_err(|e| scope.provider(e))?;
        self.transition(scope, rows, InstanceStatus::Deleted).await
    }

    async fn stop_free(
        &self,
        scope: &Scope,
        provider: &dyn ComputeProvider,
        rows: &[InstanceRef],
    ) -> ReconcileResult<u32> {
        if rows.is_empty() {
            return Ok(0);
        }
        provider
            .stop(&provider_ids(rows))
            .await
            .map_err(|e| scope.provider(e))?;
        self.transition(scope, rows, InstanceStatus::Stopped).await
    }

    /// Free rows the provider no longer reports are terminated (an unknown
    /// instance counts as done) and marked deleted.
    async fn retire_vanished(
        &self,
        scope: &Scope,
        provider: &dyn ComputeProvider,
        rows: &[InstanceRef],
    ) -> ReconcileResult<u32> {
        if rows.is_empty() {
            return Ok(0);
        }
        let ids = provider_ids(rows);
        warn!(provider_ids = ?ids, "Free instances no longer reported by provider, retiring");

        terminate_absent_ok(provider, &ids)
            .await
            .map_err(|e| scope.provider(e))?;
        self.transition(scope, rows, InstanceStatus::Deleted).await
    }

    /// Move free `rows` to `to`. Rows that left `free` meanwhile are skipped.
    async fn transition(
        &self,
        scope: &Scope,
        rows: &[InstanceRef],
        to: InstanceStatus,
    ) -> ReconcileResult<u32> {
        let patch = InstancePatch::transition(InstanceStatus::Free, to);
        let mut changed = 0;
        for row in rows {
            let affected = self
                .ledger
                .update_instance(&InstanceKey::Ledger(row.id), &patch)
                .await
                .map_err(|e| scope.ledger(e))?;
            if affected > 0 {
                changed += 1;
            } else {
                debug!(instance_id = %row.id, status = %to, "Row left free before update");
            }
        }
        Ok(changed)
    }
}

fn provider_ids(rows: &[InstanceRef]) -> Vec<ProviderInstanceId> {
    rows.iter().filter_map(|row| row.provider_id.clone()).collect()
}

fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}
