//! The instance ledger as the reconciler sees it.

use async_trait::async_trait;
use psfleet_id::{InstanceId, ProviderInstanceId, RegionId};
use psfleet_reconcile::{InstanceCounts, InstanceRef, InstanceStatus, Track};

use super::DbError;

/// A region the fleet runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: RegionId,

    /// Provider region name, e.g. `us-east-1`.
    pub name: String,
}

/// A `pending` reservation to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInstance {
    pub id: InstanceId,
    pub region_id: RegionId,
    pub track: Track,
    pub port: u16,
    pub status: InstanceStatus,
}

impl NewInstance {
    pub fn reservation(region_id: RegionId, track: Track, port: u16) -> Self {
        Self {
            id: InstanceId::new(),
            region_id,
            track,
            port,
            status: InstanceStatus::Pending,
        }
    }
}

/// How an update finds its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceKey {
    Ledger(InstanceId),

    /// The live (non-deleted) row bound to this provider instance.
    Provider(ProviderInstanceId),
}

/// Fields to change. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstancePatch {
    pub provider_id: Option<ProviderInstanceId>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub status: Option<InstanceStatus>,

    /// Only update if the row is currently in this status.
    pub expected_status: Option<InstanceStatus>,
}

impl InstancePatch {
    /// Status change guarded by the current status.
    pub fn transition(from: InstanceStatus, to: InstanceStatus) -> Self {
        Self {
            status: Some(to),
            expected_status: Some(from),
            ..Default::default()
        }
    }
}

/// A live instance whose session has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSessionInstance {
    pub instance_id: InstanceId,
    pub provider_id: ProviderInstanceId,
    pub region_id: RegionId,
}

/// Ledger operations used by a reconciliation tick.
///
/// Implementations bound every call by a deadline and skip rows that do not
/// decode, failing with [`DbError::Integrity`] only when every row of a
/// non-empty result is unusable.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// All regions, ordered by id.
    async fn list_regions(&self) -> Result<Vec<Region>, DbError>;

    /// Warm-row counts for one region and track, from a single query.
    async fn count_instances(
        &self,
        region_id: RegionId,
        track: Track,
    ) -> Result<InstanceCounts, DbError>;

    /// Rows in any of `statuses`, oldest first.
    async fn list_instance_identifiers(
        &self,
        region_id: RegionId,
        track: Track,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<InstanceRef>, DbError>;

    async fn insert_instance(&self, instance: &NewInstance) -> Result<(), DbError>;

    /// Apply `patch` to the row named by `key`. Returns the rows affected.
    async fn update_instance(&self, key: &InstanceKey, patch: &InstancePatch)
        -> Result<u64, DbError>;

    /// Move `free` rows in the region with a `running` session to
    /// `occupied`. Returns the rows affected.
    async fn mark_occupied_from_running_sessions(&self, region_id: RegionId)
        -> Result<u64, DbError>;

    /// Live instances in the region bound to a `closed` session.
    async fn list_instances_with_closed_sessions(
        &self,
        region_id: RegionId,
    ) -> Result<Vec<ClosedSessionInstance>, DbError>;
}
