//! In-memory stand-ins for the ledger and the compute provider.
//!
//! `MemoryLedger` mirrors the SQL semantics of `PgLedger`; `FakeCloud`
//! behaves like a small EC2: launched instances start `pending` without an
//! address until [`FakeCloud::boot_all`] runs, and batch calls naming an
//! unknown id fail as a whole with `InvalidInstanceID.NotFound`.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use psfleet_id::{InstanceId, ProviderInstanceId, RegionId, SessionId};
use psfleet_operator::db::{
    ClosedSessionInstance, DbError, InstanceKey, InstancePatch, LedgerRepository, NewInstance,
    Region,
};
use psfleet_operator::provider::{
    ComputeProvider, DescribeFilter, LaunchTemplate, ProviderConnector, ProviderError,
    ProviderResult, Reservation, TrackTemplates, INSTANCE_NOT_FOUND,
};
use psfleet_operator::scheduler::{FleetTick, ReconcilerSettings};
use psfleet_reconcile::{
    CapacityPolicy, InstanceCounts, InstanceRef, InstanceStatus, ObservedInstance,
    ProviderState, SessionStatus, Track,
};

pub const SPOT_IMAGE: &str = "ami-spot";
pub const SPOT_TEMPLATE: &str = "lt-spot";
pub const ON_DEMAND_IMAGE: &str = "ami-ondemand";
pub const ON_DEMAND_TEMPLATE: &str = "lt-ondemand";

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

pub fn templates() -> TrackTemplates {
    let template = |track, image: &str, id: &str| LaunchTemplate {
        track,
        image_id: image.to_string(),
        launch_template_id: id.to_string(),
        instance_type: "g5.xlarge".to_string(),
        key_name: Some("fleet".to_string()),
        name_tag: format!("PixelStreaming-{track}"),
    };
    TrackTemplates {
        spot: template(Track::Spot, SPOT_IMAGE, SPOT_TEMPLATE),
        on_demand: template(Track::OnDemand, ON_DEMAND_IMAGE, ON_DEMAND_TEMPLATE),
    }
}

pub fn settings(policy: CapacityPolicy) -> ReconcilerSettings {
    ReconcilerSettings {
        policy,
        templates: templates(),
        instance_port: 80,
    }
}

pub fn fleet_tick(ledger: &Arc<MemoryLedger>, cloud: &FakeCloud, policy: CapacityPolicy) -> FleetTick {
    FleetTick::new(ledger.clone(), cloud.connector(), settings(policy))
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LedgerRow {
    pub id: InstanceId,
    pub region_id: RegionId,
    pub track: Track,
    pub provider_id: Option<ProviderInstanceId>,
    pub host: Option<String>,
    pub port: u16,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: SessionId,
    pub instance_id: Option<InstanceId>,
    pub status: SessionStatus,
}

#[derive(Default)]
struct LedgerState {
    regions: Vec<Region>,
    instances: Vec<LedgerRow>,
    sessions: Vec<SessionRow>,
    clock: i64,
    disconnected: bool,
    broken_regions: HashSet<RegionId>,
    rejected_inserts: u32,
}

impl LedgerState {
    fn check(&self, region_id: Option<RegionId>) -> Result<(), DbError> {
        if self.disconnected {
            return Err(DbError::Query(sqlx::Error::PoolClosed));
        }
        if region_id.is_some_and(|id| self.broken_regions.contains(&id)) {
            return Err(DbError::Integrity("unreadable row".to_string()));
        }
        Ok(())
    }

    fn next_created_at(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        epoch() + Duration::seconds(self.clock)
    }
}

#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_region(&self, name: &str) -> Region {
        let region = Region {
            id: RegionId::new(),
            name: name.to_string(),
        };
        self.state.lock().unwrap().regions.push(region.clone());
        region
    }

    /// Insert a row directly, bypassing the reconciler.
    pub fn seed(
        &self,
        region: &Region,
        track: Track,
        status: InstanceStatus,
        provider_id: Option<&str>,
    ) -> InstanceId {
        let mut state = self.state.lock().unwrap();
        let created_at = state.next_created_at();
        let id = InstanceId::new();
        state.instances.push(LedgerRow {
            id,
            region_id: region.id,
            track,
            provider_id: provider_id.map(|p| p.parse().unwrap()),
            host: provider_id.map(|_| "192.0.2.1".to_string()),
            port: 80,
            status,
            created_at,
        });
        id
    }

    pub fn add_session(&self, instance_id: InstanceId, status: SessionStatus) -> SessionId {
        let id = SessionId::new();
        self.state.lock().unwrap().sessions.push(SessionRow {
            id,
            instance_id: Some(instance_id),
            status,
        });
        id
    }

    pub fn set_session_status(&self, session_id: SessionId, status: SessionStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.iter_mut().find(|s| s.id == session_id) {
            session.status = status;
        }
    }

    pub fn row(&self, id: InstanceId) -> LedgerRow {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|row| row.id == id)
            .cloned()
            .unwrap()
    }

    pub fn rows(&self, region: &Region, track: Track) -> Vec<LedgerRow> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<LedgerRow> = state
            .instances
            .iter()
            .filter(|row| row.region_id == region.id && row.track == track)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.created_at, row.id));
        rows
    }

    pub fn count(&self, region: &Region, track: Track, status: InstanceStatus) -> usize {
        self.rows(region, track)
            .iter()
            .filter(|row| row.status == status)
            .count()
    }

    pub fn set_disconnected(&self, disconnected: bool) {
        self.state.lock().unwrap().disconnected = disconnected;
    }

    pub fn break_region(&self, region: &Region) {
        self.state.lock().unwrap().broken_regions.insert(region.id);
    }

    pub fn reject_next_inserts(&self, n: u32) {
        self.state.lock().unwrap().rejected_inserts = n;
    }
}

#[async_trait]
impl LedgerRepository for MemoryLedger {
    async fn list_regions(&self) -> Result<Vec<Region>, DbError> {
        let state = self.state.lock().unwrap();
        state.check(None)?;
        let mut regions = state.regions.clone();
        regions.sort_by_key(|region| region.id);
        Ok(regions)
    }

    async fn count_instances(
        &self,
        region_id: RegionId,
        track: Track,
    ) -> Result<InstanceCounts, DbError> {
        let state = self.state.lock().unwrap();
        state.check(Some(region_id))?;
        let mut counts = InstanceCounts::default();
        for row in state
            .instances
            .iter()
            .filter(|row| row.region_id == region_id && row.track == track)
        {
            match row.status {
                InstanceStatus::Free => counts.free += 1,
                InstanceStatus::Pending => counts.pending += 1,
                InstanceStatus::Stopped => counts.stopped += 1,
                _ => continue,
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    async fn list_instance_identifiers(
        &self,
        region_id: RegionId,
        track: Track,
        statuses: &[InstanceStatus],
    ) -> Result<Vec<InstanceRef>, DbError> {
        let state = self.state.lock().unwrap();
        state.check(Some(region_id))?;
        let mut refs: Vec<InstanceRef> = state
            .instances
            .iter()
            .filter(|row| {
                row.region_id == region_id && row.track == track && statuses.contains(&row.status)
            })
            .map(|row| InstanceRef {
                id: row.id,
                provider_id: row.provider_id.clone(),
                status: row.status,
                created_at: row.created_at,
            })
            .collect();
        refs.sort_by_key(InstanceRef::age_key);
        Ok(refs)
    }

    async fn insert_instance(&self, instance: &NewInstance) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        state.check(Some(instance.region_id))?;
        if state.rejected_inserts > 0 {
            state.rejected_inserts -= 1;
            return Err(DbError::Query(sqlx::Error::Protocol(
                "insert rejected".to_string(),
            )));
        }
        let created_at = state.next_created_at();
        state.instances.push(LedgerRow {
            id: instance.id,
            region_id: instance.region_id,
            track: instance.track,
            provider_id: None,
            host: None,
            port: instance.port,
            status: instance.status,
            created_at,
        });
        Ok(())
    }

    async fn update_instance(
        &self,
        key: &InstanceKey,
        patch: &InstancePatch,
    ) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        state.check(None)?;

        let matches = |row: &LedgerRow| {
            let keyed = match key {
                InstanceKey::Ledger(id) => row.id == *id,
                InstanceKey::Provider(pid) => {
                    row.provider_id.as_ref() == Some(pid) && row.status != InstanceStatus::Deleted
                }
            };
            keyed && patch.expected_status.map_or(true, |s| row.status == s)
        };

        if let Some(pid) = &patch.provider_id {
            let taken = state.instances.iter().any(|row| {
                !matches(row)
                    && row.status != InstanceStatus::Deleted
                    && row.provider_id.as_ref() == Some(pid)
            });
            if taken {
                return Err(DbError::Query(sqlx::Error::Protocol(format!(
                    "duplicate live provider id {pid}"
                ))));
            }
        }

        let mut affected = 0;
        for row in state.instances.iter_mut().filter(|row| matches(&**row)) {
            if let Some(pid) = &patch.provider_id {
                row.provider_id = Some(pid.clone());
            }
            if let Some(host) = &patch.host {
                row.host = Some(host.clone());
            }
            if let Some(port) = patch.port {
                row.port = port;
            }
            if let Some(status) = patch.status {
                row.status = status;
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn mark_occupied_from_running_sessions(
        &self,
        region_id: RegionId,
    ) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        state.check(None)?;
        let running: HashSet<InstanceId> = state
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Running)
            .filter_map(|s| s.instance_id)
            .collect();

        let mut affected = 0;
        for row in state.instances.iter_mut().filter(|row| {
            row.region_id == region_id
                && row.status == InstanceStatus::Free
                && running.contains(&row.id)
        }) {
            row.status = InstanceStatus::Occupied;
            affected += 1;
        }
        Ok(affected)
    }

    async fn list_instances_with_closed_sessions(
        &self,
        region_id: RegionId,
    ) -> Result<Vec<ClosedSessionInstance>, DbError> {
        let state = self.state.lock().unwrap();
        state.check(None)?;
        let closed: HashSet<InstanceId> = state
            .sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Closed)
            .filter_map(|s| s.instance_id)
            .collect();

        Ok(state
            .instances
            .iter()
            .filter(|row| {
                row.region_id == region_id
                    && row.status != InstanceStatus::Deleted
                    && closed.contains(&row.id)
            })
            .filter_map(|row| {
                Some(ClosedSessionInstance {
                    instance_id: row.id,
                    provider_id: row.provider_id.clone()?,
                    region_id: row.region_id,
                })
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CloudInstance {
    pub provider_id: ProviderInstanceId,
    pub region: String,
    pub image_id: String,
    pub launch_template_id: String,
    pub state: ProviderState,
    pub public_address: Option<String>,
    pub launched_at: DateTime<Utc>,
}

#[derive(Default)]
struct CloudState {
    instances: Vec<CloudInstance>,
    next_id: u64,
    launches: Vec<(String, String, u32)>,
    stop_calls: Vec<Vec<ProviderInstanceId>>,
    terminate_calls: Vec<Vec<ProviderInstanceId>>,
    connects: Vec<String>,
    failing_regions: HashSet<String>,
    rejecting_launches: bool,
    rejecting_stops: bool,
    rejecting_terminates: bool,
    silent: bool,
}

impl CloudState {
    fn create(&mut self, region: &str, image_id: &str, template_id: &str, state: ProviderState) -> ProviderInstanceId {
        self.next_id += 1;
        let provider_id: ProviderInstanceId = format!("i-{:017x}", self.next_id).parse().unwrap();
        let public_address = (state == ProviderState::Running)
            .then(|| format!("198.51.100.{}", self.next_id % 250 + 1));
        self.instances.push(CloudInstance {
            provider_id: provider_id.clone(),
            region: region.to_string(),
            image_id: image_id.to_string(),
            launch_template_id: template_id.to_string(),
            state,
            public_address,
            launched_at: epoch() + Duration::seconds(self.next_id as i64),
        });
        provider_id
    }

    /// EC2 fails a whole batch when any id was never issued.
    fn check_known(&self, operation: &'static str, ids: &[ProviderInstanceId]) -> ProviderResult<()> {
        let unknown: Vec<&ProviderInstanceId> = ids
            .iter()
            .filter(|id| !self.instances.iter().any(|i| &i.provider_id == *id))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ProviderError::Rejected {
            operation,
            code: INSTANCE_NOT_FOUND.to_string(),
            message: format!("unknown instance ids {unknown:?}"),
        })
    }

    fn set_state(&mut self, ids: &[ProviderInstanceId], state: ProviderState) {
        for instance in self.instances.iter_mut().filter(|i| ids.contains(&i.provider_id)) {
            instance.state = state;
            if state != ProviderState::Running {
                instance.public_address = None;
            }
        }
    }
}

/// Shared simulated provider; every connector and client sees the same
/// instances.
#[derive(Clone, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<CloudState>>,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            cloud: self.clone(),
        })
    }

    /// Bring every `pending` instance to `running` with an address.
    pub fn boot_all(&self) {
        let mut state = self.state.lock().unwrap();
        for (n, instance) in state
            .instances
            .iter_mut()
            .filter(|i| i.state == ProviderState::Pending)
            .enumerate()
        {
            instance.state = ProviderState::Running;
            instance.public_address = Some(format!("203.0.113.{}", n + 1));
        }
    }

    /// An instance already running from the track's template.
    pub fn add_running(&self, region: &Region, track: Track) -> ProviderInstanceId {
        let template = templates().for_track(track).clone();
        self.state.lock().unwrap().create(
            &region.name,
            &template.image_id,
            &template.launch_template_id,
            ProviderState::Running,
        )
    }

    /// Drop an instance entirely, as if it was purged after termination.
    pub fn forget(&self, provider_id: &ProviderInstanceId) {
        self.state
            .lock()
            .unwrap()
            .instances
            .retain(|i| &i.provider_id != provider_id);
    }

    pub fn instance(&self, provider_id: &ProviderInstanceId) -> Option<CloudInstance> {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .find(|i| &i.provider_id == provider_id)
            .cloned()
    }

    pub fn count_in(&self, region: &Region, state: ProviderState) -> usize {
        self.state
            .lock()
            .unwrap()
            .instances
            .iter()
            .filter(|i| i.region == region.name && i.state == state)
            .count()
    }

    /// Instances requested through launch calls in `region`.
    pub fn launched_in(&self, region: &Region) -> u32 {
        self.state
            .lock()
            .unwrap()
            .launches
            .iter()
            .filter(|(name, _, _)| name == &region.name)
            .map(|(_, _, count)| count)
            .sum()
    }

    pub fn launch_calls(&self) -> usize {
        self.state.lock().unwrap().launches.len()
    }

    pub fn stop_calls(&self) -> Vec<Vec<ProviderInstanceId>> {
        self.state.lock().unwrap().stop_calls.clone()
    }

    pub fn terminate_calls(&self) -> Vec<Vec<ProviderInstanceId>> {
        self.state.lock().unwrap().terminate_calls.clone()
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().unwrap().connects.clone()
    }

    pub fn fail_region(&self, region: &Region) {
        self.state
            .lock()
            .unwrap()
            .failing_regions
            .insert(region.name.clone());
    }

    pub fn reject_launches(&self, reject: bool) {
        self.state.lock().unwrap().rejecting_launches = reject;
    }

    /// Deny stop requests with an authorization error.
    pub fn reject_stops(&self, reject: bool) {
        self.state.lock().unwrap().rejecting_stops = reject;
    }

    /// Deny terminate requests with an authorization error.
    pub fn reject_terminates(&self, reject: bool) {
        self.state.lock().unwrap().rejecting_terminates = reject;
    }

    /// Accept launch requests without ever creating instances.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }
}

pub struct FakeConnector {
    cloud: FakeCloud,
}

#[async_trait]
impl ProviderConnector for FakeConnector {
    async fn connect(&self, region: &Region) -> ProviderResult<Box<dyn ComputeProvider>> {
        self.cloud
            .state
            .lock()
            .unwrap()
            .connects
            .push(region.name.clone());
        Ok(Box::new(FakeProvider {
            cloud: self.cloud.clone(),
            region: region.name.clone(),
        }))
    }
}

pub struct FakeProvider {
    cloud: FakeCloud,
    region: String,
}

impl FakeProvider {
    fn check_region(&self, state: &CloudState, operation: &'static str) -> ProviderResult<()> {
        if state.failing_regions.contains(&self.region) {
            return Err(ProviderError::Transport {
                operation,
                message: "connection reset".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn launch(
        &self,
        template: &LaunchTemplate,
        count: u32,
    ) -> ProviderResult<Vec<ObservedInstance>> {
        let mut state = self.cloud.state.lock().unwrap();
        self.check_region(&state, "run_instances")?;
        if state.rejecting_launches {
            return Err(ProviderError::Rejected {
                operation: "run_instances",
                code: "InsufficientInstanceCapacity".to_string(),
                message: "no capacity".to_string(),
            });
        }
        state
            .launches
            .push((self.region.clone(), template.launch_template_id.clone(), count));
        if state.silent {
            return Ok(Vec::new());
        }

        let mut launched = Vec::new();
        for _ in 0..count {
            let provider_id = state.create(
                &self.region,
                &template.image_id,
                &template.launch_template_id,
                ProviderState::Pending,
            );
            launched.push(ObservedInstance {
                provider_id,
                state: ProviderState::Pending,
                public_address: None,
                launched_at: None,
            });
        }
        Ok(launched)
    }

    async fn describe(&self, filter: &DescribeFilter) -> ProviderResult<Vec<Reservation>> {
        let state = self.cloud.state.lock().unwrap();
        self.check_region(&state, "describe_instances")?;
        let instances: Vec<ObservedInstance> = state
            .instances
            .iter()
            .filter(|i| {
                i.region == self.region
                    && i.image_id == filter.image_id
                    && i.launch_template_id == filter.launch_template_id
                    && filter.states.contains(&i.state)
            })
            .map(|i| ObservedInstance {
                provider_id: i.provider_id.clone(),
                state: i.state,
                public_address: i.public_address.clone(),
                launched_at: Some(i.launched_at),
            })
            .collect();
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Reservation { instances }])
    }

    async fn stop(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.cloud.state.lock().unwrap();
        self.check_region(&state, "stop_instances")?;
        state.stop_calls.push(ids.to_vec());
        if state.rejecting_stops {
            return Err(unauthorized("stop_instances"));
        }
        state.check_known("stop_instances", ids)?;
        state.set_state(ids, ProviderState::Stopped);
        Ok(())
    }

    async fn terminate(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut state = self.cloud.state.lock().unwrap();
        self.check_region(&state, "terminate_instances")?;
        state.terminate_calls.push(ids.to_vec());
        if state.rejecting_terminates {
            return Err(unauthorized("terminate_instances"));
        }
        state.check_known("terminate_instances", ids)?;
        state.set_state(ids, ProviderState::Terminated);
        Ok(())
    }
}

fn unauthorized(operation: &'static str) -> ProviderError {
    ProviderError::Rejected {
        operation,
        code: "UnauthorizedOperation".to_string(),
        message: "not authorized".to_string(),
    }
}
