//! Compute provider boundary.
//!
//! The reconciler only sees [`ComputeProvider`]: launch, describe, stop
//! and terminate against one region. A [`ProviderConnector`] builds a
//! client per region at the top of each region's work, so nothing about a
//! region leaks into the next one.

mod ec2;
mod error;

pub use ec2::{Ec2Connector, StaticCredentials};
pub use error::{ProviderError, ProviderResult, DRY_RUN_PERMITTED, INSTANCE_NOT_FOUND};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use psfleet_id::ProviderInstanceId;
use psfleet_reconcile::{ObservedInstance, ProviderState, Track};
use tracing::debug;

use crate::db::Region;

/// Launch parameters for one track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchTemplate {
    pub track: Track,
    pub image_id: String,
    pub launch_template_id: String,
    pub instance_type: String,
    pub key_name: Option<String>,

    /// Value of the `Name` tag on launched instances.
    pub name_tag: String,
}

/// Launch templates for both tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackTemplates {
    pub spot: LaunchTemplate,
    pub on_demand: LaunchTemplate,
}

impl TrackTemplates {
    pub fn for_track(&self, track: Track) -> &LaunchTemplate {
        match track {
            Track::Spot => &self.spot,
            Track::OnDemand => &self.on_demand,
        }
    }
}

/// Which instances a describe call should return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescribeFilter {
    pub image_id: String,
    pub launch_template_id: String,
    pub states: Vec<ProviderState>,
}

impl DescribeFilter {
    /// Instances launched from `template` in its track's states of interest.
    pub fn for_template(template: &LaunchTemplate) -> Self {
        Self {
            image_id: template.image_id.clone(),
            launch_template_id: template.launch_template_id.clone(),
            states: template.track.states_of_interest().to_vec(),
        }
    }
}

/// A group of instances as the provider reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    pub instances: Vec<ObservedInstance>,
}

/// Flatten reservations into one list of instances.
pub fn observed_instances(reservations: Vec<Reservation>) -> Vec<ObservedInstance> {
    reservations
        .into_iter()
        .flat_map(|reservation| reservation.instances)
        .collect()
}

/// Provider operations for a single region.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Launch up to `count` instances from `template`.
    async fn launch(
        &self,
        template: &LaunchTemplate,
        count: u32,
    ) -> ProviderResult<Vec<ObservedInstance>>;

    async fn describe(&self, filter: &DescribeFilter) -> ProviderResult<Vec<Reservation>>;

    /// Stop the given instances. An empty list is a no-op.
    async fn stop(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()>;

    /// Terminate the given instances. An empty list is a no-op.
    async fn terminate(&self, ids: &[ProviderInstanceId]) -> ProviderResult<()>;
}

/// Builds a provider client for a region.
#[async_trait]
pub trait ProviderConnector: Send + Sync {
    async fn connect(&self, region: &Region) -> ProviderResult<Box<dyn ComputeProvider>>;
}

/// Settings shared by every provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Ask the provider to validate a mutating call before issuing it.
    pub dry_run_probe: bool,

    /// Deadline for each provider call.
    pub call_timeout: Duration,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            dry_run_probe: true,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Run `call` as a dry-run probe first when `probe` is set. A
/// "dry run permitted" answer is followed by the real call; any other
/// outcome is returned as is.
pub async fn with_dry_run_probe<T, F, Fut>(
    operation: &'static str,
    probe: bool,
    mut call: F,
) -> ProviderResult<T>
where
    F: FnMut(bool) -> Fut,
    Fut: Future<Output = ProviderResult<T>>,
{
    if !probe {
        return call(false).await;
    }

    match call(true).await {
        Err(e) if e.is_dry_run_permitted() => {
            debug!(operation, "Dry run permitted, issuing call");
            call(false).await
        }
        other => other,
    }
}

/// Bound `call` by `limit`.
pub async fn with_deadline<T>(
    operation: &'static str,
    limit: Duration,
    call: impl Future<Output = ProviderResult<T>>,
) -> ProviderResult<T> {
    tokio::time::timeout(limit, call)
        .await
        .unwrap_or(Err(ProviderError::Timeout { operation, limit }))
}
