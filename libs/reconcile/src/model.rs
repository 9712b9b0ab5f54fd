//! Shared fleet vocabulary: tracks, statuses, and the row/observation shapes
//! that planning operates on.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use psfleet_id::{InstanceId, ProviderInstanceId};
use thiserror::Error;

/// A string did not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Provisioning class of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Track {
    /// Pre-emptible capacity. Cheap, cannot be parked.
    Spot,

    /// Durable capacity with a stopped warm-reserve tier.
    OnDemand,
}

impl Track {
    /// Tracks in the order a tick reconciles them.
    pub const ALL: [Track; 2] = [Track::Spot, Track::OnDemand];

    pub fn as_str(&self) -> &'static str {
        match self {
            Track::Spot => "spot",
            Track::OnDemand => "on-demand",
        }
    }

    /// Whether excess free capacity may be parked as `stopped`.
    pub fn supports_stopped_tier(&self) -> bool {
        matches!(self, Track::OnDemand)
    }

    /// Provider lifecycle states counted as supply for this track.
    pub fn states_of_interest(&self) -> &'static [ProviderState] {
        match self {
            Track::Spot => &[ProviderState::Running, ProviderState::Pending],
            Track::OnDemand => &[
                ProviderState::Running,
                ProviderState::Pending,
                ProviderState::Stopping,
                ProviderState::Stopped,
            ],
        }
    }
}

impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Track {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot" => Ok(Track::Spot),
            "on-demand" => Ok(Track::OnDemand),
            other => Err(ParseError::new("track", other)),
        }
    }
}

/// Ledger status of an instance row.
///
/// ```text
/// pending ──promote──▶ free ──session running──▶ occupied
///                       │                          │
///                       ├──reclaim(stop)──▶ stopped │
///                       └──reclaim(terminate)──┐    └──session closed──┐
///                                              ▼                      ▼
///                                           deleted ◀─────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Pending,
    Free,
    Occupied,
    Stopped,
    Deleted,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Free => "free",
            InstanceStatus::Occupied => "occupied",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Deleted => "deleted",
        }
    }

    /// `deleted` rows are kept for audit and never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceStatus::Deleted)
    }

}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(InstanceStatus::Pending),
            "free" => Ok(InstanceStatus::Free),
            "occupied" => Ok(InstanceStatus::Occupied),
            "stopped" => Ok(InstanceStatus::Stopped),
            "deleted" => Ok(InstanceStatus::Deleted),
            other => Err(ParseError::new("instance status", other)),
        }
    }
}

/// Session status as written by the launcher subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Pending,
    Starting,
    Running,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "starting" => Ok(SessionStatus::Starting),
            "running" => Ok(SessionStatus::Running),
            "closed" => Ok(SessionStatus::Closed),
            other => Err(ParseError::new("session status", other)),
        }
    }
}

/// Lifecycle state reported by the compute provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown,
}

impl ProviderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderState::Pending => "pending",
            ProviderState::Running => "running",
            ProviderState::Stopping => "stopping",
            ProviderState::Stopped => "stopped",
            ProviderState::ShuttingDown => "shutting-down",
            ProviderState::Terminated => "terminated",
            ProviderState::Unknown => "unknown",
        }
    }

    /// Maps a provider state name; unrecognised names become `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "pending" => ProviderState::Pending,
            "running" => ProviderState::Running,
            "stopping" => ProviderState::Stopping,
            "stopped" => ProviderState::Stopped,
            "shutting-down" => ProviderState::ShuttingDown,
            "terminated" => ProviderState::Terminated,
            _ => ProviderState::Unknown,
        }
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger row projection used for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
    pub id: InstanceId,
    pub provider_id: Option<ProviderInstanceId>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
}

impl InstanceRef {
    /// Creation order; ties broken by the time-ordered ledger id.
    pub fn age_key(&self) -> (DateTime<Utc>, InstanceId) {
        (self.created_at, self.id)
    }
}

/// One instance as the provider describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedInstance {
    pub provider_id: ProviderInstanceId,
    pub state: ProviderState,
    pub public_address: Option<String>,
    pub launched_at: Option<DateTime<Utc>>,
}

impl ObservedInstance {
    /// Running with a reachable address: a candidate for promotion.
    pub fn is_ready(&self) -> bool {
        self.state == ProviderState::Running
            && self
                .public_address
                .as_deref()
                .is_some_and(|addr| !addr.is_empty())
    }
}
