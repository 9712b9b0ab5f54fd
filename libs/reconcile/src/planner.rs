//! The capacity planner.
//!
//! [`plan`] turns one consistent snapshot of a region/track into a single
//! [`Action`]. Each action is safe to repeat: reservations are recorded in
//! the ledger before anything is launched, so a crash between the two
//! leaves a `pending` row that the next tick launches for instead of a
//! second reservation.

use std::fmt;

use crate::model::Track;

/// Ledger counts for one region and track, taken in a single query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceCounts {
    /// Rows in `free`, `pending` or `stopped`.
    pub total: u32,
    pub free: u32,
    pub pending: u32,
    pub stopped: u32,
}

impl InstanceCounts {
    /// Rows not yet confirmed free or parked.
    pub fn pending_outstanding(&self) -> u32 {
        self.total
            .saturating_sub(self.free)
            .saturating_sub(self.stopped)
    }
}

/// Warm capacity targets for one track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackPolicy {
    /// `free` instances to keep ready for sessions.
    pub free_target: u32,

    /// `stopped` instances to keep parked. Always zero for spot.
    pub stopped_target: u32,
}

impl TrackPolicy {
    /// Warm rows the ledger should hold once converged.
    pub fn required_total(&self) -> u32 {
        self.free_target.saturating_add(self.stopped_target)
    }
}

/// Process-wide capacity policy, read-only during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub spot: TrackPolicy,
    pub on_demand: TrackPolicy,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            spot: TrackPolicy {
                free_target: 1,
                stopped_target: 0,
            },
            on_demand: TrackPolicy {
                free_target: 1,
                stopped_target: 1,
            },
        }
    }
}

impl CapacityPolicy {
    /// Effective policy for a track. Spot has no stopped tier whatever the
    /// configuration says.
    pub fn for_track(&self, track: Track) -> TrackPolicy {
        match track {
            Track::Spot => TrackPolicy {
                free_target: self.spot.free_target,
                stopped_target: 0,
            },
            Track::OnDemand => self.on_demand,
        }
    }
}

/// How excess free capacity is split between parking and terminating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimCounts {
    pub stop: u32,
    pub terminate: u32,
}

impl ReclaimCounts {
    pub fn total(&self) -> u32 {
        self.stop + self.terminate
    }
}

/// The single decision for one region/track in one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Too much free capacity: park or terminate the oldest free rows.
    Reclaim(ReclaimCounts),

    /// Provider supply covers the outstanding reservations: bind ready
    /// instances to pending rows.
    Promote,

    /// The ledger is short of warm rows: insert `pending` reservations.
    Reserve { count: u32 },

    /// Reservations exist that nothing in the provider is serving yet.
    Launch { count: u32 },

    /// Converged.
    Steady,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Reclaim(_) => "reclaim",
            Action::Promote => "promote",
            Action::Reserve { .. } => "reserve",
            Action::Launch { .. } => "launch",
            Action::Steady => "steady",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Reclaim(counts) => write!(
                f,
                "reclaim(stop={}, terminate={})",
                counts.stop, counts.terminate
            ),
            Action::Reserve { count } => write!(f, "reserve({count})"),
            Action::Launch { count } => write!(f, "launch({count})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Decide what to do for one region and track.
///
/// `supply` is the number of provider instances in the track's states of
/// interest that no live ledger row is bound to yet, i.e. instances that can
/// still satisfy a pending reservation.
///
/// Rules, first match wins:
/// 1. more free rows than the target: reclaim the excess, parking up to the
///    stopped shortfall on tracks that support it and terminating the rest
/// 2. pending rows that the provider supply covers: promote
/// 3. fewer warm rows than the target: reserve the shortfall
/// 4. pending rows beyond the provider supply: launch the difference
/// 5. otherwise nothing to do
pub fn plan(track: Track, counts: &InstanceCounts, policy: &CapacityPolicy, supply: u32) -> Action {
    let policy = policy.for_track(track);
    let outstanding = counts.pending_outstanding();

    if counts.free > policy.free_target {
        let excess = counts.free - policy.free_target;
        let stop = if track.supports_stopped_tier() {
            excess.min(policy.stopped_target.saturating_sub(counts.stopped))
        } else {
            0
        };
        return Action::Reclaim(ReclaimCounts {
            stop,
            terminate: excess - stop,
        });
    }

    if outstanding > 0 && supply >= outstanding {
        return Action::Promote;
    }

    if counts.total < policy.required_total() {
        return Action::Reserve {
            count: policy.required_total() - counts.total,
        };
    }

    if outstanding > supply {
        return Action::Launch {
            count: outstanding - supply,
        };
    }

    Action::Steady
}
