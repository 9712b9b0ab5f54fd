//! Capacity planning primitives for the streaming fleet.
//!
//! This library holds the pure half of the operator: the vocabulary shared
//! by the ledger and the provider adapter, the capacity planner, and the
//! ordered selection rules used when only some instances must be acted on.
//! Nothing here performs I/O.
//!
//! - **Intent** lives in the ledger: which instance rows exist and in which
//!   status.
//! - **Reality** lives in the provider: which compute instances exist and
//!   in which lifecycle state.
//! - **Planning** compares the two through [`InstanceCounts`] and the
//!   unbound provider supply and picks one [`Action`] per region and track.
//!
//! # Invariants
//!
//! - Planning is deterministic given the same inputs and never fails
//! - Selections are oldest first and clamp to what is available
//! - A provider instance is bound to at most one live ledger row

mod model;
mod planner;
mod select;

pub use model::{
    InstanceRef, InstanceStatus, ObservedInstance, ParseError, ProviderState, SessionStatus, Track,
};
pub use planner::{plan, Action, CapacityPolicy, InstanceCounts, ReclaimCounts, TrackPolicy};
pub use select::{
    assign_ready, oldest_first, partition_vanished, ready_unbound, unbound_supply, Assignment,
    ReclaimSelection, TrackIdentifiers,
};

/// Default interval between reconciliation ticks.
pub const DEFAULT_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
