//! Ordered selection over ledger rows and provider observations.
//!
//! All selections are explicit: rows are stably sorted by age and the
//! first `n` are taken, clamped to what exists. Asking for more than is
//! available returns fewer, never panics.

use std::collections::{HashSet, VecDeque};

use psfleet_id::{InstanceId, ProviderInstanceId};

use crate::model::{InstanceRef, InstanceStatus, ObservedInstance, Track};
use crate::planner::ReclaimCounts;

/// Stable sort by `key`, then keep at most `n` items.
pub fn oldest_first<T, K, F>(mut items: Vec<T>, n: usize, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    items.sort_by_key(|item| key(item));
    items.truncate(n);
    items
}

/// Ledger identifiers for one region/track, partitioned for planning.
#[derive(Debug, Clone, Default)]
pub struct TrackIdentifiers {
    /// `free` rows that carry a provider id, oldest first.
    pub free: Vec<InstanceRef>,

    /// `pending` ledger ids, oldest reservation first.
    pub pending: Vec<InstanceId>,

    /// Provider ids held by any live row.
    pub bound: HashSet<ProviderInstanceId>,

    /// `free` rows with no provider id. These violate the ledger invariant
    /// and are left alone.
    pub unaddressable_free: Vec<InstanceId>,
}

impl TrackIdentifiers {
    pub fn from_refs(refs: Vec<InstanceRef>) -> Self {
        let mut refs = refs;
        refs.sort_by_key(InstanceRef::age_key);

        let mut ids = Self::default();
        for row in refs {
            if row.status.is_terminal() {
                continue;
            }
            if let Some(provider_id) = &row.provider_id {
                ids.bound.insert(provider_id.clone());
            }
            match (row.status, row.provider_id.is_some()) {
                (InstanceStatus::Free, true) => ids.free.push(row),
                (InstanceStatus::Free, false) => ids.unaddressable_free.push(row.id),
                (InstanceStatus::Pending, _) => ids.pending.push(row.id),
                _ => {}
            }
        }
        ids
    }
}

/// Provider instances in the track's states of interest that no live
/// ledger row is bound to.
pub fn unbound_supply(
    track: Track,
    observed: &[ObservedInstance],
    bound: &HashSet<ProviderInstanceId>,
) -> u32 {
    let states = track.states_of_interest();
    let count = observed
        .iter()
        .filter(|o| states.contains(&o.state) && !bound.contains(&o.provider_id))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Ready, unbound provider instances in launch order (unknown launch times
/// last, ties by provider id).
pub fn ready_unbound(
    observed: &[ObservedInstance],
    bound: &HashSet<ProviderInstanceId>,
) -> Vec<ObservedInstance> {
    let mut ready: Vec<ObservedInstance> = observed
        .iter()
        .filter(|o| o.is_ready() && !bound.contains(&o.provider_id))
        .cloned()
        .collect();
    ready.sort_by(|a, b| {
        let a_key = (a.launched_at.is_none(), a.launched_at, &a.provider_id);
        let b_key = (b.launched_at.is_none(), b.launched_at, &b.provider_id);
        a_key.cmp(&b_key)
    });
    ready
}

/// Pairing of ready provider instances with pending reservations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assignment {
    pub pairs: Vec<(InstanceId, ObservedInstance)>,

    /// Ready instances left over once every pending row was assigned.
    pub unmatched: Vec<ObservedInstance>,
}

/// Assign ready instances to pending rows, oldest reservation first. Each
/// pending row leaves the pool as soon as it is assigned.
pub fn assign_ready(ready: Vec<ObservedInstance>, pending: Vec<InstanceId>) -> Assignment {
    let mut pool: VecDeque<InstanceId> = pending.into();
    let mut assignment = Assignment::default();

    for instance in ready {
        match pool.pop_front() {
            Some(row) => assignment.pairs.push((row, instance)),
            None => assignment.unmatched.push(instance),
        }
    }
    assignment
}

/// Split `free` rows into those the provider still reports and those it
/// no longer does. Input order is preserved in both halves.
pub fn partition_vanished(
    free: &[InstanceRef],
    observed: &[ObservedInstance],
) -> (Vec<InstanceRef>, Vec<InstanceRef>) {
    let seen: HashSet<&ProviderInstanceId> = observed.iter().map(|o| &o.provider_id).collect();
    free.iter().cloned().partition(|row| {
        row.provider_id
            .as_ref()
            .is_some_and(|provider_id| seen.contains(provider_id))
    })
}

/// Rows chosen for reclaim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimSelection {
    pub terminate: Vec<InstanceRef>,
    pub stop: Vec<InstanceRef>,
}

impl ReclaimSelection {
    /// Choose rows to terminate and stop from `matched` free rows (oldest
    /// first). `already_retired` rows were found gone and count against the
    /// terminate quota first, then the stop quota. The oldest rows are
    /// terminated, the next ones stopped.
    pub fn choose(matched: &[InstanceRef], counts: ReclaimCounts, already_retired: u32) -> Self {
        let terminate = counts.terminate.saturating_sub(already_retired);
        let stop = counts
            .stop
            .saturating_sub(already_retired.saturating_sub(counts.terminate));

        let ordered = oldest_first(matched.to_vec(), matched.len(), InstanceRef::age_key);
        let mut rows = ordered.into_iter();
        let terminate: Vec<_> = rows.by_ref().take(terminate as usize).collect();
        let stop: Vec<_> = rows.take(stop as usize).collect();
        Self { terminate, stop }
    }

    pub fn is_empty(&self) -> bool {
        self.terminate.is_empty() && self.stop.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProviderState;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn row(status: InstanceStatus, provider: Option<&str>, at: i64) -> InstanceRef {
        InstanceRef {
            id: InstanceId::new(),
            provider_id: provider.map(|p| p.parse().unwrap()),
            status,
            created_at: t(at),
        }
    }

    fn observed(id: &str, state: ProviderState, addr: Option<&str>) -> ObservedInstance {
        ObservedInstance {
            provider_id: id.parse().unwrap(),
            state,
            public_address: addr.map(str::to_string),
            launched_at: None,
        }
    }

    #[test]
    fn test_oldest_first_clamps() {
        let picked = oldest_first(vec![3, 1, 2], 10, |v| *v);
        assert_eq!(picked, vec![1, 2, 3]);
        let none = oldest_first(Vec::<u8>::new(), 2, |v| *v);
        assert!(none.is_empty());
    }

    #[test]
    fn test_identifiers_partition_and_order() {
        let newer_pending = row(InstanceStatus::Pending, None, 20);
        let older_pending = row(InstanceStatus::Pending, None, 10);
        let refs = vec![
            newer_pending.clone(),
            row(InstanceStatus::Free, Some("i-free"), 5),
            older_pending.clone(),
            row(InstanceStatus::Occupied, Some("i-busy"), 1),
            row(InstanceStatus::Deleted, Some("i-gone"), 0),
            row(InstanceStatus::Free, None, 3),
        ];
        let ids = TrackIdentifiers::from_refs(refs);

        assert_eq!(ids.pending, vec![older_pending.id, newer_pending.id]);
        assert_eq!(ids.free.len(), 1);
        assert_eq!(ids.unaddressable_free.len(), 1);
        assert!(ids.bound.contains(&"i-busy".parse().unwrap()));
        assert!(!ids.bound.contains(&"i-gone".parse().unwrap()));
    }

    #[test]
    fn test_fifo_promotion_fairness() {
        // Three reservations at t1 < t2 < t3 and one ready instance.
        let t1 = row(InstanceStatus::Pending, None, 1);
        let t2 = row(InstanceStatus::Pending, None, 2);
        let t3 = row(InstanceStatus::Pending, None, 3);
        let ids = TrackIdentifiers::from_refs(vec![t3.clone(), t1.clone(), t2]);

        let ready = vec![observed("i-a", ProviderState::Running, Some("198.51.100.1"))];
        let assignment = assign_ready(ready, ids.pending);

        assert_eq!(assignment.pairs.len(), 1);
        assert_eq!(assignment.pairs[0].0, t1.id);
        assert!(assignment.unmatched.is_empty());
    }

    #[test]
    fn test_last_pending_row_is_not_reused() {
        let only = InstanceId::new();
        let ready = vec![
            observed("i-a", ProviderState::Running, Some("198.51.100.1")),
            observed("i-b", ProviderState::Running, Some("198.51.100.2")),
        ];
        let assignment = assign_ready(ready, vec![only]);

        assert_eq!(assignment.pairs.len(), 1);
        assert_eq!(assignment.pairs[0].0, only);
        assert_eq!(assignment.unmatched.len(), 1);
        assert_eq!(assignment.unmatched[0].provider_id.as_str(), "i-b");
    }

    #[test]
    fn test_ready_unbound_skips_bound_and_unready() {
        let bound = HashSet::from(["i-bound".parse::<ProviderInstanceId>().unwrap()]);
        let obs = vec![
            observed("i-bound", ProviderState::Running, Some("192.0.2.1")),
            observed("i-boot", ProviderState::Pending, None),
            observed("i-noip", ProviderState::Running, None),
            observed("i-ok", ProviderState::Running, Some("192.0.2.2")),
        ];
        let ready = ready_unbound(&obs, &bound);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].provider_id.as_str(), "i-ok");
    }

    #[test]
    fn test_unbound_supply_respects_track_states() {
        let bound = HashSet::from(["i-parked".parse::<ProviderInstanceId>().unwrap()]);
        let obs = vec![
            observed("i-boot", ProviderState::Pending, None),
            observed("i-stopping", ProviderState::Stopping, None),
            observed("i-parked", ProviderState::Stopped, None),
            observed("i-dying", ProviderState::ShuttingDown, None),
        ];
        assert_eq!(unbound_supply(Track::Spot, &obs, &bound), 1);
        assert_eq!(unbound_supply(Track::OnDemand, &obs, &bound), 2);
    }

    #[test]
    fn test_partition_vanished() {
        let alive = row(InstanceStatus::Free, Some("i-alive"), 1);
        let gone = row(InstanceStatus::Free, Some("i-gone"), 2);
        let obs = vec![observed("i-alive", ProviderState::Running, Some("192.0.2.9"))];

        let (matched, vanished) = partition_vanished(&[alive.clone(), gone.clone()], &obs);
        assert_eq!(matched, vec![alive]);
        assert_eq!(vanished, vec![gone]);
    }

    #[test]
    fn test_reclaim_terminates_oldest_then_stops() {
        let a = row(InstanceStatus::Free, Some("i-a"), 1);
        let b = row(InstanceStatus::Free, Some("i-b"), 2);
        let c = row(InstanceStatus::Free, Some("i-c"), 3);
        let counts = ReclaimCounts {
            stop: 1,
            terminate: 1,
        };

        let selection = ReclaimSelection::choose(&[c, b.clone(), a.clone()], counts, 0);
        assert_eq!(selection.terminate, vec![a]);
        assert_eq!(selection.stop, vec![b]);
    }

    #[test]
    fn test_reclaim_clamps_to_matched_rows() {
        let a = row(InstanceStatus::Free, Some("i-a"), 1);
        let counts = ReclaimCounts {
            stop: 2,
            terminate: 3,
        };
        let selection = ReclaimSelection::choose(&[a.clone()], counts, 0);
        assert_eq!(selection.terminate, vec![a]);
        assert!(selection.stop.is_empty());
    }

    #[test]
    fn test_retired_rows_consume_terminate_quota_first() {
        let a = row(InstanceStatus::Free, Some("i-a"), 1);
        let b = row(InstanceStatus::Free, Some("i-b"), 2);
        let counts = ReclaimCounts {
            stop: 1,
            terminate: 1,
        };

        let selection = ReclaimSelection::choose(&[a.clone(), b], counts, 1);
        assert!(selection.terminate.is_empty());
        assert_eq!(selection.stop, vec![a]);

        let exhausted = ReclaimSelection::choose(&[], counts, 5);
        assert!(exhausted.is_empty());
    }
}
