//! Derived read-only projections over the reduced state
//!
//! Pure functions of `ConversationState`, recomputed on every change and
//! never stored. The timeline needs no projection: the reducer already
//! appends it in causal order.

use crate::state::{ConversationState, ExpertLane, LaneStatus};

/// Overall progress as a fraction in [0, 1].
///
/// Zero while the expected record count is unknown or zero. Clamped at one
/// because the expected count can be an approximation backfilled from the
/// final summary.
pub fn progress_fraction(state: &ConversationState) -> f64 {
    match state.expected_record_count {
        Some(total) if total > 0 => {
            (state.processed_record_count as f64 / total as f64).min(1.0)
        }
        _ => 0.0,
    }
}

/// Expert lanes partitioned by status
#[derive(Debug, Default)]
pub struct LaneBuckets<'a> {
    pub pending: Vec<&'a ExpertLane>,
    pub processing: Vec<&'a ExpertLane>,
    pub completed: Vec<&'a ExpertLane>,
    pub failed: Vec<&'a ExpertLane>,
}

impl LaneBuckets<'_> {
    /// Total number of lanes across all buckets
    pub fn len(&self) -> usize {
        self.pending.len() + self.processing.len() + self.completed.len() + self.failed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Group lanes by status, ordered by the router's selection so rendering
/// is stable; lanes created defensively before any router decision follow
/// in lexicographic order.
pub fn lanes_by_status(state: &ConversationState) -> LaneBuckets<'_> {
    let mut buckets = LaneBuckets::default();
    for lane in ordered_lanes(state) {
        match lane.status {
            LaneStatus::Pending => buckets.pending.push(lane),
            LaneStatus::Processing => buckets.processing.push(lane),
            LaneStatus::Completed => buckets.completed.push(lane),
            LaneStatus::Failed => buckets.failed.push(lane),
        }
    }
    buckets
}

fn ordered_lanes(state: &ConversationState) -> impl Iterator<Item = &ExpertLane> {
    let mut rest: Vec<&ExpertLane> = state
        .lanes
        .values()
        .filter(|lane| !state.router_selection.contains(&lane.lane_id))
        .collect();
    rest.sort_by(|a, b| a.lane_id.cmp(&b.lane_id));

    state
        .router_selection
        .iter()
        .filter_map(|id| state.lanes.get(id))
        .chain(rest)
}
