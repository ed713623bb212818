//! Conversation state: the single aggregate reduced from the event stream
//!
//! One `ConversationState` instance exists per run. It is owned by the
//! session controller, mutated only through the reducer, and replaced
//! wholesale when a new run starts. All types are `Clone` so consumers can
//! take snapshots.

use std::collections::HashMap;

/// Overall status of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Streaming,
    Completed,
    Failed,
}

/// Status of one expert lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LaneStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl LaneStatus {
    /// Check if this lane has reached a terminal status
    pub fn is_settled(self) -> bool {
        matches!(self, LaneStatus::Completed | LaneStatus::Failed)
    }
}

/// One independently tracked expert lane and its accumulated output
#[derive(Debug, Clone)]
pub struct ExpertLane {
    pub lane_id: String,
    /// Record kind this lane covers, derived from the lane naming
    /// convention ("host_fan" covers "host" records)
    pub expert_kind: String,
    pub status: LaneStatus,
    /// Streamed output fragments, append-only
    pub partial_chunks: Vec<String>,
    /// Final summary, set by an expert_done event
    pub final_text: Option<String>,
    /// Confidence in [0, 1], set by an expert_done event
    pub confidence: Option<f64>,
    pub error_message: Option<String>,
}

impl ExpertLane {
    pub(crate) fn new(lane_id: &str, status: LaneStatus) -> Self {
        Self {
            lane_id: lane_id.to_string(),
            expert_kind: expert_kind_of(lane_id),
            status,
            partial_chunks: Vec::new(),
            final_text: None,
            confidence: None,
            error_message: None,
        }
    }

    /// Concatenation of the streamed fragments received so far
    pub fn partial_text(&self) -> String {
        self.partial_chunks.concat()
    }
}

/// Derive the record kind an expert lane covers from its id
fn expert_kind_of(lane_id: &str) -> String {
    lane_id.strip_suffix("_fan").unwrap_or(lane_id).to_string()
}

/// Result of one record's analysis
#[derive(Debug, Clone, PartialEq)]
pub struct RecordResult {
    pub kind: String,
    pub summary: String,
}

/// One human-readable entry in the conversation timeline.
///
/// Appended in causal (apply) order, never arrival order.
#[derive(Debug, Clone)]
pub struct TimelineEntry {
    pub sequence: u64,
    /// Lane this entry is attributed to, when any
    pub lane_id: Option<String>,
    pub text: String,
}

/// One recorded failure, code and message preserved verbatim for display
#[derive(Debug, Clone)]
pub struct ErrorEntry {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub lane_id: Option<String>,
}

/// The reduced view of one conversation's event stream
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    pub conversation_id: String,
    pub run_status: RunStatus,
    /// Highest sequence number reduced so far; monotonic non-decreasing
    pub highest_applied_sequence: u64,
    /// Expert lanes chosen by the router, in decision order
    pub router_selection: Vec<String>,
    /// Total records the producer intends to analyze, once known
    pub expected_record_count: Option<u64>,
    pub processed_record_count: u64,
    /// Per-record results keyed by record id
    pub record_results: HashMap<String, RecordResult>,
    /// Expert lanes keyed by lane id
    pub lanes: HashMap<String, ExpertLane>,
    /// Fan-in summary, set exactly once
    pub final_summary: Option<String>,
    pub timeline: Vec<TimelineEntry>,
    pub errors: Vec<ErrorEntry>,
}

impl ConversationState {
    /// Create an empty state for a conversation
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            ..Self::default()
        }
    }

    /// Look up a lane by id
    pub fn lane(&self, lane_id: &str) -> Option<&ExpertLane> {
        self.lanes.get(lane_id)
    }

    /// Get a lane, creating it with `initial` status if it does not exist
    /// yet. Content events may legitimately arrive before the router
    /// decision that names the lane.
    pub(crate) fn lane_mut(&mut self, lane_id: &str, initial: LaneStatus) -> &mut ExpertLane {
        self.lanes
            .entry(lane_id.to_string())
            .or_insert_with(|| ExpertLane::new(lane_id, initial))
    }

    /// Check if the run has reached a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self.run_status, RunStatus::Completed | RunStatus::Failed)
    }
}
