//! Pure reduction of envelopes into conversation state
//!
//! The reducer is total over well-formed envelopes: every event kind has a
//! defined effect even when the entities it references do not exist yet,
//! and it never fails. Ordering is the sequencing guard's job; the reducer
//! assumes envelopes arrive in ascending sequence order.

use crate::envelope::{
    Envelope, ErrorPayload, EventPayload, ExpertChunk, ExpertDone, FinalSummary, RecordDone,
    RouterDecision,
};
use crate::state::{ConversationState, ErrorEntry, LaneStatus, RecordResult, RunStatus, TimelineEntry};

/// Apply one envelope to the conversation state.
///
/// Must not be invoked reentrantly; the state has a single writer.
pub fn reduce(state: &mut ConversationState, envelope: &Envelope) {
    if envelope.sequence > state.highest_applied_sequence {
        state.highest_applied_sequence = envelope.sequence;
    }

    let seq = envelope.sequence;
    match &envelope.event {
        EventPayload::RouterDecision(d) => handle_router_decision(state, seq, d),
        EventPayload::RecordDone(r) => handle_record_done(state, seq, r),
        EventPayload::ExpertChunk(c) => handle_expert_chunk(state, c),
        EventPayload::ExpertDone(d) => handle_expert_done(state, seq, d),
        EventPayload::FinalSummary(f) => handle_final_summary(state, seq, f),
        EventPayload::Error(e) => handle_error(state, seq, e),
        EventPayload::Unknown { kind, .. } => handle_unknown(state, seq, kind),
    }
}

fn handle_router_decision(state: &mut ConversationState, seq: u64, decision: &RouterDecision) {
    state.router_selection = decision.selected_experts.clone();

    for lane_id in &decision.selected_experts {
        // Re-delivery must not reset a lane that already made progress
        state.lane_mut(lane_id, LaneStatus::Pending);
    }

    if state.expected_record_count.is_none() {
        state.expected_record_count = decision.total_records;
    }

    let text = if decision.reasoning.is_empty() {
        format!("router selected lanes: {}", decision.selected_experts.join(", "))
    } else {
        format!(
            "router selected lanes: {} ({})",
            decision.selected_experts.join(", "),
            decision.reasoning
        )
    };
    push_timeline(state, seq, None, text);
}

fn handle_record_done(state: &mut ConversationState, seq: u64, record: &RecordDone) {
    if state.record_results.contains_key(&record.id) {
        tracing::debug!(record_id = %record.id, "duplicate record_done ignored");
        return;
    }
    state.record_results.insert(
        record.id.clone(),
        RecordResult {
            kind: record.kind.clone(),
            summary: record.summary.clone(),
        },
    );
    state.processed_record_count += 1;
    push_timeline(
        state,
        seq,
        None,
        format!("{} {} analyzed", record.kind, record.id),
    );
}

fn handle_expert_chunk(state: &mut ConversationState, chunk: &ExpertChunk) {
    let lane = state.lane_mut(&chunk.expert_id, LaneStatus::Processing);
    lane.status = LaneStatus::Processing;
    lane.partial_chunks.push(chunk.chunk.clone());
    // is_complete is advisory; only expert_done transitions the lane
}

fn handle_expert_done(state: &mut ConversationState, seq: u64, done: &ExpertDone) {
    let lane = state.lane_mut(&done.expert_id, LaneStatus::Processing);
    // Re-delivery overwrites with the latest values
    lane.status = LaneStatus::Completed;
    lane.final_text = Some(done.summary.clone());
    lane.confidence = done.confidence;

    let text = match done.processing_time_ms {
        Some(ms) => format!("expert {} finished in {}ms", done.expert_id, ms),
        None => format!("expert {} finished", done.expert_id),
    };
    push_timeline(state, seq, Some(done.expert_id.clone()), text);
}

fn handle_final_summary(state: &mut ConversationState, seq: u64, summary: &FinalSummary) {
    if state.final_summary.is_some() {
        tracing::debug!("duplicate final_summary ignored");
        return;
    }
    state.final_summary = Some(summary.summary.clone());
    state.run_status = RunStatus::Completed;

    // Observed producer fallback: when the router never announced a record
    // count, the final summary's expert_count approximates it
    if state.expected_record_count.is_none() {
        state.expected_record_count = summary.expert_count;
    }

    let text = match summary.total_processing_time_ms {
        Some(ms) => format!("analysis complete in {ms}ms"),
        None => "analysis complete".to_string(),
    };
    push_timeline(state, seq, None, text);
}

fn handle_error(state: &mut ConversationState, seq: u64, error: &ErrorPayload) {
    state.errors.push(ErrorEntry {
        code: error.error_code.clone(),
        message: error.message.clone(),
        details: error.details.clone(),
        lane_id: error.expert_id.clone(),
    });

    match &error.expert_id {
        Some(lane_id) => {
            // Localized failure: the lane fails, the run continues
            let lane = state.lane_mut(lane_id, LaneStatus::Failed);
            lane.status = LaneStatus::Failed;
            lane.error_message = Some(error.message.clone());
            push_timeline(
                state,
                seq,
                Some(lane_id.clone()),
                format!("expert {} failed: {}", lane_id, error.message),
            );
        }
        None => {
            state.run_status = RunStatus::Failed;
            push_timeline(
                state,
                seq,
                None,
                format!("run failed: {} ({})", error.message, error.error_code),
            );
        }
    }
}

fn handle_unknown(state: &mut ConversationState, seq: u64, kind: &str) {
    tracing::warn!(kind, "unknown event kind");
    push_timeline(state, seq, None, format!("unrecognized event '{kind}'"));
}

fn push_timeline(state: &mut ConversationState, sequence: u64, lane_id: Option<String>, text: String) {
    state.timeline.push(TimelineEntry {
        sequence,
        lane_id,
        text,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    fn envelope(seq: u64, event: EventPayload) -> Envelope {
        Envelope {
            conversation_id: "t-1".to_string(),
            sequence: seq,
            timestamp: None,
            event,
        }
    }

    fn router_decision(seq: u64, lanes: &[&str], total: Option<u64>) -> Envelope {
        envelope(
            seq,
            EventPayload::RouterDecision(RouterDecision {
                selected_experts: lanes.iter().map(|s| s.to_string()).collect(),
                reasoning: String::new(),
                total_records: total,
            }),
        )
    }

    fn record_done(seq: u64, kind: &str, id: &str, summary: &str) -> Envelope {
        envelope(
            seq,
            EventPayload::RecordDone(RecordDone {
                kind: kind.to_string(),
                id: id.to_string(),
                summary: summary.to_string(),
            }),
        )
    }

    fn expert_done(seq: u64, lane: &str, summary: &str, confidence: Option<f64>) -> Envelope {
        envelope(
            seq,
            EventPayload::ExpertDone(ExpertDone {
                expert_id: lane.to_string(),
                summary: summary.to_string(),
                confidence,
                processing_time_ms: None,
            }),
        )
    }

    fn final_summary(seq: u64, summary: &str, expert_count: Option<u64>) -> Envelope {
        envelope(
            seq,
            EventPayload::FinalSummary(FinalSummary {
                summary: summary.to_string(),
                expert_count,
                total_processing_time_ms: None,
            }),
        )
    }

    fn error(seq: u64, message: &str, lane: Option<&str>) -> Envelope {
        envelope(
            seq,
            EventPayload::Error(ErrorPayload {
                error_code: "TestError".to_string(),
                message: message.to_string(),
                details: None,
                expert_id: lane.map(|s| s.to_string()),
            }),
        )
    }

    #[test]
    fn test_router_decision_creates_pending_lanes() {
        // Scenario A
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &router_decision(1, &["host_fan", "cert_fan"], Some(6)));

        assert_eq!(state.lanes.len(), 2);
        assert_eq!(state.lane("host_fan").unwrap().status, LaneStatus::Pending);
        assert_eq!(state.lane("cert_fan").unwrap().status, LaneStatus::Pending);
        assert_eq!(state.expected_record_count, Some(6));
        assert_eq!(state.router_selection, vec!["host_fan", "cert_fan"]);
        assert_eq!(state.timeline.len(), 1);
    }

    #[test]
    fn test_router_redelivery_preserves_lane_progress() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &router_decision(1, &["host_fan"], Some(6)));
        reduce(
            &mut state,
            &envelope(
                2,
                EventPayload::ExpertChunk(ExpertChunk {
                    expert_id: "host_fan".to_string(),
                    chunk: "part".to_string(),
                    is_complete: false,
                }),
            ),
        );
        reduce(&mut state, &router_decision(3, &["host_fan", "cert_fan"], Some(9)));

        let lane = state.lane("host_fan").unwrap();
        assert_eq!(lane.status, LaneStatus::Processing);
        assert_eq!(lane.partial_chunks, vec!["part"]);
        // First-write-wins for the expected count
        assert_eq!(state.expected_record_count, Some(6));
        // But the new lane is created
        assert_eq!(state.lane("cert_fan").unwrap().status, LaneStatus::Pending);
    }

    #[test]
    fn test_record_done_is_idempotent() {
        // Scenario B
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &router_decision(1, &["host_fan", "cert_fan"], Some(6)));
        reduce(&mut state, &record_done(2, "host", "8.8.8.8", "clean"));
        let timeline_len = state.timeline.len();
        reduce(&mut state, &record_done(3, "host", "8.8.8.8", "clean"));

        assert_eq!(state.processed_record_count, 1);
        assert_eq!(state.record_results.len(), 1);
        assert_eq!(state.timeline.len(), timeline_len);
    }

    #[test]
    fn test_chunk_before_router_creates_processing_lane() {
        // Scenario C
        let mut state = ConversationState::new("t-1");
        reduce(
            &mut state,
            &envelope(
                1,
                EventPayload::ExpertChunk(ExpertChunk {
                    expert_id: "host_fan".to_string(),
                    chunk: "partial...".to_string(),
                    is_complete: false,
                }),
            ),
        );

        let lane = state.lane("host_fan").unwrap();
        assert_eq!(lane.status, LaneStatus::Processing);
        assert_eq!(lane.partial_chunks, vec!["partial..."]);
        assert_eq!(lane.expert_kind, "host");
    }

    #[test]
    fn test_chunk_is_complete_does_not_complete_lane() {
        let mut state = ConversationState::new("t-1");
        reduce(
            &mut state,
            &envelope(
                1,
                EventPayload::ExpertChunk(ExpertChunk {
                    expert_id: "host_fan".to_string(),
                    chunk: "tail".to_string(),
                    is_complete: true,
                }),
            ),
        );
        assert_eq!(state.lane("host_fan").unwrap().status, LaneStatus::Processing);
    }

    #[test]
    fn test_expert_done_completes_lane() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &expert_done(1, "cert_fan", "done", Some(0.9)));

        let lane = state.lane("cert_fan").unwrap();
        assert_eq!(lane.status, LaneStatus::Completed);
        assert_eq!(lane.final_text.as_deref(), Some("done"));
        assert_eq!(lane.confidence, Some(0.9));
        assert_eq!(state.timeline.len(), 1);
        assert_eq!(state.timeline[0].lane_id.as_deref(), Some("cert_fan"));
    }

    #[test]
    fn test_expert_done_redelivery_last_write_wins() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &expert_done(1, "cert_fan", "first", Some(0.5)));
        reduce(&mut state, &expert_done(2, "cert_fan", "second", Some(0.8)));

        let lane = state.lane("cert_fan").unwrap();
        assert_eq!(lane.final_text.as_deref(), Some("second"));
        assert_eq!(lane.confidence, Some(0.8));
        assert_eq!(lane.status, LaneStatus::Completed);
    }

    #[test]
    fn test_final_summary_first_write_wins() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &final_summary(1, "first", Some(6)));
        reduce(&mut state, &final_summary(2, "second", Some(9)));

        assert_eq!(state.final_summary.as_deref(), Some("first"));
        assert_eq!(state.run_status, RunStatus::Completed);
        assert_eq!(state.expected_record_count, Some(6));
    }

    #[test]
    fn test_final_summary_backfills_expected_count() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &final_summary(1, "done", Some(4)));
        assert_eq!(state.expected_record_count, Some(4));
    }

    #[test]
    fn test_final_summary_does_not_overwrite_router_count() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &router_decision(1, &["host_fan"], Some(6)));
        reduce(&mut state, &final_summary(2, "done", Some(99)));
        assert_eq!(state.expected_record_count, Some(6));
    }

    #[test]
    fn test_lane_error_is_localized() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &router_decision(1, &["host_fan", "cert_fan"], None));
        reduce(&mut state, &error(2, "model timeout", Some("host_fan")));

        assert_eq!(state.lane("host_fan").unwrap().status, LaneStatus::Failed);
        assert_eq!(
            state.lane("host_fan").unwrap().error_message.as_deref(),
            Some("model timeout")
        );
        // One failed lane is a partial failure, not a run failure
        assert_ne!(state.run_status, RunStatus::Failed);
        assert_eq!(state.errors.len(), 1);
        // The run can still complete
        reduce(&mut state, &final_summary(3, "partial results", None));
        assert_eq!(state.run_status, RunStatus::Completed);
    }

    #[test]
    fn test_lane_error_creates_missing_lane() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &error(1, "boom", Some("dns_fan")));
        assert_eq!(state.lane("dns_fan").unwrap().status, LaneStatus::Failed);
    }

    #[test]
    fn test_run_level_error_fails_run() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &expert_done(1, "cert_fan", "done", Some(0.9)));
        reduce(&mut state, &error(2, "graph execution failed", None));

        assert_eq!(state.run_status, RunStatus::Failed);
        assert_eq!(state.errors.len(), 1);
        // A completed lane is unaffected by the run-level failure
        assert_eq!(state.lane("cert_fan").unwrap().status, LaneStatus::Completed);
    }

    #[test]
    fn test_error_code_and_message_preserved_verbatim() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &error(1, "graph execution failed", None));
        assert_eq!(state.errors[0].code, "TestError");
        assert_eq!(state.errors[0].message, "graph execution failed");
    }

    #[test]
    fn test_unknown_kind_lands_in_timeline_only() {
        let mut state = ConversationState::new("t-1");
        reduce(
            &mut state,
            &envelope(
                1,
                EventPayload::Unknown {
                    kind: "telemetry_v2".to_string(),
                    raw: serde_json::json!({"x": 1}),
                },
            ),
        );

        assert_eq!(state.timeline.len(), 1);
        assert!(state.timeline[0].text.contains("telemetry_v2"));
        assert!(state.errors.is_empty());
        assert_eq!(state.run_status, RunStatus::Idle);
    }

    #[test]
    fn test_highest_applied_sequence_monotonic() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &record_done(5, "host", "a", "x"));
        assert_eq!(state.highest_applied_sequence, 5);
        // A lower sequence never regresses the watermark
        reduce(&mut state, &record_done(2, "host", "b", "y"));
        assert_eq!(state.highest_applied_sequence, 5);
    }

    #[test]
    fn test_counters_non_decreasing() {
        let mut state = ConversationState::new("t-1");
        let mut last_processed = 0;
        let events = [
            record_done(1, "host", "a", "x"),
            record_done(2, "host", "a", "x"),
            error(3, "boom", Some("host_fan")),
            record_done(4, "cert", "b", "y"),
            final_summary(5, "done", None),
        ];
        for env in &events {
            reduce(&mut state, env);
            assert!(state.processed_record_count >= last_processed);
            last_processed = state.processed_record_count;
        }
        assert_eq!(state.processed_record_count, 2);
    }

    #[test]
    fn test_timeline_records_sequence_of_entries() {
        let mut state = ConversationState::new("t-1");
        reduce(&mut state, &record_done(1, "host", "a", "x"));
        reduce(&mut state, &record_done(2, "host", "b", "y"));
        reduce(&mut state, &record_done(3, "cert", "c", "z"));

        let sequences: Vec<u64> = state.timeline.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
    }
}
