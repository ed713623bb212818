//! Wire envelope model and parsing
//!
//! Every frame pushed by the backend carries one `Envelope`: an event kind,
//! the conversation it belongs to, a producer-assigned sequence number, and
//! a kind-specific payload. Parsing is two-phase: the outer frame is
//! deserialized first, then the payload is dispatched on the kind string so
//! that unknown kinds survive with their raw JSON intact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One message on the event stream
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Identifier scoping all events of one run
    pub conversation_id: String,
    /// Producer-assigned sequence number, unique within the conversation
    pub sequence: u64,
    /// Producer-side wall-clock time, advisory only
    pub timestamp: Option<DateTime<Utc>>,
    /// Kind-specific event data
    pub event: EventPayload,
}

/// Kind-specific event data, one variant per wire event kind
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// The router chose which expert lanes run for this query
    RouterDecision(RouterDecision),
    /// One record's analysis finished
    RecordDone(RecordDone),
    /// A fragment of an expert lane's streamed output
    ExpertChunk(ExpertChunk),
    /// An expert lane finished
    ExpertDone(ExpertDone),
    /// The fan-in summary over all lanes
    FinalSummary(FinalSummary),
    /// A failure reported by the producer
    Error(ErrorPayload),
    /// An event kind this client does not know; kept for forward compatibility
    Unknown {
        kind: String,
        raw: serde_json::Value,
    },
}

/// Payload for `router_decision` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub selected_experts: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub total_records: Option<u64>,
}

/// Payload for `record_done` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDone {
    /// Record kind, e.g. "host" or "cert"
    pub kind: String,
    /// Record identifier, e.g. an IP or a certificate fingerprint
    pub id: String,
    pub summary: String,
}

/// Payload for `expert_chunk` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertChunk {
    pub expert_id: String,
    pub chunk: String,
    /// Advisory; completion is signalled only by an `expert_done` event
    #[serde(default)]
    pub is_complete: bool,
}

/// Payload for `expert_done` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpertDone {
    pub expert_id: String,
    pub summary: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub processing_time_ms: Option<u64>,
}

/// Payload for `final_summary` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalSummary {
    pub summary: String,
    #[serde(default)]
    pub expert_count: Option<u64>,
    #[serde(default)]
    pub total_processing_time_ms: Option<u64>,
}

/// Payload for `error` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default = "default_error_code")]
    pub error_code: String,
    pub message: String,
    #[serde(default)]
    pub details: Option<String>,
    /// When present the failure is scoped to one lane; otherwise it is
    /// terminal for the whole run
    #[serde(default)]
    pub expert_id: Option<String>,
}

fn default_error_code() -> String {
    "UNSPECIFIED".to_string()
}

/// Outer frame shape shared by every event kind
#[derive(Debug, Deserialize)]
struct RawFrame {
    event: String,
    thread_id: String,
    seq: u64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    payload: serde_json::Value,
}

impl Envelope {
    /// Parse a raw transport frame body into an envelope.
    ///
    /// Unknown event kinds are preserved as [`EventPayload::Unknown`] rather
    /// than rejected. A frame that fails outer deserialization, or whose
    /// payload does not match its declared kind, is a malformed envelope.
    pub fn parse(text: &str) -> Result<Self> {
        let raw: RawFrame = serde_json::from_str(text).map_err(Error::malformed)?;
        let event = match raw.event.as_str() {
            "router_decision" => EventPayload::RouterDecision(payload(raw.payload)?),
            "record_done" => EventPayload::RecordDone(payload(raw.payload)?),
            "expert_chunk" => EventPayload::ExpertChunk(payload(raw.payload)?),
            "expert_done" => EventPayload::ExpertDone(payload(raw.payload)?),
            "final_summary" => EventPayload::FinalSummary(payload(raw.payload)?),
            "error" => EventPayload::Error(payload(raw.payload)?),
            _ => EventPayload::Unknown {
                kind: raw.event,
                raw: raw.payload,
            },
        };
        Ok(Self {
            conversation_id: raw.thread_id,
            sequence: raw.seq,
            timestamp: raw.timestamp,
            event,
        })
    }

    /// Check if this event ends the run: a final summary, or an error that
    /// is not scoped to a single lane
    pub fn is_terminal(&self) -> bool {
        match &self.event {
            EventPayload::FinalSummary(_) => true,
            EventPayload::Error(e) => e.expert_id.is_none(),
            _ => false,
        }
    }
}

impl EventPayload {
    /// The wire name of this event kind
    pub fn kind(&self) -> &str {
        match self {
            EventPayload::RouterDecision(_) => "router_decision",
            EventPayload::RecordDone(_) => "record_done",
            EventPayload::ExpertChunk(_) => "expert_chunk",
            EventPayload::ExpertDone(_) => "expert_done",
            EventPayload::FinalSummary(_) => "final_summary",
            EventPayload::Error(_) => "error",
            EventPayload::Unknown { kind, .. } => kind,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    serde_json::from_value(value).map_err(Error::malformed)
}
