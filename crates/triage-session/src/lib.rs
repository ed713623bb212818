//! triage-session: stream session lifecycle
//!
//! This crate owns the lifecycle of one conversation with the analysis
//! backend: it opens the transport, feeds incoming frames through the
//! sequencing guard into the reducer, and exposes state snapshots plus
//! cancellation to its consumer.

pub mod error;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use session::{Session, SessionConfig, SessionPhase, SessionUpdate};
pub use transport::{EventSource, Frame, FrameStream, QueryRequest, SseEventSource};
