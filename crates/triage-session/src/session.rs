//! Session controller: owns one conversation's lifecycle
//!
//! One `Session` drives one run at a time: it opens the transport, parses
//! frames into envelopes, pushes them through the sequencing guard into the
//! reducer, and publishes updates to subscribers. The spawned read loop is
//! the only writer of the conversation state; everyone else gets snapshots.

use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use triage_stream::{
    ConversationState, Envelope, ErrorPayload, EventPayload, RunStatus, Sequencer,
    SequencerConfig, reduce,
};

use crate::error::Result;
use crate::transport::{EventSource, FrameStream, QueryRequest};

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SessionPhase {
    /// Check if the session has stopped processing events
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Failed | SessionPhase::Cancelled
        )
    }
}

/// Notification published to subscribers
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// The session lifecycle phase changed
    Phase(SessionPhase),
    /// An envelope was reduced into the state; re-snapshot to observe it
    Applied { sequence: u64 },
}

/// Session configuration
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub sequencer: SequencerConfig,
}

/// Controller for a stream of analysis runs against one backend
pub struct Session {
    transport: Arc<dyn EventSource>,
    config: SessionConfig,
    shared: Arc<Shared>,
    run_token: Mutex<CancellationToken>,
}

struct Shared {
    state: Mutex<ConversationState>,
    phase: Mutex<SessionPhase>,
    update_tx: broadcast::Sender<SessionUpdate>,
}

impl Session {
    /// Create a session over the given transport
    pub fn new(transport: Arc<dyn EventSource>) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    /// Create a session with explicit configuration
    pub fn with_config(transport: Arc<dyn EventSource>, config: SessionConfig) -> Self {
        let (update_tx, _) = broadcast::channel(256);
        Self {
            transport,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ConversationState::default()),
                phase: Mutex::new(SessionPhase::Idle),
                update_tx,
            }),
            run_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Subscribe to session updates.
    ///
    /// The channel is bounded; a lagging subscriber misses intermediate
    /// updates but can always recover the current state via `snapshot`.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.shared.update_tx.subscribe()
    }

    /// Snapshot of the current conversation state
    pub fn snapshot(&self) -> ConversationState {
        self.shared.state.lock().clone()
    }

    /// Current lifecycle phase
    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.lock()
    }

    /// Start a new run, cancelling any run in progress.
    ///
    /// The previous run's state is discarded wholesale; frames still in
    /// flight for it are recognized by conversation id and dropped.
    pub async fn start(&self, request: QueryRequest) -> Result<()> {
        let token = {
            let mut guard = self.run_token.lock();
            guard.cancel();
            *guard = CancellationToken::new();
            guard.clone()
        };

        {
            let mut state = self.shared.state.lock();
            *state = ConversationState::new(request.thread_id.clone());
            state.run_status = RunStatus::Streaming;
        }
        self.shared.set_phase(SessionPhase::Connecting);

        let frames = match self.transport.open(&request).await {
            Ok(frames) => frames,
            Err(e) => {
                let mut sequencer = Sequencer::new(self.config.sequencer.clone());
                self.shared.fail_run(
                    &mut sequencer,
                    &request.thread_id,
                    format!("failed to open stream: {e}"),
                );
                return Err(e);
            }
        };

        let shared = Arc::clone(&self.shared);
        let config = self.config.sequencer.clone();
        tokio::spawn(read_loop(shared, frames, token, request.thread_id, config));
        Ok(())
    }

    /// Stop the current run, keeping its accumulated state for display
    pub fn cancel(&self) {
        self.run_token.lock().cancel();
        let mut phase = self.shared.phase.lock();
        if matches!(*phase, SessionPhase::Connecting | SessionPhase::Streaming) {
            *phase = SessionPhase::Cancelled;
            drop(phase);
            let _ = self
                .shared
                .update_tx
                .send(SessionUpdate::Phase(SessionPhase::Cancelled));
        }
    }

    /// Clear back to idle, discarding all state
    pub fn reset(&self) {
        self.run_token.lock().cancel();
        *self.shared.state.lock() = ConversationState::default();
        self.shared.set_phase(SessionPhase::Idle);
    }
}

impl Shared {
    fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
        let _ = self.update_tx.send(SessionUpdate::Phase(phase));
    }

    /// Reduce released envelopes into the state, in order.
    ///
    /// Returns true if a terminal envelope was applied. Envelopes for a
    /// conversation that has since been replaced are dropped here.
    fn apply(&self, ready: Vec<Envelope>) -> bool {
        let mut terminal = false;
        for envelope in ready {
            let sequence = envelope.sequence;
            {
                let mut state = self.state.lock();
                if state.conversation_id != envelope.conversation_id {
                    tracing::debug!(
                        stale = %envelope.conversation_id,
                        "discarding envelope for replaced conversation"
                    );
                    continue;
                }
                reduce(&mut state, &envelope);
            }
            let _ = self.update_tx.send(SessionUpdate::Applied { sequence });
            if envelope.is_terminal() {
                terminal = true;
            }
        }
        terminal
    }

    /// Settle the lifecycle phase from the reduced run status
    fn finish(&self) {
        let status = self.state.lock().run_status;
        let phase = match status {
            RunStatus::Completed => SessionPhase::Completed,
            _ => SessionPhase::Failed,
        };
        self.set_phase(phase);
    }

    /// The transport ended without a natural conclusion: release whatever
    /// the guard still holds, then record a synthetic run-level error
    fn fail_run(&self, sequencer: &mut Sequencer, conversation_id: &str, message: String) {
        if self.apply(sequencer.drain()) {
            // A buffered terminal event was force-applied; the run did
            // reach a conclusion after all
            self.finish();
            return;
        }

        let sequence = self.state.lock().highest_applied_sequence + 1;
        let envelope = Envelope {
            conversation_id: conversation_id.to_string(),
            sequence,
            timestamp: None,
            event: EventPayload::Error(ErrorPayload {
                error_code: "connection_lost".to_string(),
                message,
                details: None,
                expert_id: None,
            }),
        };
        self.apply(vec![envelope]);
        self.finish();
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut frames: FrameStream,
    token: CancellationToken,
    conversation_id: String,
    config: SequencerConfig,
) {
    let mut sequencer = Sequencer::new(config);
    let mut first_frame = true;

    loop {
        let deadline = sequencer.gap_deadline();
        tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!(%conversation_id, "session cancelled, closing stream");
                return;
            }
            _ = gap_wait(deadline) => {
                if shared.apply(sequencer.flush_due(Instant::now())) {
                    shared.finish();
                    return;
                }
            }
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if first_frame {
                        first_frame = false;
                        shared.set_phase(SessionPhase::Streaming);
                    }
                    let envelope = match Envelope::parse(&frame.data) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            // One bad frame must not erase valid progress
                            tracing::warn!(event = %frame.event, "dropping malformed frame: {e}");
                            continue;
                        }
                    };
                    if envelope.conversation_id != conversation_id {
                        tracing::debug!(
                            stale = %envelope.conversation_id,
                            "discarding frame for stale conversation"
                        );
                        continue;
                    }
                    if shared.apply(sequencer.accept(envelope, Instant::now())) {
                        shared.finish();
                        return;
                    }
                }
                Some(Err(e)) => {
                    shared.fail_run(&mut sequencer, &conversation_id, e.to_string());
                    return;
                }
                None => {
                    shared.fail_run(
                        &mut sequencer,
                        &conversation_id,
                        "stream closed before completion".to_string(),
                    );
                    return;
                }
            }
        }
    }
}

async fn gap_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
        }
        None => std::future::pending::<()>().await,
    }
}
