//! Sequencing guard: applies envelopes in ascending sequence order
//!
//! The transport delivers envelopes in arrival order, which under
//! reconnection or producer-side multiplexing is not sequence order. The
//! guard holds a watermark of the highest applied sequence, buffers
//! anything that arrives early, and releases envelopes strictly ascending.
//! Sequence numbers are 1-based on the wire.
//!
//! Two liveness escapes trade ordering for progress: a bounded buffer that
//! force-flushes its oldest entries when full, and a gap timeout after
//! which a missing sequence is declared lost and everything buffered is
//! released. After either escape, late arrivals for the skipped range fall
//! below the watermark and are dropped.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::envelope::Envelope;

/// Sequencing guard configuration
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Maximum number of out-of-order envelopes held back
    pub max_buffered: usize,
    /// How long to wait on a sequence gap before flushing past it
    pub gap_timeout: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            max_buffered: 256,
            gap_timeout: Duration::from_secs(3),
        }
    }
}

/// Reorders one conversation's envelopes into ascending sequence order
#[derive(Debug)]
pub struct Sequencer {
    config: SequencerConfig,
    highest_applied: u64,
    buffered: BTreeMap<u64, Envelope>,
    /// When the current gap wait started, if envelopes are held back
    gap_since: Option<Instant>,
}

impl Sequencer {
    /// Create a guard with the given configuration
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            highest_applied: 0,
            buffered: BTreeMap::new(),
            gap_since: None,
        }
    }

    /// Highest sequence number released so far
    pub fn highest_applied(&self) -> u64 {
        self.highest_applied
    }

    /// Number of envelopes currently held back
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// The deadline at which [`Sequencer::flush_due`] will release buffered
    /// envelopes, if a gap wait is in progress
    pub fn gap_deadline(&self) -> Option<Instant> {
        self.gap_since.map(|since| since + self.config.gap_timeout)
    }

    /// Accept an arriving envelope.
    ///
    /// Returns the envelopes now ready to apply, in ascending sequence
    /// order. Duplicates at or below the watermark are dropped here, before
    /// they ever reach the reducer.
    pub fn accept(&mut self, envelope: Envelope, now: Instant) -> Vec<Envelope> {
        let seq = envelope.sequence;
        if seq <= self.highest_applied {
            tracing::debug!(seq, watermark = self.highest_applied, "dropping duplicate envelope");
            return Vec::new();
        }

        let mut ready = Vec::new();
        if seq == self.highest_applied + 1 {
            self.highest_applied = seq;
            ready.push(envelope);
            self.drain_contiguous(&mut ready);
        } else {
            // An in-flight duplicate of a buffered sequence just replaces it
            self.buffered.insert(seq, envelope);
            self.flush_overflow(&mut ready);
        }

        self.track_gap(now);
        ready
    }

    /// Release everything buffered if the gap wait has expired.
    ///
    /// Call when the deadline from [`Sequencer::gap_deadline`] passes. The
    /// missing sequences are treated as permanently lost.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Envelope> {
        match self.gap_since {
            Some(since) if now.duration_since(since) >= self.config.gap_timeout => {
                tracing::warn!(
                    buffered = self.buffered.len(),
                    watermark = self.highest_applied,
                    "sequence gap timed out, flushing buffered envelopes"
                );
                self.release_all()
            }
            _ => Vec::new(),
        }
    }

    /// Release everything buffered regardless of gaps or deadlines.
    ///
    /// Used when the transport ends so buffered progress is not lost.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.release_all()
    }

    fn release_all(&mut self) -> Vec<Envelope> {
        let mut ready = Vec::with_capacity(self.buffered.len());
        while let Some((seq, envelope)) = self.buffered.pop_first() {
            self.highest_applied = seq;
            ready.push(envelope);
        }
        self.gap_since = None;
        ready
    }

    /// Move buffered envelopes that are now contiguous with the watermark
    fn drain_contiguous(&mut self, ready: &mut Vec<Envelope>) {
        while let Some(envelope) = self.buffered.remove(&(self.highest_applied + 1)) {
            self.highest_applied += 1;
            ready.push(envelope);
        }
    }

    /// Evict oldest buffered entries past the cap, applying them in order
    /// even though the gap below them is unresolved
    fn flush_overflow(&mut self, ready: &mut Vec<Envelope>) {
        while self.buffered.len() > self.config.max_buffered {
            let (seq, envelope) = self.buffered.pop_first().expect("buffer not empty");
            tracing::warn!(seq, "sequence buffer full, force-applying past gap");
            self.highest_applied = seq;
            ready.push(envelope);
            self.drain_contiguous(ready);
        }
    }

    fn track_gap(&mut self, now: Instant) {
        if self.buffered.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }
    }
}
