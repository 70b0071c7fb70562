//! Envelope layer configuration.

use std::time::Duration;

use meshstream::error::TransportError;

/// Radio datagram budget left after the 16-byte chunk header.
pub const MAX_CHUNK_PAYLOAD: usize = 184;

/// Per-message-class reliability strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliabilityStrategy {
    /// One ACK for the whole envelope; full retransmit on timeout.
    Simple,
    /// The receiver acknowledges each burst before the next goes out.
    Staged,
    /// The receiver NACKs missing sequences after a quiet interval; only
    /// those are resent.
    Windowed,
    /// Every window of `parity_window` data chunks carries an XOR parity
    /// chunk; single losses recover without a round trip.
    Parity,
}

#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Effective payload bytes per chunk, after the chunk header.
    pub chunk_payload_size: usize,
    /// Chunks sent back to back before pausing.
    pub burst_size: usize,
    /// Pause between bursts, easing radio duty-cycle contention.
    pub inter_burst_delay: Duration,
    /// How long the sender waits for envelope-level feedback before
    /// retransmitting.
    pub resend_timeout: Duration,
    /// Full-envelope transmission attempts before giving up.
    pub max_attempts: u32,
    /// Partial-envelope eviction threshold on the receiver.
    pub reassembly_ttl: Duration,
    /// Receive-side quiet interval before a NACK (windowed strategy).
    pub quiet_interval: Duration,
    pub strategy: ReliabilityStrategy,
    /// Data chunks per parity window (parity strategy).
    pub parity_window: u16,
    /// Dedup LRU capacity.
    pub dedup_window: usize,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            chunk_payload_size: 180,
            burst_size: 5,
            inter_burst_delay: Duration::from_millis(400),
            resend_timeout: Duration::from_secs(8),
            max_attempts: 3,
            reassembly_ttl: Duration::from_secs(120),
            quiet_interval: Duration::from_secs(2),
            strategy: ReliabilityStrategy::Simple,
            parity_window: 4,
            dedup_window: 1024,
        }
    }
}

impl EnvelopeConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.chunk_payload_size == 0 || self.chunk_payload_size > MAX_CHUNK_PAYLOAD {
            return Err(TransportError::ConfigInvalid(format!(
                "chunk_payload_size must be in 1..={MAX_CHUNK_PAYLOAD}, got {}",
                self.chunk_payload_size
            )));
        }
        if self.burst_size == 0 {
            return Err(TransportError::ConfigInvalid(
                "burst_size must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(TransportError::ConfigInvalid(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.parity_window == 0 {
            return Err(TransportError::ConfigInvalid(
                "parity_window must be at least 1".into(),
            ));
        }
        if self.dedup_window == 0 {
            return Err(TransportError::ConfigInvalid(
                "dedup_window must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
