//! Transport configuration.

use std::time::Duration;

use crate::error::TransportError;
use crate::frame::MTU_PAYLOAD;

/// Tunables for the stream transport.
///
/// Defaults are sized for a LoRa mesh: ~200-byte datagrams, seconds of
/// latency, and a tight airtime budget.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum payload bytes carried per frame.
    pub chunk_payload_size: usize,
    /// Maximum unacknowledged frames per stream per direction.
    pub window_size: u32,
    /// Per-frame retransmit deadline. Flat, no backoff.
    pub retransmit_timeout: Duration,
    /// Retransmissions per frame before the stream declares FatalLoss.
    pub max_retransmits: u32,
    /// Idle threshold after which a stream is reset and closed.
    pub stream_timeout: Duration,
    /// How long a receive-side gap may age before a NACK is emitted.
    pub nack_delay: Duration,
    /// Outbound pacing: sustained frames per second.
    pub pacing_rate: f64,
    /// Outbound pacing: burst capacity in frames.
    pub pacing_burst: u32,
    /// Total queued outbound frames across all streams before admission
    /// parks with `WouldBlock`.
    pub egress_high_water: usize,
    /// Consecutive radio send failures before the radio is latched down.
    pub radio_max_failures: u32,
    /// Upper bound on simultaneously live streams (birthday bound for
    /// random ID allocation).
    pub max_live_streams: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_payload_size: 180,
            window_size: 4,
            retransmit_timeout: Duration::from_millis(5000),
            max_retransmits: 5,
            stream_timeout: Duration::from_secs(120),
            nack_delay: Duration::from_millis(500),
            pacing_rate: 8.0,
            pacing_burst: 4,
            egress_high_water: 64,
            radio_max_failures: 3,
            max_live_streams: u16::MAX as u32,
        }
    }
}

impl StreamConfig {
    /// Validate the configuration, returning `ConfigInvalid` on nonsense
    /// values rather than misbehaving later.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.chunk_payload_size == 0 || self.chunk_payload_size > MTU_PAYLOAD {
            return Err(TransportError::ConfigInvalid(format!(
                "chunk_payload_size must be in 1..={MTU_PAYLOAD}, got {}",
                self.chunk_payload_size
            )));
        }
        if self.window_size == 0 {
            return Err(TransportError::ConfigInvalid(
                "window_size must be at least 1".into(),
            ));
        }
        if self.retransmit_timeout.is_zero() {
            return Err(TransportError::ConfigInvalid(
                "retransmit_timeout must be nonzero".into(),
            ));
        }
        if self.pacing_rate <= 0.0 || !self.pacing_rate.is_finite() {
            return Err(TransportError::ConfigInvalid(format!(
                "pacing_rate must be positive, got {}",
                self.pacing_rate
            )));
        }
        if self.pacing_burst == 0 {
            return Err(TransportError::ConfigInvalid(
                "pacing_burst must be at least 1".into(),
            ));
        }
        if self.egress_high_water == 0 {
            return Err(TransportError::ConfigInvalid(
                "egress_high_water must be at least 1".into(),
            ));
        }
        if self.max_live_streams == 0 || self.max_live_streams > u16::MAX as u32 {
            return Err(TransportError::ConfigInvalid(format!(
                "max_live_streams must be in 1..={}, got {}",
                u16::MAX,
                self.max_live_streams
            )));
        }
        Ok(())
    }
}
