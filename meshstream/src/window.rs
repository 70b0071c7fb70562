//! Sliding windows: sender-side retransmit ring and receiver-side reorder
//! buffer.
//!
//! The sender admits at most `window_size` unacknowledged frames; the
//! receiver buffers out-of-order arrivals and releases the contiguous
//! prefix. All sequence comparisons use modular arithmetic (`crate::seq`)
//! so both sides survive u32 wraparound.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use crate::error::StreamError;
use crate::frame::{Frame, FrameFlags};
use crate::seq::{seq_distance, seq_le, seq_lt};

/// One admitted, not-yet-acknowledged frame.
struct SendEntry {
    flags: FrameFlags,
    payload: Bytes,
    retries: u32,
    /// Bumped on every (re)arm; a timer fire with a stale generation is
    /// ignored.
    generation: u64,
}

/// Outcome of a retransmit-timer fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// The entry was acknowledged or re-armed since; nothing to do.
    Stale,
    /// Retransmit this sequence.
    Retransmit,
    /// Retry budget exhausted; the stream must reset.
    FatalLoss,
}

/// Sender side: a bounded ring of outstanding frames keyed by sequence.
pub struct SendWindow {
    base: u32,
    next_seq: u32,
    size: u32,
    max_retransmits: u32,
    inflight: HashMap<u32, SendEntry>,
}

impl SendWindow {
    pub fn new(initial_seq: u32, size: u32, max_retransmits: u32) -> Self {
        Self {
            base: initial_seq,
            next_seq: initial_seq,
            size,
            max_retransmits,
            inflight: HashMap::new(),
        }
    }

    /// Admit a frame into the window.
    ///
    /// Assigns and returns the next sequence number, or `WouldBlock` when
    /// the window is full. SYN and FIN pass through here too: they consume
    /// sequence numbers and are retransmitted like data.
    pub fn admit(&mut self, flags: FrameFlags, payload: Bytes) -> Result<u32, StreamError> {
        if seq_distance(self.next_seq, self.base) >= self.size {
            return Err(StreamError::WouldBlock(0));
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.inflight.insert(
            seq,
            SendEntry {
                flags,
                payload,
                retries: 0,
                generation: 0,
            },
        );
        seq_invariant(self.base, self.next_seq, self.size);
        Ok(seq)
    }

    /// Process a cumulative acknowledgment: everything strictly below `ack`
    /// has been delivered. Returns the number of frames retired.
    pub fn on_ack(&mut self, ack: u32) -> usize {
        if !(seq_lt(self.base, ack) && seq_le(ack, self.next_seq)) {
            return 0;
        }
        let before = self.inflight.len();
        self.inflight.retain(|&seq, _| !seq_lt(seq, ack));
        self.base = ack;
        seq_invariant(self.base, self.next_seq, self.size);
        before - self.inflight.len()
    }

    /// Process a NACK list: each still-inflight listed sequence is charged
    /// one retry and returned for immediate resend.
    pub fn on_nack(&mut self, seqs: &[u32]) -> Vec<u32> {
        let mut resend = Vec::new();
        for &seq in seqs {
            if let Some(entry) = self.inflight.get_mut(&seq) {
                entry.retries += 1;
                resend.push(seq);
            }
        }
        resend
    }

    /// Handle a retransmit-timer fire for `(seq, generation)`.
    pub fn on_timeout(&mut self, seq: u32, generation: u64) -> TimeoutVerdict {
        let Some(entry) = self.inflight.get_mut(&seq) else {
            return TimeoutVerdict::Stale;
        };
        if entry.generation != generation {
            return TimeoutVerdict::Stale;
        }
        entry.retries += 1;
        if entry.retries > self.max_retransmits {
            TimeoutVerdict::FatalLoss
        } else {
            TimeoutVerdict::Retransmit
        }
    }

    /// Build the wire frame for `seq`, stamping the current cumulative ack.
    /// Returns `None` when the sequence has been acknowledged meanwhile.
    /// The flags are exactly those given at admit time; an initial SYN must
    /// not grow an ACK bit and turn into a SYN+ACK.
    pub fn frame_for(&self, stream_id: u32, seq: u32, ack: u32) -> Option<Frame> {
        let entry = self.inflight.get(&seq)?;
        Some(Frame {
            stream_id,
            seq,
            ack,
            flags: entry.flags,
            payload: entry.payload.clone(),
        })
    }

    /// Bump and return the arm generation for `seq`, called when the frame
    /// is handed to the radio and its timer is armed.
    pub fn arm(&mut self, seq: u32) -> Option<u64> {
        let entry = self.inflight.get_mut(&seq)?;
        entry.generation += 1;
        Some(entry.generation)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_full(&self) -> bool {
        seq_distance(self.next_seq, self.base) >= self.size
    }

    pub fn is_drained(&self) -> bool {
        self.inflight.is_empty()
    }

    /// Drop all pending state (RST teardown).
    pub fn clear(&mut self) {
        self.inflight.clear();
        self.base = self.next_seq;
    }
}

/// `base <= next_seq <= base + window_size`, modularly.
#[inline]
fn seq_invariant(base: u32, next_seq: u32, size: u32) {
    debug_assert!(seq_distance(next_seq, base) <= size);
}

/// Outcome of offering one inbound payload to the reorder buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// The offered frame completed a contiguous prefix; deliver in order.
    Delivered(Vec<Bytes>),
    /// Buffered ahead of a gap.
    Buffered,
    /// Already delivered or already buffered; re-acknowledge only.
    Duplicate,
    /// Beyond the reorder horizon; dropped.
    OutOfWindow,
}

/// Receiver side: reorder buffer releasing payloads in sequence order.
pub struct RecvWindow {
    next_expected: u32,
    horizon: u32,
    buffer: HashMap<u32, Bytes>,
    /// When the oldest unfilled gap was first observed (for NACK pacing).
    gap_since: Option<Instant>,
}

impl RecvWindow {
    pub fn new(next_expected: u32, horizon: u32) -> Self {
        Self {
            next_expected,
            horizon,
            buffer: HashMap::new(),
            gap_since: None,
        }
    }

    /// Offer one inbound payload with its sequence number.
    pub fn offer(&mut self, seq: u32, payload: Bytes, now: Instant) -> Offer {
        if seq_lt(seq, self.next_expected) {
            return Offer::Duplicate;
        }
        if seq_distance(seq, self.next_expected) >= self.horizon {
            return Offer::OutOfWindow;
        }
        if self.buffer.contains_key(&seq) {
            return Offer::Duplicate;
        }
        self.buffer.insert(seq, payload);

        let mut delivered = Vec::new();
        while let Some(data) = self.buffer.remove(&self.next_expected) {
            delivered.push(data);
            self.next_expected = self.next_expected.wrapping_add(1);
        }

        if self.buffer.is_empty() {
            self.gap_since = None;
        } else if self.gap_since.is_none() {
            self.gap_since = Some(now);
        }

        if delivered.is_empty() {
            Offer::Buffered
        } else {
            Offer::Delivered(delivered)
        }
    }

    /// Consume a control sequence number (SYN or FIN) when it is next in
    /// line. Returns `false` if it is not yet deliverable.
    pub fn consume_control(&mut self, seq: u32) -> bool {
        if seq == self.next_expected {
            self.next_expected = self.next_expected.wrapping_add(1);
            if self.buffer.is_empty() {
                self.gap_since = None;
            }
            true
        } else {
            false
        }
    }

    /// The cumulative acknowledgment value: all seq below have been
    /// delivered.
    pub fn ack_value(&self) -> u32 {
        self.next_expected
    }

    /// Enumerate missing sequences between `next_expected` and the highest
    /// buffered arrival, capped at `limit`.
    pub fn missing(&self, limit: usize) -> Vec<u32> {
        let Some(&highest) = self
            .buffer
            .keys()
            .max_by(|&&a, &&b| {
                if seq_lt(a, b) {
                    std::cmp::Ordering::Less
                } else if a == b {
                    std::cmp::Ordering::Equal
                } else {
                    std::cmp::Ordering::Greater
                }
            })
        else {
            return Vec::new();
        };

        let mut missing = Vec::new();
        let mut seq = self.next_expected;
        while seq_lt(seq, highest) && missing.len() < limit {
            if !self.buffer.contains_key(&seq) {
                missing.push(seq);
            }
            seq = seq.wrapping_add(1);
        }
        missing
    }

    /// Age of the oldest unfilled gap, if any.
    pub fn gap_age(&self, now: Instant) -> Option<std::time::Duration> {
        self.gap_since.map(|t| now.saturating_duration_since(t))
    }

    /// Restart the gap clock after a NACK has been emitted, so each gap
    /// draws at most one NACK per delay window.
    pub fn defer_nack(&mut self, now: Instant) {
        if self.gap_since.is_some() {
            self.gap_since = Some(now);
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.gap_since = None;
    }
}
