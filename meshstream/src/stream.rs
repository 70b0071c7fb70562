//! Per-stream connection state machine.
//!
//! A stream is a reliable, ordered byte channel between two nodes. The
//! active side walks Idle -> SynSent -> Established -> FinWait -> Closed;
//! the passive side Idle -> SynRcvd -> Established -> CloseWait -> LastAck
//! -> Closed. RST, fatal retransmit loss, or idle timeout short-circuit to
//! Closed from anywhere.
//!
//! SYN and FIN consume one sequence number each and ride the same send
//! window as data, so handshake and teardown frames are retransmitted with
//! the same machinery. Pure ACK, NACK, and RST frames consume no sequence
//! numbers and are fire-and-forget.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use bytes::Bytes;

use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::frame::{Frame, FrameFlags, MTU_PAYLOAD};
use crate::radio::NodeId;
use crate::seq::{seq_le, seq_lt};
use crate::timer::{RetransmitTimer, TimerKey};
use crate::window::{Offer, RecvWindow, SendWindow, TimeoutVerdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    SynSent,
    SynRcvd,
    Established,
    FinWait,
    CloseWait,
    LastAck,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Idle => "Idle",
            StreamState::SynSent => "SynSent",
            StreamState::SynRcvd => "SynRcvd",
            StreamState::Established => "Established",
            StreamState::FinWait => "FinWait",
            StreamState::CloseWait => "CloseWait",
            StreamState::LastAck => "LastAck",
            StreamState::Closed => "Closed",
        };
        write!(f, "{s}")
    }
}

/// Why a stream reached Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// Both sides finished the FIN exchange.
    Normal,
    /// The peer (or the local API) reset the stream.
    Reset,
    /// A frame exhausted its retransmit budget.
    FatalLoss,
    /// No activity for the configured idle window.
    IdleTimeout,
}

pub struct Stream {
    id: u32,
    peer: NodeId,
    state: StreamState,
    send: SendWindow,
    recv: RecvWindow,
    /// Fire-and-forget control frames awaiting transmit (RST, NACK).
    pending: VecDeque<Frame>,
    /// Sequence numbers due for (re)transmit, in order.
    tx: VecDeque<u32>,
    /// A cumulative ACK is owed to the peer.
    ack_pending: bool,
    /// Local close requested while the window was full; FIN still to admit.
    fin_wanted: bool,
    /// Peer FIN observed but not yet consumable in order.
    fin_seq: Option<u32>,
    recv_data: VecDeque<Bytes>,
    eof: bool,
    last_activity: Instant,
    close_cause: Option<CloseCause>,
    chunk_payload_size: usize,
    rto: std::time::Duration,
    nack_delay: std::time::Duration,
    stream_timeout: std::time::Duration,
    max_retransmits: u32,
}

impl Stream {
    fn new(id: u32, peer: NodeId, config: &StreamConfig, now: Instant) -> Self {
        Self {
            id,
            peer,
            state: StreamState::Idle,
            send: SendWindow::new(0, config.window_size, config.max_retransmits),
            recv: RecvWindow::new(0, config.window_size),
            pending: VecDeque::new(),
            tx: VecDeque::new(),
            ack_pending: false,
            fin_wanted: false,
            fin_seq: None,
            recv_data: VecDeque::new(),
            eof: false,
            last_activity: now,
            close_cause: None,
            chunk_payload_size: config.chunk_payload_size,
            rto: config.retransmit_timeout,
            nack_delay: config.nack_delay,
            stream_timeout: config.stream_timeout,
            max_retransmits: config.max_retransmits,
        }
    }

    /// Create the active side: sends SYN immediately.
    pub fn connect(id: u32, peer: NodeId, config: &StreamConfig, now: Instant) -> Self {
        let mut stream = Self::new(id, peer, config, now);
        let seq = stream
            .send
            .admit(FrameFlags::SYN, Bytes::new())
            .expect("fresh window admits SYN");
        stream.tx.push_back(seq);
        stream.state = StreamState::SynSent;
        stream
    }

    /// Create the passive side for an inbound SYN; the SYN itself is then
    /// processed through `on_frame`.
    pub fn accept(id: u32, peer: NodeId, config: &StreamConfig, now: Instant) -> Self {
        Self::new(id, peer, config, now)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn close_cause(&self) -> Option<CloseCause> {
        self.close_cause
    }

    /// `true` once the peer's FIN has been delivered in order.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Queue bytes for transmission, chunked into MTU-sized frames.
    ///
    /// Returns the number of bytes accepted; a short count means the send
    /// window filled. Zero accepted bytes is `WouldBlock`.
    pub fn send(&mut self, data: &[u8], now: Instant) -> Result<usize, StreamError> {
        match self.state {
            StreamState::Established | StreamState::CloseWait => {}
            StreamState::Idle | StreamState::SynSent | StreamState::SynRcvd => {
                // Handshake still in flight; the caller retries once
                // established.
                return Err(StreamError::WouldBlock(self.id));
            }
            StreamState::FinWait | StreamState::LastAck => {
                return Err(StreamError::Closed(self.id));
            }
            StreamState::Closed => return Err(self.closed_error()),
        }

        let mut accepted = 0;
        for chunk in data.chunks(self.chunk_payload_size) {
            match self
                .send
                .admit(FrameFlags::ACK, Bytes::copy_from_slice(chunk))
            {
                Ok(seq) => {
                    self.tx.push_back(seq);
                    accepted += chunk.len();
                }
                Err(StreamError::WouldBlock(_)) => break,
                Err(e) => return Err(e),
            }
        }
        if accepted == 0 && !data.is_empty() {
            return Err(StreamError::WouldBlock(self.id));
        }
        self.last_activity = now;
        Ok(accepted)
    }

    /// Pop the next delivered payload, if any. `Ok(None)` with `is_eof()`
    /// set means the peer finished cleanly.
    pub fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        if let Some(data) = self.recv_data.pop_front() {
            return Ok(Some(data));
        }
        match self.close_cause {
            Some(CloseCause::Reset) | Some(CloseCause::FatalLoss) => Err(self.closed_error()),
            Some(CloseCause::IdleTimeout) => Err(StreamError::Timeout(self.id)),
            _ => Ok(None),
        }
    }

    /// Graceful close: send FIN once the window admits it. Idempotent.
    pub fn close(&mut self, now: Instant) -> Result<(), StreamError> {
        match self.state {
            StreamState::Established => {
                self.state = StreamState::FinWait;
                self.admit_fin();
            }
            StreamState::CloseWait => {
                self.state = StreamState::LastAck;
                self.admit_fin();
            }
            StreamState::FinWait | StreamState::LastAck | StreamState::Closed => {}
            StreamState::Idle | StreamState::SynSent | StreamState::SynRcvd => {
                // Nothing established to wind down; abort.
                self.reset_local(CloseCause::Normal);
            }
        }
        self.last_activity = now;
        Ok(())
    }

    /// Abrupt local reset: queue a best-effort RST and drop all state.
    pub fn reset(&mut self) {
        self.reset_local(CloseCause::Reset);
    }

    fn admit_fin(&mut self) {
        match self.send.admit(FrameFlags::FIN | FrameFlags::ACK, Bytes::new()) {
            Ok(seq) => {
                self.tx.push_back(seq);
                self.fin_wanted = false;
            }
            Err(_) => self.fin_wanted = true,
        }
    }

    fn closed_error(&self) -> StreamError {
        match self.close_cause {
            Some(CloseCause::Reset) => StreamError::Reset(self.id),
            Some(CloseCause::FatalLoss) => StreamError::FatalLoss(self.id, self.max_retransmits),
            Some(CloseCause::IdleTimeout) => StreamError::Timeout(self.id),
            _ => StreamError::Closed(self.id),
        }
    }

    fn reset_local(&mut self, cause: CloseCause) {
        if self.state == StreamState::Closed {
            return;
        }
        tracing::debug!(stream_id = self.id, ?cause, "stream reset");
        self.state = StreamState::Closed;
        self.close_cause = Some(cause);
        self.send.clear();
        self.recv.clear();
        self.recv_data.clear();
        self.tx.clear();
        self.pending.clear();
        self.ack_pending = false;
        self.fin_wanted = false;
        // One best-effort RST; never retransmitted, never replied to.
        self.pending.push_back(Frame::control(
            self.id,
            self.send.next_seq(),
            self.recv.ack_value(),
            FrameFlags::RST | FrameFlags::ACK,
        ));
    }

    fn enter_closed(&mut self, cause: CloseCause) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Closed;
            self.close_cause = Some(cause);
        }
    }

    /// Process one inbound frame addressed to this stream.
    pub fn on_frame(&mut self, frame: &Frame, now: Instant) {
        self.last_activity = now;

        if frame.flags.contains(FrameFlags::RST) {
            if self.state != StreamState::Closed {
                tracing::debug!(stream_id = self.id, "reset by peer");
                self.state = StreamState::Closed;
                self.close_cause = Some(CloseCause::Reset);
                self.send.clear();
                self.recv.clear();
                self.recv_data.clear();
                self.tx.clear();
                self.pending.clear();
                self.ack_pending = false;
            }
            return;
        }

        if frame.flags.contains(FrameFlags::ACK) {
            let retired = self.send.on_ack(frame.ack);
            if retired > 0 && self.fin_wanted {
                self.admit_fin();
            }
        }

        if frame.flags.contains(FrameFlags::NACK) {
            for seq in self.send.on_nack(&frame.nack_seqs()) {
                if !self.tx.contains(&seq) {
                    self.tx.push_front(seq);
                }
            }
        }

        self.handle_handshake(frame);

        if frame.flags.contains(FrameFlags::FIN) {
            if seq_lt(frame.seq, self.recv.ack_value()) {
                // Already consumed; the peer missed our ACK.
                self.ack_pending = true;
            } else {
                self.fin_seq = Some(frame.seq);
                self.try_consume_fin();
            }
        }

        if !frame.payload.is_empty() && !frame.flags.contains(FrameFlags::NACK) {
            self.handle_data(frame, now);
        }

        // Our FIN is acknowledged: LastAck completes.
        if self.state == StreamState::LastAck && self.send.is_drained() && !self.fin_wanted {
            self.enter_closed(CloseCause::Normal);
        }
    }

    fn handle_handshake(&mut self, frame: &Frame) {
        let syn = frame.flags.contains(FrameFlags::SYN);
        let ack = frame.flags.contains(FrameFlags::ACK);

        match self.state {
            StreamState::Idle if syn => {
                // Passive open: consume the peer's SYN, answer SYN+ACK.
                self.recv.consume_control(frame.seq);
                let seq = self
                    .send
                    .admit(FrameFlags::SYN | FrameFlags::ACK, Bytes::new())
                    .expect("fresh window admits SYN+ACK");
                self.tx.push_back(seq);
                self.state = StreamState::SynRcvd;
            }
            StreamState::SynSent if syn && ack => {
                self.recv.consume_control(frame.seq);
                self.state = StreamState::Established;
                self.ack_pending = true;
            }
            StreamState::SynRcvd if syn => {
                // Duplicate SYN: answer idempotently by requeueing the
                // still-unacked SYN+ACK.
                if self.send.frame_for(self.id, 0, 0).is_some() && !self.tx.contains(&0) {
                    self.tx.push_back(0);
                }
            }
            StreamState::SynRcvd if ack && seq_le(1, self.send.base()) => {
                self.state = StreamState::Established;
            }
            _ if syn => {
                // Late SYN or SYN+ACK replay on an established stream:
                // the sequence was already consumed, so just re-ack.
                self.ack_pending = true;
            }
            _ => {}
        }
    }

    fn try_consume_fin(&mut self) {
        let Some(fin_seq) = self.fin_seq else { return };
        if !self.recv.consume_control(fin_seq) {
            return;
        }
        self.fin_seq = None;
        self.ack_pending = true;
        self.eof = true;
        match self.state {
            StreamState::Established => self.state = StreamState::CloseWait,
            StreamState::FinWait => self.enter_closed(CloseCause::Normal),
            _ => {}
        }
    }

    fn handle_data(&mut self, frame: &Frame, now: Instant) {
        match self.state {
            StreamState::Established | StreamState::FinWait => {}
            StreamState::Closed => return,
            StreamState::CloseWait | StreamState::LastAck
                if seq_lt(frame.seq, self.recv.ack_value()) =>
            {
                // A retransmit of data delivered before the peer's FIN;
                // the ACK got lost, so repeat it.
                self.ack_pending = true;
                return;
            }
            _ => {
                // Data outside the legal states is a protocol violation.
                tracing::debug!(
                    stream_id = self.id,
                    state = %self.state,
                    "data frame in illegal state"
                );
                self.reset_local(CloseCause::Reset);
                return;
            }
        }

        match self.recv.offer(frame.seq, frame.payload.clone(), now) {
            Offer::Delivered(payloads) => {
                self.recv_data.extend(payloads);
                self.ack_pending = true;
                self.try_consume_fin();
            }
            Offer::Buffered => {}
            Offer::Duplicate => self.ack_pending = true,
            Offer::OutOfWindow => {
                tracing::debug!(
                    stream_id = self.id,
                    seq = frame.seq,
                    "dropped frame beyond reorder horizon"
                );
            }
        }
    }

    /// Handle a retransmit-timer fire. The mux counts the verdicts; on
    /// `FatalLoss` the stream has already reset itself.
    pub fn on_timer_fire(&mut self, seq: u32, generation: u64) -> TimeoutVerdict {
        let verdict = self.send.on_timeout(seq, generation);
        match verdict {
            TimeoutVerdict::Stale => {}
            TimeoutVerdict::Retransmit => {
                if !self.tx.contains(&seq) {
                    self.tx.push_back(seq);
                }
            }
            TimeoutVerdict::FatalLoss => {
                tracing::warn!(stream_id = self.id, seq, "retransmit budget exhausted");
                self.reset_local(CloseCause::FatalLoss);
            }
        }
        verdict
    }

    /// Periodic maintenance: idle timeout and gap-triggered NACKs.
    pub fn on_tick(&mut self, now: Instant) {
        if self.state == StreamState::Closed {
            return;
        }

        if now.saturating_duration_since(self.last_activity) > self.stream_timeout {
            tracing::debug!(stream_id = self.id, "idle timeout");
            self.reset_local(CloseCause::IdleTimeout);
            return;
        }

        if let Some(age) = self.recv.gap_age(now) {
            if age >= self.nack_delay {
                let missing = self.recv.missing(MTU_PAYLOAD / 4);
                if !missing.is_empty() {
                    self.pending
                        .push_back(Frame::nack(self.id, self.recv.ack_value(), &missing));
                    self.recv.defer_nack(now);
                }
            }
        }
    }

    /// Produce the next outbound frame, arming retransmit timers for
    /// window frames. At most one frame per call, preserving round-robin
    /// fairness across streams.
    pub fn next_frame(&mut self, timers: &mut RetransmitTimer, now: Instant) -> Option<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            if frame.flags.contains(FrameFlags::ACK) {
                self.ack_pending = false;
            }
            return Some(frame);
        }

        while let Some(seq) = self.tx.pop_front() {
            let Some(frame) = self.send.frame_for(self.id, seq, self.recv.ack_value()) else {
                continue; // acknowledged while queued
            };
            let generation = self.send.arm(seq).expect("inflight entry");
            timers.arm(
                now + self.rto,
                TimerKey {
                    stream_id: self.id,
                    seq,
                    generation,
                },
            );
            if frame.flags.contains(FrameFlags::ACK) {
                self.ack_pending = false;
            }
            return Some(frame);
        }

        if self.ack_pending {
            self.ack_pending = false;
            return Some(Frame::control(
                self.id,
                self.send.next_seq(),
                self.recv.ack_value(),
                FrameFlags::ACK,
            ));
        }

        None
    }

    /// Anything still to say on the wire?
    pub fn has_output(&self) -> bool {
        !self.pending.is_empty() || !self.tx.is_empty() || self.ack_pending || self.fin_wanted
    }

    /// Frames queued for transmit, for the global backpressure watermark.
    pub fn backlog(&self) -> usize {
        self.pending.len() + self.tx.len()
    }

    /// A stream is reaped once closed with all output drained and the
    /// application has consumed everything delivered.
    pub fn is_reapable(&self) -> bool {
        self.state == StreamState::Closed && !self.has_output() && self.recv_data.is_empty()
    }
}
