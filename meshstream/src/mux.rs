//! Stream multiplexer / demultiplexer.
//!
//! Owns the stream registry, routes inbound datagrams by `stream_id`,
//! accepts passive opens, answers unknown non-SYN traffic with RST, and
//! schedules outbound frames across streams in round-robin order under a
//! token-bucket airtime budget.
//!
//! The multiplexer is a synchronous state machine driven by three entry
//! points: `handle_datagram` (inbound), `on_tick` (timers, idle sweep,
//! NACK cadence), and `pump` (outbound drain). The async driver wires
//! those to a runtime; tests drive them directly with a virtual clock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::config::StreamConfig;
use crate::error::{StreamError, TransportError};
use crate::frame::{Frame, FrameFlags};
use crate::pacing::TokenBucket;
use crate::radio::{NodeId, RadioLink, RadioSupervisor, SendOutcome};
use crate::stream::{Stream, StreamState};
use crate::timer::RetransmitTimer;
use crate::window::TimeoutVerdict;

pub type StreamId = u32;

/// Monotonic transport counters, readable as a snapshot.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportStats {
    pub frames_in: u64,
    pub frames_out: u64,
    /// Datagrams dropped for any decode failure.
    pub decode_drops: u64,
    /// Subset of `decode_drops` that failed the CRC check.
    pub crc_drops: u64,
    /// Frames addressed to the reserved stream id 0 or a mismatched peer.
    pub misaddressed_drops: u64,
    pub retransmits: u64,
    pub fatal_losses: u64,
    pub rsts_sent: u64,
    pub streams_opened: u64,
    pub streams_accepted: u64,
}

pub struct Multiplexer {
    config: StreamConfig,
    streams: HashMap<StreamId, Stream>,
    /// Round-robin service order; each visit drains at most one frame.
    rr: VecDeque<StreamId>,
    timers: RetransmitTimer,
    pacer: TokenBucket,
    radio: RadioSupervisor,
    /// Passive streams accepted since the last `take_accepted` call.
    accepted: VecDeque<StreamId>,
    /// RST replies for unknown streams, fire-and-forget.
    orphan: VecDeque<(NodeId, Frame)>,
    /// A datagram the radio refused; retried before any new work.
    stalled: Option<(NodeId, Bytes)>,
    stats: TransportStats,
}

impl Multiplexer {
    pub fn new(
        config: StreamConfig,
        radio: Arc<dyn RadioLink>,
        now: Instant,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let pacer = TokenBucket::new(config.pacing_rate, config.pacing_burst, now);
        let supervisor = RadioSupervisor::new(radio, config.radio_max_failures);
        Ok(Self {
            config,
            streams: HashMap::new(),
            rr: VecDeque::new(),
            timers: RetransmitTimer::new(),
            pacer,
            radio: supervisor,
            accepted: VecDeque::new(),
            orphan: VecDeque::new(),
            stalled: None,
            stats: TransportStats::default(),
        })
    }

    /// Open an active stream to `peer`. Allocates a random nonzero id,
    /// avoiding collisions with live streams, and queues the SYN.
    pub fn open(&mut self, peer: NodeId, now: Instant) -> Result<StreamId, TransportError> {
        if self.radio.is_down() {
            return Err(TransportError::RadioDown);
        }
        if self.streams.len() as u32 >= self.config.max_live_streams {
            return Err(StreamError::MaxStreamsExceeded(self.config.max_live_streams).into());
        }
        let id = loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !self.streams.contains_key(&candidate) {
                break candidate;
            }
        };
        self.streams
            .insert(id, Stream::connect(id, peer, &self.config, now));
        self.rr.push_back(id);
        self.stats.streams_opened += 1;
        Ok(id)
    }

    /// Queue bytes on a stream. Returns the number of bytes accepted.
    pub fn send(
        &mut self,
        id: StreamId,
        data: &[u8],
        now: Instant,
    ) -> Result<usize, TransportError> {
        if self.radio.is_down() {
            return Err(TransportError::RadioDown);
        }
        if self.outbound_backlog() >= self.config.egress_high_water {
            return Err(StreamError::WouldBlock(id).into());
        }
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::NotFound(id))?;
        Ok(stream.send(data, now)?)
    }

    /// Pop the next delivered payload from a stream.
    pub fn recv(&mut self, id: StreamId) -> Result<Option<Bytes>, TransportError> {
        let stream = self
            .streams
            .get_mut(&id)
            .ok_or(StreamError::NotFound(id))?;
        Ok(stream.recv()?)
    }

    /// Graceful close; unknown ids are treated as already closed.
    pub fn close(&mut self, id: StreamId, now: Instant) -> Result<(), TransportError> {
        match self.streams.get_mut(&id) {
            Some(stream) => Ok(stream.close(now)?),
            None => Ok(()),
        }
    }

    /// Abrupt local reset of one stream.
    pub fn reset(&mut self, id: StreamId) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.reset();
            self.stats.rsts_sent += 1;
        }
    }

    pub fn stream_state(&self, id: StreamId) -> Option<StreamState> {
        self.streams.get(&id).map(|s| s.state())
    }

    pub fn is_eof(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.is_eof())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Drain the ids of passively accepted streams.
    pub fn take_accepted(&mut self) -> Vec<StreamId> {
        self.accepted.drain(..).collect()
    }

    /// Pop a single accepted stream id, if any.
    pub fn pop_accepted(&mut self) -> Option<StreamId> {
        self.accepted.pop_front()
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn radio_down(&self) -> bool {
        self.radio.is_down()
    }

    fn outbound_backlog(&self) -> usize {
        self.streams.values().map(|s| s.backlog()).sum::<usize>() + self.orphan.len()
    }

    /// Route one inbound datagram.
    ///
    /// Decode failures are dropped silently and counted; they never reach
    /// the streams.
    pub fn handle_datagram(&mut self, src: NodeId, datagram: &[u8], now: Instant) {
        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.decode_drops += 1;
                if matches!(err, crate::error::DecodeError::BadCrc { .. }) {
                    self.stats.crc_drops += 1;
                }
                tracing::debug!(src, %err, "dropped undecodable datagram");
                return;
            }
        };
        self.stats.frames_in += 1;

        if frame.stream_id == 0 {
            // Reserved id: never valid on the stream wire.
            self.stats.misaddressed_drops += 1;
            tracing::debug!(src, "dropped frame on reserved stream id 0");
            return;
        }

        if let Some(stream) = self.streams.get_mut(&frame.stream_id) {
            if stream.peer() != src {
                self.stats.misaddressed_drops += 1;
                tracing::debug!(
                    src,
                    stream_id = frame.stream_id,
                    expected = stream.peer(),
                    "dropped frame from wrong peer"
                );
                return;
            }
            stream.on_frame(&frame, now);
            return;
        }

        let syn = frame.flags.contains(FrameFlags::SYN);
        let ack = frame.flags.contains(FrameFlags::ACK);
        if syn && !ack {
            // Passive open for an unknown stream id.
            if self.streams.len() as u32 >= self.config.max_live_streams {
                self.queue_rst(src, frame.stream_id);
                return;
            }
            let mut stream = Stream::accept(frame.stream_id, src, &self.config, now);
            stream.on_frame(&frame, now);
            self.streams.insert(frame.stream_id, stream);
            self.rr.push_back(frame.stream_id);
            self.accepted.push_back(frame.stream_id);
            self.stats.streams_accepted += 1;
            tracing::debug!(src, stream_id = frame.stream_id, "accepted passive stream");
        } else if frame.flags.contains(FrameFlags::RST) {
            // Never answer a RST; that way lies a storm.
        } else {
            self.queue_rst(src, frame.stream_id);
        }
    }

    fn queue_rst(&mut self, dest: NodeId, stream_id: StreamId) {
        self.orphan.push_back((
            dest,
            Frame::control(stream_id, 0, 0, FrameFlags::RST),
        ));
        self.stats.rsts_sent += 1;
    }

    /// Service expired retransmit timers, per-stream maintenance, and the
    /// closed-stream sweep.
    pub fn on_tick(&mut self, now: Instant) {
        for key in self.timers.poll_expired(now) {
            let Some(stream) = self.streams.get_mut(&key.stream_id) else {
                continue;
            };
            match stream.on_timer_fire(key.seq, key.generation) {
                TimeoutVerdict::Retransmit => self.stats.retransmits += 1,
                TimeoutVerdict::FatalLoss => self.stats.fatal_losses += 1,
                TimeoutVerdict::Stale => {}
            }
        }

        for stream in self.streams.values_mut() {
            stream.on_tick(now);
        }

        let reapable: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.is_reapable())
            .map(|(&id, _)| id)
            .collect();
        for id in reapable {
            self.streams.remove(&id);
            self.rr.retain(|&x| x != id);
            tracing::debug!(stream_id = id, "reaped closed stream");
        }
    }

    /// Drain outbound frames to the radio, as far as the pacer and the
    /// adapter allow. Returns the number of datagrams sent.
    pub fn pump(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        loop {
            let Some((dest, datagram)) = self.next_outbound(now) else {
                break;
            };
            if !self.pacer.try_acquire(now) {
                self.stalled = Some((dest, datagram));
                break;
            }
            match self.radio.send(dest, &datagram, now) {
                SendOutcome::Sent => {
                    sent += 1;
                    self.stats.frames_out += 1;
                }
                SendOutcome::Busy | SendOutcome::Failed => {
                    self.stalled = Some((dest, datagram));
                    break;
                }
            }
        }
        sent
    }

    fn next_outbound(&mut self, now: Instant) -> Option<(NodeId, Bytes)> {
        if let Some(stalled) = self.stalled.take() {
            return Some(stalled);
        }

        while let Some((dest, frame)) = self.orphan.pop_front() {
            match frame.encode() {
                Ok(bytes) => return Some((dest, bytes)),
                Err(err) => tracing::error!(%err, "unencodable control frame"),
            }
        }

        // Round-robin: one frame per stream per visit.
        for _ in 0..self.rr.len() {
            let id = self.rr.pop_front()?;
            self.rr.push_back(id);
            let Some(stream) = self.streams.get_mut(&id) else {
                continue;
            };
            let dest = stream.peer();
            if let Some(frame) = stream.next_frame(&mut self.timers, now) {
                match frame.encode() {
                    Ok(bytes) => return Some((dest, bytes)),
                    Err(err) => tracing::error!(%err, stream_id = id, "unencodable frame"),
                }
            }
        }
        None
    }

    /// Earliest instant at which `on_tick` or `pump` has new work.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        let timer = self.timers.next_deadline();
        let pacer = if self.stalled.is_some() || !self.orphan.is_empty() {
            self.pacer.next_available(now)
        } else {
            None
        };
        match (timer, pacer) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
