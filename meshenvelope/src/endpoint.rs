//! Envelope endpoint: one node's view of the chunk wire.
//!
//! Glues the sender, receiver, and handler registry to a datagram port.
//! Inbound datagrams are decoded as chunks and routed: control chunks to
//! the sender, data and parity chunks through the receiver pipeline.
//! Completed requests are dispatched to handlers and the response is
//! queued back to the requester; completed responses are held for the
//! local caller to collect by correlation id.
//!
//! `poll` drains everything due (burst pacing, retransmits, NACKs) as
//! encoded datagrams for the radio.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;

use meshstream::radio::NodeId;

use crate::chunk::{Chunk, ChunkFlags};
use crate::config::EnvelopeConfig;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::service::{EnvelopeReceiver, EnvelopeSender, EnvelopeStats};

pub struct EnvelopeEndpoint {
    sender: EnvelopeSender,
    receiver: EnvelopeReceiver,
    handlers: HandlerRegistry,
    /// Completed responses keyed by the request id they correlate to.
    responses: HashMap<String, (NodeId, Envelope)>,
    /// Control chunks (ACKs) awaiting the next poll.
    control: Vec<(NodeId, Chunk)>,
    decode_drops: u64,
}

impl EnvelopeEndpoint {
    pub fn new(config: EnvelopeConfig, handlers: HandlerRegistry) -> Self {
        Self {
            sender: EnvelopeSender::new(config.clone()),
            receiver: EnvelopeReceiver::new(config),
            handlers,
            responses: HashMap::new(),
            control: Vec::new(),
            decode_drops: 0,
        }
    }

    /// Send a request to `dest`. Returns the request id for correlation.
    pub fn request(
        &mut self,
        dest: NodeId,
        envelope: &Envelope,
        now: Instant,
    ) -> Result<String> {
        self.sender.enqueue(dest, envelope, now)?;
        Ok(envelope.id.clone())
    }

    /// Collect the response correlated to a request id, if it has arrived.
    pub fn take_response(&mut self, request_id: &str) -> Option<(NodeId, Envelope)> {
        self.responses.remove(request_id)
    }

    /// Feed one inbound datagram from the radio.
    pub fn on_datagram(&mut self, src: NodeId, datagram: &[u8], now: Instant) {
        let chunk = match Chunk::decode(datagram) {
            Ok(chunk) => chunk,
            Err(err) => {
                self.decode_drops += 1;
                tracing::debug!(src, %err, "dropped undecodable chunk");
                return;
            }
        };

        if chunk.flags.contains(ChunkFlags::ACK) || chunk.flags.contains(ChunkFlags::NACK) {
            self.sender.on_control(&chunk, now);
            return;
        }

        let (replies, envelope) = self.receiver.on_chunk(src, &chunk, now);
        for reply in replies {
            self.queue_control(src, reply);
        }
        if let Some(envelope) = envelope {
            self.deliver(src, envelope, now);
        }
    }

    fn deliver(&mut self, src: NodeId, envelope: Envelope, now: Instant) {
        match envelope.kind {
            EnvelopeKind::Request => {
                let response = self.handlers.dispatch(&envelope);
                if let Err(err) = self.sender.enqueue(src, &response, now) {
                    tracing::warn!(%err, "failed to queue response envelope");
                }
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                let Some(correlation) = envelope.correlation_id.clone() else {
                    tracing::debug!(
                        envelope_id = %envelope.id,
                        "response without correlation id dropped"
                    );
                    return;
                };
                self.responses.insert(correlation, (src, envelope));
            }
        }
    }

    fn queue_control(&mut self, dest: NodeId, chunk: Chunk) {
        self.control.push((dest, chunk));
    }

    /// Drain every datagram due for transmission.
    pub fn poll(&mut self, now: Instant) -> Vec<(NodeId, Bytes)> {
        let mut out: Vec<(NodeId, Bytes)> = Vec::new();
        for (dest, chunk) in self.control.drain(..) {
            out.push((dest, chunk.encode()));
        }
        for (dest, chunk) in self.receiver.on_tick(now) {
            out.push((dest, chunk.encode()));
        }
        for (dest, chunk) in self.sender.poll(now) {
            out.push((dest, chunk.encode()));
        }
        out
    }

    pub fn stats(&self) -> EnvelopeStats {
        self.receiver.stats()
    }

    pub fn decode_drops(&self) -> u64 {
        self.decode_drops
    }

    pub fn pending_requests(&self) -> usize {
        self.sender.pending_count()
    }

    /// Drain sender-side terminal events.
    pub fn take_failed(&mut self) -> Vec<[u8; 8]> {
        self.sender.take_failed()
    }

    pub fn take_completed(&mut self) -> Vec<[u8; 8]> {
        self.sender.take_completed()
    }

    pub fn take_timeouts(&mut self) -> Vec<[u8; 8]> {
        self.receiver.take_timeouts()
    }
}
