//! Envelope sender and receiver pipelines.
//!
//! Both are poll-based state machines: callers feed inbound chunks and a
//! clock, and drain `(destination, chunk)` transmissions. No runtime is
//! required, which keeps loss and timing scenarios deterministic under
//! test; the gateway endpoint wires these to a radio.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use meshstream::radio::NodeId;

use crate::chunk::{Chunk, ChunkFlags};
use crate::config::{EnvelopeConfig, ReliabilityStrategy};
use crate::dedup::DedupCache;
use crate::envelope::Envelope;
use crate::error::{EnvelopeError, Result};
use crate::parity::{build_parity, window_count, window_range};
use crate::reassembly::{OfferOutcome, Reassembler};

/// One envelope in flight.
struct Outgoing {
    dest: NodeId,
    /// Transmission plan: data chunks, with parity chunks interleaved per
    /// window under the parity strategy.
    plan: Vec<Chunk>,
    /// Data chunk count (excludes parity).
    total: u16,
    cursor: usize,
    /// NACKed sequences awaiting selective resend.
    resend: VecDeque<u16>,
    next_burst_at: Instant,
    resend_deadline: Instant,
    /// Staged strategy: a burst is on the air, awaiting its ACK.
    await_burst_ack: bool,
    attempts: u32,
}

/// Chunks, bursts, and retransmits outgoing envelopes.
pub struct EnvelopeSender {
    config: EnvelopeConfig,
    outgoing: HashMap<[u8; 8], Outgoing>,
    completed: Vec<[u8; 8]>,
    failed: Vec<[u8; 8]>,
}

impl EnvelopeSender {
    pub fn new(config: EnvelopeConfig) -> Self {
        Self {
            config,
            outgoing: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Serialize, compress, chunk, and queue an envelope for `dest`.
    /// Returns the id prefix the transfer is tracked by.
    pub fn enqueue(
        &mut self,
        dest: NodeId,
        envelope: &Envelope,
        now: Instant,
    ) -> Result<[u8; 8]> {
        let wire = envelope.encode()?;
        let id = envelope.id_prefix();
        let data = Chunk::split(id, &wire, self.config.chunk_payload_size).ok_or(
            EnvelopeError::TooLarge {
                size: wire.len(),
                max: self.config.chunk_payload_size * u16::MAX as usize,
            },
        )?;
        let total = data.len() as u16;

        let plan = match self.config.strategy {
            ReliabilityStrategy::Parity => {
                let k = self.config.parity_window;
                let mut plan = Vec::with_capacity(data.len() + window_count(total, k) as usize);
                for index in 1..=window_count(total, k) {
                    let range = window_range(index, k, total);
                    let window: Vec<&Chunk> =
                        data[(*range.start() - 1) as usize..*range.end() as usize]
                            .iter()
                            .collect();
                    let parity = build_parity(window.iter().map(|c| &c.payload));
                    plan.extend(window.into_iter().cloned());
                    plan.push(Chunk::parity(id, index, total, parity));
                }
                plan
            }
            _ => data,
        };

        if self.outgoing.insert(
            id,
            Outgoing {
                dest,
                plan,
                total,
                cursor: 0,
                resend: VecDeque::new(),
                next_burst_at: now,
                resend_deadline: now + self.config.resend_timeout,
                await_burst_ack: false,
                attempts: 1,
            },
        )
        .is_some()
        {
            tracing::warn!(id = ?id, "replaced in-flight envelope with colliding id prefix");
        }
        Ok(id)
    }

    /// Drain transmissions that are due: selective resends first, then the
    /// next burst, then whole-envelope retransmits on ACK timeout.
    pub fn poll(&mut self, now: Instant) -> Vec<(NodeId, Chunk)> {
        let mut out = Vec::new();
        let mut gave_up = Vec::new();

        for (&id, o) in &mut self.outgoing {
            if now < o.next_burst_at {
                continue;
            }

            // ACK timeout with everything already on the air: rewind for a
            // whole-envelope retransmit, or give up.
            if o.cursor >= o.plan.len() && o.resend.is_empty() && now >= o.resend_deadline {
                if o.attempts >= self.config.max_attempts {
                    gave_up.push(id);
                    continue;
                }
                o.attempts += 1;
                o.cursor = 0;
                o.await_burst_ack = false;
                tracing::debug!(
                    id = ?id,
                    attempt = o.attempts,
                    "no envelope ACK; retransmitting"
                );
            }

            if !o.resend.is_empty() {
                for _ in 0..self.config.burst_size {
                    let Some(seq) = o.resend.pop_front() else {
                        break;
                    };
                    if let Some(chunk) =
                        o.plan.iter().find(|c| c.is_data() && c.sequence == seq)
                    {
                        out.push((o.dest, chunk.clone()));
                    }
                }
                o.next_burst_at = now + self.config.inter_burst_delay;
                o.resend_deadline = now + self.config.resend_timeout;
                continue;
            }

            if o.cursor < o.plan.len() {
                if o.await_burst_ack {
                    if now >= o.resend_deadline {
                        // Burst ACK never came; resend the burst.
                        o.cursor = o.cursor.saturating_sub(self.config.burst_size);
                        o.await_burst_ack = false;
                    } else {
                        continue;
                    }
                }
                let n = self.config.burst_size.min(o.plan.len() - o.cursor);
                for chunk in &o.plan[o.cursor..o.cursor + n] {
                    out.push((o.dest, chunk.clone()));
                }
                o.cursor += n;
                o.next_burst_at = now + self.config.inter_burst_delay;
                o.resend_deadline = now + self.config.resend_timeout;
                if self.config.strategy == ReliabilityStrategy::Staged
                    && o.cursor < o.plan.len()
                {
                    o.await_burst_ack = true;
                }
            }
        }

        for id in gave_up {
            self.outgoing.remove(&id);
            self.failed.push(id);
            tracing::warn!(id = ?id, "envelope gave up after max attempts");
        }
        out
    }

    /// Process an ACK or NACK chunk addressed to this sender.
    pub fn on_control(&mut self, chunk: &Chunk, now: Instant) {
        let Some(o) = self.outgoing.get_mut(&chunk.id_prefix) else {
            return;
        };

        if chunk.flags.contains(ChunkFlags::ACK) {
            if chunk.sequence >= o.total {
                self.outgoing.remove(&chunk.id_prefix);
                self.completed.push(chunk.id_prefix);
            } else {
                // Burst-level progress (staged strategy).
                o.await_burst_ack = false;
                o.next_burst_at = now;
                o.resend_deadline = now + self.config.resend_timeout;
            }
        } else if chunk.flags.contains(ChunkFlags::NACK) {
            for seq in chunk.nack_seqs() {
                if seq >= 1 && seq <= o.total && !o.resend.contains(&seq) {
                    o.resend.push_back(seq);
                }
            }
            o.resend_deadline = now + self.config.resend_timeout;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.outgoing.len()
    }

    /// Drain the id prefixes of fully acknowledged envelopes.
    pub fn take_completed(&mut self) -> Vec<[u8; 8]> {
        std::mem::take(&mut self.completed)
    }

    /// Drain the id prefixes of envelopes that exhausted their attempts.
    pub fn take_failed(&mut self) -> Vec<[u8; 8]> {
        std::mem::take(&mut self.failed)
    }
}

/// Receive-side counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeStats {
    pub delivered: u64,
    pub duplicates_suppressed: u64,
    pub reassembly_timeouts: u64,
    pub decode_failures: u64,
}

/// Reassembles, inflates, decodes, and deduplicates inbound envelopes.
pub struct EnvelopeReceiver {
    config: EnvelopeConfig,
    reassembler: Reassembler,
    dedup: DedupCache,
    stats: EnvelopeStats,
    timeouts: Vec<[u8; 8]>,
}

impl EnvelopeReceiver {
    pub fn new(config: EnvelopeConfig) -> Self {
        let reassembler = Reassembler::new(config.reassembly_ttl, config.parity_window);
        let dedup = DedupCache::new(config.dedup_window);
        Self {
            config,
            reassembler,
            dedup,
            stats: EnvelopeStats::default(),
            timeouts: Vec::new(),
        }
    }

    /// Process one inbound data or parity chunk. Returns control replies
    /// for the sender plus, at most once per envelope, the decoded record.
    pub fn on_chunk(
        &mut self,
        src: NodeId,
        chunk: &Chunk,
        now: Instant,
    ) -> (Vec<Chunk>, Option<Envelope>) {
        let id = chunk.id_prefix;
        match self.reassembler.offer(src, chunk, now) {
            OfferOutcome::Completed(payload) => {
                let ack = Chunk::ack(id, chunk.total, chunk.total);
                match Envelope::decode(&payload) {
                    Ok(envelope) => {
                        if self.dedup.check_and_insert(envelope.dedupe_key(src)) {
                            self.stats.duplicates_suppressed += 1;
                            tracing::info!(
                                command = %envelope.command,
                                envelope_id = %envelope.id,
                                "duplicate envelope suppressed"
                            );
                            (vec![ack], None)
                        } else {
                            self.stats.delivered += 1;
                            (vec![ack], Some(envelope))
                        }
                    }
                    Err(err) => {
                        // Still ACK: the transfer itself succeeded, and
                        // retransmits cannot fix a malformed record.
                        self.stats.decode_failures += 1;
                        tracing::warn!(%err, "reassembled envelope failed to decode");
                        (vec![ack], None)
                    }
                }
            }
            OfferOutcome::Replay => {
                // The sender missed our ACK; repeat it.
                (vec![Chunk::ack(id, chunk.total, chunk.total)], None)
            }
            OfferOutcome::Stored => {
                if self.config.strategy == ReliabilityStrategy::Staged {
                    let received = self.reassembler.received_count(&id);
                    if received as usize % self.config.burst_size == 0 {
                        return (vec![Chunk::ack(id, received, chunk.total)], None);
                    }
                }
                (Vec::new(), None)
            }
            OfferOutcome::Duplicate | OfferOutcome::Invalid => (Vec::new(), None),
        }
    }

    /// Periodic maintenance: TTL sweep and, under the windowed strategy,
    /// NACKs for quiet gaps.
    pub fn on_tick(&mut self, now: Instant) -> Vec<(NodeId, Chunk)> {
        let mut out = Vec::new();

        if self.config.strategy == ReliabilityStrategy::Windowed {
            let cap = self.config.chunk_payload_size / 2;
            for (id, src, mut missing, total) in
                self.reassembler.stale_gaps(self.config.quiet_interval, now)
            {
                missing.truncate(cap);
                if !missing.is_empty() {
                    out.push((src, Chunk::nack(id, &missing, total)));
                }
            }
        }

        for (id, _src) in self.reassembler.sweep(now) {
            self.stats.reassembly_timeouts += 1;
            self.timeouts.push(id);
        }
        out
    }

    pub fn stats(&self) -> EnvelopeStats {
        self.stats
    }

    /// Drain envelopes abandoned by the TTL sweep.
    pub fn take_timeouts(&mut self) -> Vec<[u8; 8]> {
        std::mem::take(&mut self.timeouts)
    }

    pub fn partial_count(&self) -> usize {
        self.reassembler.partial_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    fn config(strategy: ReliabilityStrategy) -> EnvelopeConfig {
        EnvelopeConfig {
            strategy,
            inter_burst_delay: Duration::from_millis(100),
            resend_timeout: Duration::from_secs(2),
            ..EnvelopeConfig::default()
        }
    }

    fn big_request() -> Envelope {
        // Random-ish data so zlib cannot crush it below a few chunks.
        let data: Vec<u8> = (0..2000u32)
            .flat_map(|i| i.wrapping_mul(2654435761).to_le_bytes())
            .collect();
        Envelope::request("digest", Bytes::from(data))
    }

    #[test]
    fn bursts_respect_size_and_delay() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Simple));
        let now = Instant::now();
        let envelope = big_request();
        sender.enqueue(7, &envelope, now).unwrap();

        let first = sender.poll(now);
        assert!(!first.is_empty());
        assert!(first.len() <= 5);
        assert!(first.iter().all(|(dest, _)| *dest == 7));

        // Nothing more until the inter-burst delay elapses.
        assert!(sender.poll(now).is_empty());
        let second = sender.poll(now + Duration::from_millis(150));
        assert!(!second.is_empty());
        assert_ne!(first[0].1.sequence, second[0].1.sequence);
    }

    #[test]
    fn simple_strategy_completes_on_final_ack() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Simple));
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Simple));
        let mut now = Instant::now();
        let envelope = big_request();
        let id = sender.enqueue(7, &envelope, now).unwrap();

        let mut delivered = None;
        for _ in 0..100 {
            for (_, chunk) in sender.poll(now) {
                let (replies, env) = receiver.on_chunk(1, &chunk, now);
                if env.is_some() {
                    delivered = env;
                }
                for reply in replies {
                    sender.on_control(&reply, now);
                }
            }
            if sender.pending_count() == 0 {
                break;
            }
            now += Duration::from_millis(100);
        }

        assert_eq!(delivered.unwrap(), envelope);
        assert_eq!(sender.take_completed(), vec![id]);
        assert_eq!(receiver.stats().delivered, 1);
    }

    #[test]
    fn simple_strategy_retransmits_on_silence() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Simple));
        let now = Instant::now();
        let envelope = Envelope::request("echo", Bytes::from_static(b"ping"));
        sender.enqueue(7, &envelope, now).unwrap();

        let first = sender.poll(now);
        assert_eq!(first.len(), 1);
        // No ACK arrives; after the resend timeout the whole envelope
        // goes out again.
        let retry = sender.poll(now + Duration::from_secs(3));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].1, first[0].1);

        // Attempts are bounded.
        assert!(sender.poll(now + Duration::from_secs(6)).len() == 1);
        assert!(sender.poll(now + Duration::from_secs(9)).is_empty());
        assert_eq!(sender.take_failed().len(), 1);
        assert_eq!(sender.pending_count(), 0);
    }

    #[test]
    fn staged_strategy_waits_for_burst_acks() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Staged));
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Staged));
        let now = Instant::now();
        let envelope = big_request();
        sender.enqueue(7, &envelope, now).unwrap();

        let first = sender.poll(now);
        assert_eq!(first.len(), 5);
        // Without the burst ACK, the delay alone does not release more.
        assert!(sender.poll(now + Duration::from_millis(200)).is_empty());

        let mut acks = Vec::new();
        for (_, chunk) in &first {
            let (replies, _) = receiver.on_chunk(1, chunk, now);
            acks.extend(replies);
        }
        assert_eq!(acks.len(), 1, "one ACK per full burst");
        sender.on_control(&acks[0], now + Duration::from_millis(200));
        let second = sender.poll(now + Duration::from_millis(300));
        assert!(!second.is_empty());
    }

    #[test]
    fn windowed_strategy_resends_only_nacked() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Windowed));
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Windowed));
        let mut now = Instant::now();
        let envelope = big_request();
        sender.enqueue(7, &envelope, now).unwrap();

        // Transmit everything, dropping sequence 2 on the floor.
        let mut sent = 0;
        for _ in 0..40 {
            let batch = sender.poll(now);
            if batch.is_empty() && sent > 0 {
                break;
            }
            for (_, chunk) in batch {
                sent += 1;
                if chunk.sequence != 2 {
                    receiver.on_chunk(1, &chunk, now);
                }
            }
            now += Duration::from_millis(150);
        }
        assert_eq!(receiver.partial_count(), 1);

        // After the quiet interval the receiver NACKs exactly the gap.
        now += Duration::from_secs(3);
        let nacks = receiver.on_tick(now);
        assert_eq!(nacks.len(), 1);
        let (dest, nack) = &nacks[0];
        assert_eq!(*dest, 1);
        assert_eq!(nack.nack_seqs(), vec![2]);

        sender.on_control(nack, now);
        let resent = sender.poll(now);
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].1.sequence, 2);

        let (replies, env) = receiver.on_chunk(1, &resent[0].1, now);
        assert!(env.is_some());
        assert!(replies
            .iter()
            .any(|c| c.flags.contains(ChunkFlags::ACK)));
    }

    #[test]
    fn replayed_chunks_reacked_not_redelivered() {
        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Simple));
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Simple));
        let now = Instant::now();
        let envelope = Envelope::request("echo", Bytes::from_static(b"once"));
        sender.enqueue(7, &envelope, now).unwrap();
        let batch = sender.poll(now);
        assert_eq!(batch.len(), 1);
        let chunk = &batch[0].1;

        let (replies, env) = receiver.on_chunk(1, chunk, now);
        assert!(env.is_some());
        assert_eq!(replies.len(), 1);

        // The whole envelope arrives again (sender ACK-timeout path).
        let (replies, env) = receiver.on_chunk(1, chunk, now);
        assert!(env.is_none(), "replayed envelope must not re-deliver");
        assert_eq!(replies.len(), 1, "but it is re-acknowledged");
    }

    #[test]
    fn shared_dedupe_key_suppresses_second_delivery() {
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Simple));
        let now = Instant::now();

        // Two distinct envelopes (fresh ids, fresh id prefixes) that name
        // the same dedupe key are one logical message retried.
        let mut first = Envelope::request("spool", Bytes::from_static(b"payload"));
        first.meta.insert("dedupe_key".into(), "job-17".into());
        let mut second = Envelope::request("spool", Bytes::from_static(b"payload"));
        second.meta.insert("dedupe_key".into(), "job-17".into());
        assert_ne!(first.id_prefix(), second.id_prefix());

        let mut sender = EnvelopeSender::new(config(ReliabilityStrategy::Simple));
        sender.enqueue(7, &first, now).unwrap();
        sender.enqueue(7, &second, now).unwrap();

        let mut delivered = 0;
        for (_, chunk) in sender.poll(now) {
            let (_replies, env) = receiver.on_chunk(1, &chunk, now);
            if env.is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1, "handler side must see the message once");
        assert_eq!(receiver.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn reassembly_timeout_reported() {
        let mut receiver = EnvelopeReceiver::new(config(ReliabilityStrategy::Simple));
        let now = Instant::now();
        let chunk = Chunk::data(*b"orphan00", 1, 2, Bytes::from_static(b"half"));
        receiver.on_chunk(1, &chunk, now);
        assert_eq!(receiver.partial_count(), 1);

        receiver.on_tick(now + Duration::from_secs(121));
        assert_eq!(receiver.partial_count(), 0);
        assert_eq!(receiver.stats().reassembly_timeouts, 1);
        assert_eq!(receiver.take_timeouts(), vec![*b"orphan00"]);
    }
}
