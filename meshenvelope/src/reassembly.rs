//! Chunk reassembly.
//!
//! Partial envelopes are indexed by the 8-byte id prefix. Each tracks the
//! set of received data chunks, any parity chunks, and the arrival
//! clock for TTL eviction and NACK pacing. Delivery happens exactly once,
//! when every data sequence is present or recoverable; chunks of a
//! recently completed envelope are ignored without state change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};

use meshstream::radio::NodeId;

use crate::chunk::{Chunk, ChunkFlags};
use crate::parity::{recover, window_count, window_range};

/// Remembered completed envelopes, so replayed chunks stay inert.
const COMPLETED_MEMORY: usize = 1024;

/// Outcome of offering one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferOutcome {
    /// All data sequences present (or recovered); the reassembled
    /// compressed envelope payload.
    Completed(Bytes),
    /// Accepted; the envelope is still incomplete.
    Stored,
    /// This sequence was already held; no state change.
    Duplicate,
    /// The envelope completed recently; no state change.
    Replay,
    /// Nonsense geometry (zero total, sequence out of range, total
    /// mismatch); dropped.
    Invalid,
}

struct Partial {
    src: NodeId,
    total: u16,
    chunks: HashMap<u16, Bytes>,
    /// Window index -> parity payload.
    parity: HashMap<u16, Bytes>,
    first_seen: Instant,
    last_chunk_at: Instant,
    nack_deferred_at: Option<Instant>,
}

impl Partial {
    fn missing(&self) -> Vec<u16> {
        (1..=self.total)
            .filter(|seq| !self.chunks.contains_key(seq))
            .collect()
    }
}

pub struct Reassembler {
    ttl: Duration,
    parity_window: u16,
    partials: HashMap<[u8; 8], Partial>,
    completed: HashSet<[u8; 8]>,
    completed_order: VecDeque<[u8; 8]>,
}

impl Reassembler {
    pub fn new(ttl: Duration, parity_window: u16) -> Self {
        Self {
            ttl,
            parity_window: parity_window.max(1),
            partials: HashMap::new(),
            completed: HashSet::new(),
            completed_order: VecDeque::new(),
        }
    }

    /// Offer one data or parity chunk.
    pub fn offer(&mut self, src: NodeId, chunk: &Chunk, now: Instant) -> OfferOutcome {
        if self.completed.contains(&chunk.id_prefix) {
            return OfferOutcome::Replay;
        }
        if chunk.total == 0 {
            return OfferOutcome::Invalid;
        }
        let is_parity = chunk.flags.contains(ChunkFlags::PARITY);
        let max_seq = if is_parity {
            window_count(chunk.total, self.parity_window)
        } else {
            chunk.total
        };
        if chunk.sequence == 0 || chunk.sequence > max_seq {
            return OfferOutcome::Invalid;
        }

        let partial = self
            .partials
            .entry(chunk.id_prefix)
            .or_insert_with(|| Partial {
                src,
                total: chunk.total,
                chunks: HashMap::new(),
                parity: HashMap::new(),
                first_seen: now,
                last_chunk_at: now,
                nack_deferred_at: None,
            });
        if partial.total != chunk.total {
            tracing::debug!(
                id = ?chunk.id_prefix,
                stored = partial.total,
                got = chunk.total,
                "chunk total mismatch; dropped"
            );
            return OfferOutcome::Invalid;
        }

        let slot = if is_parity {
            &mut partial.parity
        } else {
            &mut partial.chunks
        };
        if slot.contains_key(&chunk.sequence) {
            return OfferOutcome::Duplicate;
        }
        slot.insert(chunk.sequence, chunk.payload.clone());
        partial.last_chunk_at = now;

        Self::recover_from_parity(partial, self.parity_window);

        if partial.chunks.len() == partial.total as usize {
            let partial = self
                .partials
                .remove(&chunk.id_prefix)
                .expect("partial just updated");
            let mut payload = BytesMut::new();
            for seq in 1..=partial.total {
                payload.extend_from_slice(&partial.chunks[&seq]);
            }
            self.remember_completed(chunk.id_prefix);
            OfferOutcome::Completed(payload.freeze())
        } else {
            OfferOutcome::Stored
        }
    }

    /// Fill any window that is complete-except-one and has its parity.
    fn recover_from_parity(partial: &mut Partial, k: u16) {
        for (&index, parity) in &partial.parity {
            let range = window_range(index, k, partial.total);
            let missing: Vec<u16> = range
                .clone()
                .filter(|seq| !partial.chunks.contains_key(seq))
                .collect();
            if let [lost] = missing[..] {
                let survivors = range.filter_map(|seq| partial.chunks.get(&seq));
                let recovered = recover(parity, survivors);
                tracing::debug!(seq = lost, "recovered chunk from parity window");
                partial.chunks.insert(lost, recovered);
            }
        }
    }

    fn remember_completed(&mut self, id: [u8; 8]) {
        if self.completed.insert(id) {
            self.completed_order.push_back(id);
            while self.completed.len() > COMPLETED_MEMORY {
                if let Some(old) = self.completed_order.pop_front() {
                    self.completed.remove(&old);
                }
            }
        }
    }

    /// Chunks held for an in-progress envelope.
    pub fn received_count(&self, id: &[u8; 8]) -> u16 {
        self.partials
            .get(id)
            .map(|p| p.chunks.len() as u16)
            .unwrap_or(0)
    }

    pub fn missing(&self, id: &[u8; 8]) -> Vec<u16> {
        self.partials.get(id).map(|p| p.missing()).unwrap_or_default()
    }

    pub fn partial_count(&self) -> usize {
        self.partials.len()
    }

    /// Evict partials older than the TTL; returns the abandoned
    /// envelopes for upper-layer timeout reporting.
    pub fn sweep(&mut self, now: Instant) -> Vec<([u8; 8], NodeId)> {
        let ttl = self.ttl;
        let expired: Vec<[u8; 8]> = self
            .partials
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.first_seen) > ttl)
            .map(|(&id, _)| id)
            .collect();
        expired
            .into_iter()
            .map(|id| {
                let partial = self.partials.remove(&id).expect("listed partial");
                tracing::debug!(id = ?id, held = partial.chunks.len(), "reassembly expired");
                (id, partial.src)
            })
            .collect()
    }

    /// Partials whose newest chunk is older than `quiet`, for NACK
    /// generation. Each returned partial has its NACK clock reset so one
    /// quiet interval yields one NACK.
    pub fn stale_gaps(
        &mut self,
        quiet: Duration,
        now: Instant,
    ) -> Vec<([u8; 8], NodeId, Vec<u16>, u16)> {
        let mut out = Vec::new();
        for (&id, partial) in &mut self.partials {
            let since_chunk = now.saturating_duration_since(partial.last_chunk_at);
            if since_chunk < quiet {
                continue;
            }
            if let Some(deferred) = partial.nack_deferred_at {
                if now.saturating_duration_since(deferred) < quiet {
                    continue;
                }
            }
            partial.nack_deferred_at = Some(now);
            out.push((id, partial.src, partial.missing(), partial.total));
        }
        out
    }
}
