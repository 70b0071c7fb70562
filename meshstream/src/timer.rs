//! Retransmit timer: a monotonic min-heap of per-frame deadlines.
//!
//! Entries are `(deadline, stream_id, seq, generation)`. Cancellation is
//! lazy: an acknowledged or re-armed frame leaves its stale entry in the
//! heap, and the owning stream discards the fire by generation check.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Instant;

/// Identifies the frame a deadline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    pub stream_id: u32,
    pub seq: u32,
    pub generation: u64,
}

#[derive(Debug)]
struct TimerEntry {
    deadline: Instant,
    key: TimerKey,
}

// BinaryHeap is a max-heap; reverse the ordering so the earliest deadline
// pops first.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// Min-heap of retransmit deadlines shared by all streams.
pub struct RetransmitTimer {
    heap: BinaryHeap<TimerEntry>,
}

impl RetransmitTimer {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Arm a deadline for the given frame.
    pub fn arm(&mut self, deadline: Instant, key: TimerKey) {
        self.heap.push(TimerEntry { deadline, key });
    }

    /// Pop every entry whose deadline has passed.
    ///
    /// Stale entries (acknowledged or re-armed frames) are included; the
    /// caller filters them by generation.
    pub fn poll_expired(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut fired = Vec::new();
        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            fired.push(self.heap.pop().expect("peeked entry").key);
        }
        fired
    }

    /// Earliest pending deadline, for the driver's sleep.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.deadline)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl Default for RetransmitTimer {
    fn default() -> Self {
        Self::new()
    }
}
