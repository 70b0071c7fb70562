//! Radio adapter seam.
//!
//! The core treats the mesh radio as an opaque datagram port: `send` one
//! datagram to a node, receive datagrams one per delivery. The radio may
//! drop, reorder, duplicate, or delay; it never fragments, because every
//! frame fits one datagram by construction.
//!
//! `RadioSupervisor` wraps an adapter with the failure policy: transient
//! errors retry with backoff, and after enough consecutive failures the
//! radio is latched down until a send succeeds again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use rand::{RngExt, SeedableRng};

/// Mesh node address.
pub type NodeId = u32;

/// Immediate result of handing one datagram to the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Egress queue full; try again shortly.
    Busy,
    /// The adapter reported a hard send error.
    Failed,
}

/// The datagram port the transport core consumes.
pub trait RadioLink: Send + Sync {
    fn send(&self, dest: NodeId, datagram: &[u8]) -> SendOutcome;
}

/// Failure-policy wrapper around a `RadioLink`.
pub struct RadioSupervisor {
    link: Arc<dyn RadioLink>,
    max_failures: u32,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
    down: bool,
}

impl RadioSupervisor {
    pub fn new(link: Arc<dyn RadioLink>, max_failures: u32) -> Self {
        Self {
            link,
            max_failures,
            consecutive_failures: 0,
            retry_after: None,
            down: false,
        }
    }

    /// Send one datagram, applying retry backoff and the down latch.
    pub fn send(&mut self, dest: NodeId, datagram: &[u8], now: Instant) -> SendOutcome {
        if let Some(t) = self.retry_after {
            if now < t {
                return SendOutcome::Busy;
            }
        }
        match self.link.send(dest, datagram) {
            SendOutcome::Sent => {
                if self.down {
                    tracing::info!(dest, "radio recovered");
                }
                self.consecutive_failures = 0;
                self.retry_after = None;
                self.down = false;
                SendOutcome::Sent
            }
            SendOutcome::Busy => SendOutcome::Busy,
            SendOutcome::Failed => {
                self.consecutive_failures += 1;
                let backoff = Duration::from_millis(
                    250u64.saturating_mul(1 << self.consecutive_failures.min(5)),
                );
                self.retry_after = Some(now + backoff);
                if self.consecutive_failures >= self.max_failures && !self.down {
                    tracing::warn!(
                        failures = self.consecutive_failures,
                        "radio latched down after consecutive send failures"
                    );
                    self.down = true;
                }
                SendOutcome::Failed
            }
        }
    }

    /// `true` while the radio is latched down; admits fail with
    /// `RadioDown` until a send succeeds again.
    pub fn is_down(&self) -> bool {
        self.down
    }
}

/// In-process loopback adapter: every sent datagram is delivered back to
/// the same node. Used for simulation and single-node smoke tests.
pub struct LoopbackRadio {
    node: NodeId,
    inbox: Arc<ArrayQueue<(NodeId, Bytes)>>,
}

impl LoopbackRadio {
    pub fn new(node: NodeId, capacity: usize) -> Self {
        Self {
            node,
            inbox: Arc::new(ArrayQueue::new(capacity)),
        }
    }

    /// Pop one delivered datagram, if any.
    pub fn recv(&self) -> Option<(NodeId, Bytes)> {
        self.inbox.pop()
    }
}

impl RadioLink for LoopbackRadio {
    fn send(&self, _dest: NodeId, datagram: &[u8]) -> SendOutcome {
        match self
            .inbox
            .push((self.node, Bytes::copy_from_slice(datagram)))
        {
            Ok(()) => SendOutcome::Sent,
            Err(_) => SendOutcome::Busy,
        }
    }
}

/// Fault model for the paired in-memory link.
#[derive(Debug, Clone, Copy)]
pub struct LinkFaults {
    /// Probability a datagram is silently dropped.
    pub drop_rate: f64,
    /// Probability a delivered datagram is delivered twice.
    pub dup_rate: f64,
    /// Hold back every other datagram one slot, swapping pair order.
    pub reorder: bool,
    /// Seed for the fault RNG, so lossy tests are reproducible.
    pub seed: u64,
}

impl LinkFaults {
    pub fn none() -> Self {
        Self {
            drop_rate: 0.0,
            dup_rate: 0.0,
            reorder: false,
            seed: 0,
        }
    }
}

/// One endpoint of an in-memory two-node link with configurable faults.
///
/// `pair` wires two endpoints back to back: what one sends lands in the
/// other's inbox, subject to the fault model. A full inbox reports Busy,
/// which is how egress backpressure is exercised in tests.
pub struct PairedRadio {
    node: NodeId,
    inbox: Arc<ArrayQueue<(NodeId, Bytes)>>,
    peer_inbox: Arc<ArrayQueue<(NodeId, Bytes)>>,
    faults: LinkFaults,
    rng: Mutex<rand::rngs::StdRng>,
    held: Mutex<Option<(NodeId, Bytes)>>,
}

impl PairedRadio {
    pub fn pair(a: NodeId, b: NodeId, capacity: usize, faults: LinkFaults) -> (Self, Self) {
        let inbox_a = Arc::new(ArrayQueue::new(capacity));
        let inbox_b = Arc::new(ArrayQueue::new(capacity));
        let left = Self {
            node: a,
            inbox: inbox_a.clone(),
            peer_inbox: inbox_b.clone(),
            faults,
            rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(faults.seed)),
            held: Mutex::new(None),
        };
        let right = Self {
            node: b,
            inbox: inbox_b,
            peer_inbox: inbox_a,
            faults,
            rng: Mutex::new(rand::rngs::StdRng::seed_from_u64(faults.seed.wrapping_add(1))),
            held: Mutex::new(None),
        };
        (left, right)
    }

    /// Pop one delivered datagram, if any.
    pub fn recv(&self) -> Option<(NodeId, Bytes)> {
        self.inbox.pop()
    }

    fn deliver(&self, datagram: Bytes) -> SendOutcome {
        let dup = {
            let mut rng = self.rng.lock();
            self.faults.dup_rate > 0.0 && rng.random::<f64>() < self.faults.dup_rate
        };
        if self.peer_inbox.push((self.node, datagram.clone())).is_err() {
            return SendOutcome::Busy;
        }
        if dup {
            // Best effort: a full queue just loses the duplicate.
            let _ = self.peer_inbox.push((self.node, datagram));
        }
        SendOutcome::Sent
    }
}

impl RadioLink for PairedRadio {
    fn send(&self, _dest: NodeId, datagram: &[u8]) -> SendOutcome {
        let dropped = {
            let mut rng = self.rng.lock();
            self.faults.drop_rate > 0.0 && rng.random::<f64>() < self.faults.drop_rate
        };
        if dropped {
            tracing::trace!(node = self.node, len = datagram.len(), "link dropped datagram");
            return SendOutcome::Sent;
        }

        let datagram = Bytes::copy_from_slice(datagram);
        if !self.faults.reorder {
            return self.deliver(datagram);
        }

        // Reorder: hold back every other datagram and emit the pair swapped.
        let swap = {
            let mut held = self.held.lock();
            match held.take() {
                None => {
                    *held = Some((self.node, datagram.clone()));
                    None
                }
                Some((_, earlier)) => Some(earlier),
            }
        };
        match swap {
            None => SendOutcome::Sent,
            Some(earlier) => {
                let first = self.deliver(datagram);
                if first != SendOutcome::Sent {
                    return first;
                }
                self.deliver(earlier)
            }
        }
    }
}
