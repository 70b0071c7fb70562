//! End-to-end transport scenarios over a faulty in-memory link: clean
//! echo, heavy uniform loss, reordering, and mid-stream reset. Time is
//! virtual -- the harness advances a synthetic clock and drives both
//! multiplexers' tick/pump/inbound entry points directly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshstream::radio::{LinkFaults, PairedRadio};
use meshstream::{Multiplexer, StreamConfig, StreamId, StreamState};

const STEP: Duration = Duration::from_millis(50);

struct Net {
    ma: Multiplexer,
    mb: Multiplexer,
    ra: Arc<PairedRadio>,
    rb: Arc<PairedRadio>,
    now: Instant,
}

impl Net {
    fn new(config: StreamConfig, faults: LinkFaults) -> Self {
        let now = Instant::now();
        let (ra, rb) = PairedRadio::pair(1, 2, 256, faults);
        let (ra, rb) = (Arc::new(ra), Arc::new(rb));
        let ma = Multiplexer::new(config.clone(), ra.clone(), now).unwrap();
        let mb = Multiplexer::new(config, rb.clone(), now).unwrap();
        Self { ma, mb, ra, rb, now }
    }

    /// Advance the virtual clock one step and service both sides.
    fn step(&mut self) {
        self.now += STEP;
        self.ma.on_tick(self.now);
        self.mb.on_tick(self.now);
        self.ma.pump(self.now);
        self.mb.pump(self.now);
        while let Some((src, dg)) = self.ra.recv() {
            self.ma.handle_datagram(src, &dg, self.now);
        }
        while let Some((src, dg)) = self.rb.recv() {
            self.mb.handle_datagram(src, &dg, self.now);
        }
    }

    fn run_until(&mut self, max_steps: usize, mut done: impl FnMut(&mut Net) -> bool) {
        for _ in 0..max_steps {
            if done(self) {
                return;
            }
            self.step();
        }
        panic!("scenario did not converge within {max_steps} steps");
    }

    fn establish(&mut self) -> StreamId {
        let sid = self.ma.open(2, self.now).unwrap();
        self.run_until(1000, |net| {
            net.ma.stream_state(sid) == Some(StreamState::Established)
                && net.mb.stream_state(sid) == Some(StreamState::Established)
        });
        sid
    }
}

fn lossy_config() -> StreamConfig {
    StreamConfig {
        retransmit_timeout: Duration::from_millis(200),
        nack_delay: Duration::from_millis(100),
        max_retransmits: 15,
        pacing_rate: 10_000.0,
        pacing_burst: 128,
        ..StreamConfig::default()
    }
}

fn drain_stream(mux: &mut Multiplexer, sid: StreamId, into: &mut Vec<u8>) {
    while let Ok(Some(chunk)) = mux.recv(sid) {
        into.extend_from_slice(&chunk);
    }
}

#[test]
fn clean_echo() {
    let mut net = Net::new(lossy_config(), LinkFaults::none());
    let sid = net.establish();

    net.ma.send(sid, b"hello", net.now).unwrap();
    let mut echoed = Vec::new();
    net.run_until(1000, |net| {
        // Gateway echoes whatever arrives.
        let mut buf = Vec::new();
        drain_stream(&mut net.mb, sid, &mut buf);
        if !buf.is_empty() {
            net.mb.send(sid, &buf, net.now).unwrap();
        }
        drain_stream(&mut net.ma, sid, &mut echoed);
        echoed == b"hello"
    });

    net.ma.close(sid, net.now).unwrap();
    net.run_until(1000, |net| net.mb.is_eof(sid));
    net.mb.close(sid, net.now).unwrap();
    net.run_until(1000, |net| {
        net.ma.stream_count() == 0 && net.mb.stream_count() == 0
    });

    assert_eq!(net.ma.stats().rsts_sent, 0);
    assert_eq!(net.mb.stats().rsts_sent, 0);
    assert_eq!(net.ma.stats().fatal_losses, 0);
}

#[test]
fn half_loss_delivers_ten_kilobytes_in_order() {
    let faults = LinkFaults {
        drop_rate: 0.5,
        seed: 0x5EED,
        ..LinkFaults::none()
    };
    let mut net = Net::new(lossy_config(), faults);
    let sid = net.establish();

    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let mut offset = 0;
    let mut received = Vec::new();

    net.run_until(20_000, |net| {
        if offset < payload.len() {
            if let Ok(n) = net.ma.send(sid, &payload[offset..], net.now) {
                offset += n;
            }
        }
        drain_stream(&mut net.mb, sid, &mut received);
        received.len() == payload.len()
    });

    assert_eq!(received, payload, "bytes must arrive in order, no gaps");
    assert!(
        net.ma.stats().retransmits > 0,
        "half the frames were dropped; retransmission must have fired"
    );
    assert_eq!(net.ma.stats().fatal_losses, 0);
}

#[test]
fn reordered_link_delivers_in_order() {
    let faults = LinkFaults {
        reorder: true,
        seed: 7,
        ..LinkFaults::none()
    };
    let mut net = Net::new(lossy_config(), faults);
    let sid = net.establish();

    let payload: Vec<u8> = (0..2048).map(|i| (i % 197) as u8).collect();
    let mut offset = 0;
    let mut received = Vec::new();

    net.run_until(5000, |net| {
        if offset < payload.len() {
            if let Ok(n) = net.ma.send(sid, &payload[offset..], net.now) {
                offset += n;
            }
        }
        drain_stream(&mut net.mb, sid, &mut received);
        received.len() == payload.len()
    });

    assert_eq!(received, payload);
    assert_eq!(net.ma.stats().fatal_losses, 0);
    assert_eq!(net.mb.stats().fatal_losses, 0);
}

#[test]
fn duplicating_link_delivers_exactly_once() {
    let faults = LinkFaults {
        dup_rate: 0.4,
        seed: 11,
        ..LinkFaults::none()
    };
    let mut net = Net::new(lossy_config(), faults);
    let sid = net.establish();

    let payload: Vec<u8> = (0..4096).map(|i| (i % 83) as u8).collect();
    let mut offset = 0;
    let mut received = Vec::new();

    net.run_until(5000, |net| {
        if offset < payload.len() {
            if let Ok(n) = net.ma.send(sid, &payload[offset..], net.now) {
                offset += n;
            }
        }
        drain_stream(&mut net.mb, sid, &mut received);
        received.len() >= payload.len()
    });

    // Exactly once: duplicates are absorbed, never re-delivered.
    assert_eq!(received, payload);
}

#[test]
fn rst_mid_stream_closes_both_sides() {
    let mut net = Net::new(lossy_config(), LinkFaults::none());
    let sid = net.establish();

    let kilobyte = vec![0xA5u8; 1024];
    let mut offset = 0;
    let mut received = Vec::new();
    net.run_until(1000, |net| {
        if offset < kilobyte.len() {
            if let Ok(n) = net.ma.send(sid, &kilobyte[offset..], net.now) {
                offset += n;
            }
        }
        drain_stream(&mut net.mb, sid, &mut received);
        received.len() == kilobyte.len()
    });

    net.ma.reset(sid);
    net.run_until(1000, |net| {
        net.ma.stream_count() == 0 && net.mb.stream_count() == 0
    });

    // Resetting again is a no-op on an already-gone stream.
    net.ma.reset(sid);
    assert_eq!(net.ma.stream_count(), 0);
}

#[test]
fn loss_and_reorder_combined() {
    let faults = LinkFaults {
        drop_rate: 0.2,
        dup_rate: 0.1,
        reorder: true,
        seed: 42,
    };
    let mut net = Net::new(lossy_config(), faults);
    let sid = net.establish();

    let payload: Vec<u8> = (0..4096).map(|i| (i % 111) as u8).collect();
    let mut offset = 0;
    let mut received = Vec::new();

    net.run_until(20_000, |net| {
        if offset < payload.len() {
            if let Ok(n) = net.ma.send(sid, &payload[offset..], net.now) {
                offset += n;
            }
        }
        drain_stream(&mut net.mb, sid, &mut received);
        received.len() == payload.len()
    });

    assert_eq!(received, payload);
    assert_eq!(net.ma.stats().fatal_losses, 0);
}
