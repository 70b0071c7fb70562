//! Cooperative event-loop driver.
//!
//! One task services everything: inbound datagrams arrive on an mpsc
//! channel, retransmit timers and idle sweeps run off the multiplexer's
//! `next_wakeup`, and the outbound scheduler drains to the radio under
//! the pacer. All shared state sits behind a single mutex, so API calls
//! through `TransportHandle` interleave safely with the loop.
//!
//! Blocking operations (`send_all`, `recv_some`) park on a progress
//! notifier and accept an optional deadline; dropping the returned future
//! cancels the wait and leaves the stream state untouched.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::config::StreamConfig;
use crate::error::{StreamError, TransportError};
use crate::mux::{Multiplexer, StreamId, TransportStats};
use crate::radio::{NodeId, RadioLink};
use crate::stream::StreamState;

/// Fallback service cadence when no timer or pacer deadline is nearer.
const TICK: Duration = Duration::from_millis(100);

struct Shared {
    mux: Mutex<Multiplexer>,
    /// Signalled whenever inbound processing may have made progress
    /// (ACKs advanced a window, data arrived, a stream changed state).
    progress: Notify,
    /// Signalled by API calls that queue new outbound work.
    kick: Notify,
}

/// The event loop. Run it to completion on the runtime; it exits when all
/// inbound senders are dropped.
pub struct Driver {
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<(NodeId, Bytes)>,
}

/// Cloneable API surface onto a running transport.
#[derive(Clone)]
pub struct TransportHandle {
    shared: Arc<Shared>,
}

impl Driver {
    /// Build a transport. Returns the driver future holder, the API
    /// handle, and the sender the radio adapter feeds inbound datagrams
    /// into (one datagram per send).
    pub fn new(
        config: StreamConfig,
        radio: Arc<dyn RadioLink>,
    ) -> Result<(Driver, TransportHandle, mpsc::Sender<(NodeId, Bytes)>), TransportError> {
        let mux = Multiplexer::new(config, radio, Instant::now())?;
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::new(Shared {
            mux: Mutex::new(mux),
            progress: Notify::new(),
            kick: Notify::new(),
        });
        let driver = Driver {
            shared: shared.clone(),
            inbound: rx,
        };
        Ok((driver, TransportHandle { shared }, tx))
    }

    pub async fn run(mut self) {
        loop {
            let wakeup = {
                let mut mux = self.shared.mux.lock();
                let now = Instant::now();
                mux.on_tick(now);
                mux.pump(now);
                mux.next_wakeup(now)
            };
            self.shared.progress.notify_waiters();

            let now = Instant::now();
            let sleep_for = wakeup
                .map(|t| t.saturating_duration_since(now))
                .unwrap_or(TICK)
                .min(TICK);

            tokio::select! {
                received = self.inbound.recv() => {
                    let Some((src, datagram)) = received else {
                        // All inbound senders gone: the radio adapter shut
                        // down, so does the loop.
                        break;
                    };
                    let mut mux = self.shared.mux.lock();
                    let now = Instant::now();
                    mux.handle_datagram(src, &datagram, now);
                    while let Ok((src, datagram)) = self.inbound.try_recv() {
                        mux.handle_datagram(src, &datagram, now);
                    }
                }
                _ = self.shared.kick.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

impl TransportHandle {
    /// Open an active stream to `peer`.
    pub fn open(&self, peer: NodeId) -> Result<StreamId, TransportError> {
        let id = self.shared.mux.lock().open(peer, Instant::now())?;
        self.shared.kick.notify_one();
        Ok(id)
    }

    /// Non-blocking send; returns bytes accepted.
    pub fn try_send(&self, id: StreamId, data: &[u8]) -> Result<usize, TransportError> {
        let accepted = self.shared.mux.lock().send(id, data, Instant::now())?;
        self.shared.kick.notify_one();
        Ok(accepted)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self, id: StreamId) -> Result<Option<Bytes>, TransportError> {
        self.shared.mux.lock().recv(id)
    }

    /// Graceful close; idempotent.
    pub fn close(&self, id: StreamId) -> Result<(), TransportError> {
        let result = self.shared.mux.lock().close(id, Instant::now());
        self.shared.kick.notify_one();
        result
    }

    pub fn state(&self, id: StreamId) -> Option<StreamState> {
        self.shared.mux.lock().stream_state(id)
    }

    pub fn is_eof(&self, id: StreamId) -> bool {
        self.shared.mux.lock().is_eof(id)
    }

    /// Drain the ids of passively accepted streams.
    pub fn take_accepted(&self) -> Vec<StreamId> {
        self.shared.mux.lock().take_accepted()
    }

    /// Park until a passive stream is accepted, or the deadline.
    pub async fn next_accepted(
        &self,
        deadline: Option<Instant>,
    ) -> Result<StreamId, TransportError> {
        loop {
            if let Some(id) = self.shared.mux.lock().pop_accepted() {
                return Ok(id);
            }
            self.wait_progress(0, deadline).await?;
        }
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.mux.lock().stats()
    }

    /// Send the whole buffer, parking while the window is full.
    pub async fn send_all(
        &self,
        id: StreamId,
        data: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        let mut offset = 0;
        while offset < data.len() {
            let attempt = {
                let mut mux = self.shared.mux.lock();
                mux.send(id, &data[offset..], Instant::now())
            };
            match attempt {
                Ok(n) => {
                    offset += n;
                    self.shared.kick.notify_one();
                    continue;
                }
                Err(TransportError::Stream(StreamError::WouldBlock(_))) => {
                    self.wait_progress(id, deadline).await?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Receive the next payload, parking until data, EOF (`Ok(None)`), or
    /// the deadline.
    pub async fn recv_some(
        &self,
        id: StreamId,
        deadline: Option<Instant>,
    ) -> Result<Option<Bytes>, TransportError> {
        loop {
            {
                let mut mux = self.shared.mux.lock();
                match mux.recv(id) {
                    Ok(Some(data)) => return Ok(Some(data)),
                    Ok(None) => {
                        if mux.is_eof(id) {
                            return Ok(None);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            self.wait_progress(id, deadline).await?;
        }
    }

    async fn wait_progress(
        &self,
        id: StreamId,
        deadline: Option<Instant>,
    ) -> Result<(), TransportError> {
        let notified = self.shared.progress.notified();
        match deadline {
            Some(d) => {
                let timeout = d.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = notified => Ok(()),
                    _ = tokio::time::sleep(timeout) => {
                        Err(StreamError::Timeout(id).into())
                    }
                }
            }
            None => {
                notified.await;
                Ok(())
            }
        }
    }
}
