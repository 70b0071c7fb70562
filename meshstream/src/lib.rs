//! MeshStream -- reliable multiplexed byte streams over a lossy LoRa mesh.
//!
//! The radio delivers small datagrams best-effort: they drop, reorder,
//! and duplicate, but never fragment. On top of that this crate provides
//! connection-oriented streams with in-order delivery, retransmission,
//! selective NACKs, sliding-window flow control, CRC integrity, and
//! dedup, multiplexed by `stream_id` under a shared airtime budget.

pub mod config;
pub mod driver;
pub mod error;
pub mod frame;
pub mod mux;
pub mod pacing;
pub mod radio;
pub mod seq;
pub mod stream;
pub mod timer;
pub mod window;

// Re-export key public types at crate root.
pub use config::StreamConfig;
pub use driver::{Driver, TransportHandle};
pub use error::{DecodeError, Result, StreamError, TransportError};
pub use frame::{Frame, FrameFlags, MTU_PAYLOAD};
pub use mux::{Multiplexer, StreamId, TransportStats};
pub use radio::{LinkFaults, LoopbackRadio, NodeId, PairedRadio, RadioLink, SendOutcome};
pub use stream::{CloseCause, Stream, StreamState};
