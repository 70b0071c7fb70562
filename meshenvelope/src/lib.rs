//! MeshEnvelope -- request/response envelopes over lossy mesh datagrams.
//!
//! The second reliability tier of the mesh bridge: self-describing
//! command envelopes, serialized as compact key-value records, zlib
//! compressed, split into 16-byte-header chunks, and reassembled with a
//! choice of reliability strategies (single-ACK, staged bursts,
//! selective NACK, or XOR parity windows). Completed envelopes are
//! deduplicated before handler dispatch.
//!
//! This wire does not interoperate with the `meshstream` frame format; a
//! deployment picks one. Envelopes can also ride a single `meshstream`
//! stream via the length-prefix helpers in `framing`.

pub mod chunk;
pub mod config;
pub mod dedup;
pub mod endpoint;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod handler;
pub mod parity;
pub mod reassembly;
pub mod service;

// Re-export key public types at crate root.
pub use chunk::{Chunk, ChunkFlags, CHUNK_HEADER_LEN};
pub use config::{EnvelopeConfig, ReliabilityStrategy};
pub use dedup::DedupCache;
pub use endpoint::EnvelopeEndpoint;
pub use envelope::{DedupKey, Envelope, EnvelopeKind};
pub use error::{EnvelopeError, Result};
pub use handler::{CommandHandler, HandlerRegistry};
pub use reassembly::{OfferOutcome, Reassembler};
pub use service::{EnvelopeReceiver, EnvelopeSender, EnvelopeStats};
