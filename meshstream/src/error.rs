use thiserror::Error;

/// Failures while decoding a datagram into a frame or chunk.
///
/// Decode errors never propagate past the demultiplexer: the offending
/// datagram is dropped, a counter is bumped, and the receive loop moves on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("declared payload length {declared} inconsistent with datagram of {actual} bytes")]
    BadLength { declared: usize, actual: usize },

    #[error("crc mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    BadCrc { stored: u32, computed: u32 },

    #[error("bad magic: 0x{0:02x}{1:02x}")]
    BadMagic(u8, u8),

    #[error("unsupported version: {0}")]
    BadVersion(u8),
}

/// Errors surfaced to stream API callers.
///
/// `WouldBlock` is recoverable (retry after ACKs advance the window); the
/// rest are terminal for that stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("send window full on stream {0}")]
    WouldBlock(u32),

    #[error("stream {0} is closed")]
    Closed(u32),

    #[error("stream {0} was reset by peer")]
    Reset(u32),

    #[error("stream {0} gave up after {1} retransmissions")]
    FatalLoss(u32, u32),

    #[error("operation timed out on stream {0}")]
    Timeout(u32),

    #[error("stream {0} not found")]
    NotFound(u32),

    #[error("invalid stream id: 0x{0:08x}")]
    InvalidStreamId(u32),

    #[error("maximum live streams ({0}) exceeded")]
    MaxStreamsExceeded(u32),

    #[error("payload of {size} bytes exceeds frame capacity of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("operation illegal in state {state} on stream {id}")]
    InvalidState { id: u32, state: &'static str },
}

/// Process-level transport errors.
///
/// `RadioBusy` is recoverable; `RadioDown` is latched until the adapter
/// delivers a successful send again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("radio adapter is down")]
    RadioDown,

    #[error("radio adapter egress is busy")]
    RadioBusy,

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl TransportError {
    /// Map to the process exit code contract: 0 normal, 1 configuration
    /// error, 2 radio unreachable, 3 fatal protocol error.
    pub fn exit_code(&self) -> i32 {
        match self {
            TransportError::ConfigInvalid(_) => 1,
            TransportError::RadioDown | TransportError::RadioBusy => 2,
            TransportError::Stream(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
