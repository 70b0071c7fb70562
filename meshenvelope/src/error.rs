use thiserror::Error;

/// Errors surfaced by the envelope layer.
///
/// Envelope failures never close the radio: a timed-out reassembly or a
/// failed handler is reported to the command caller and the datagram path
/// keeps running.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("reassembly timed out for envelope {0}")]
    ReassemblyTimeout(String),

    /// Informational: a replayed envelope was acknowledged but suppressed.
    #[error("duplicate envelope suppressed: {0}")]
    DuplicateSuppressed(String),

    #[error("handler for command {command:?} failed: {message}")]
    HandlerFailed { command: String, message: String },

    #[error("no handler registered for command {0:?}")]
    UnknownCommand(String),

    #[error("malformed envelope record: {0}")]
    BadRecord(&'static str),

    #[error("envelope of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnvelopeError>;
