//! Error types for setu

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// setu error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Carrier negotiation failed (carrier mismatch or unreachable contact)
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Malformed frame or wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Payload serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Blocking operation exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// Port is interrupted; operation returned without blocking
    #[error("Port interrupted")]
    Interrupted,

    /// Port is closed or closing
    #[error("Port closed")]
    Closed,

    /// Port name already bound or malformed
    #[error("Name error: {0}")]
    Name(String),

    /// API misuse (reply without pending request, double open, ...)
    #[error("Misuse: {0}")]
    Misuse(String),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that indicate the peer went away rather than a
    /// local fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}
