/// Errors that can occur while framing or parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// I/O error from the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid magic bytes — stream is out of sync.
    #[error("invalid frame magic")]
    InvalidMagic,

    /// Frame payload exceeds the configured maximum.
    #[error("frame payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The envelope carried an unknown type code.
    ///
    /// Indicates a protocol or version mismatch between peers; never
    /// silently ignored.
    #[error("unknown envelope type code {0}")]
    UnknownType(u64),

    /// The envelope failed to parse into the expected shape.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    /// True if this is a transient read timeout rather than a fault.
    ///
    /// Poll loops use this to keep waiting when the socket read timeout
    /// elapses without data.
    pub fn is_poll_timeout(&self) -> bool {
        matches!(
            self,
            WireError::Io(err) if matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
