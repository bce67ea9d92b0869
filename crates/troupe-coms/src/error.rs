use troupe_wire::WireError;

use crate::context::DirectoryError;

/// Errors that can occur in channel operations.
///
/// Cancellation, end-of-stream and receive timeouts are *not* errors: a
/// `receive()` reports them as `Ok(None)` and the channel's flags explain
/// which one happened.
#[derive(Debug, thiserror::Error)]
pub enum ComsError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] troupe_transport::TransportError),

    /// Wire-level I/O error.
    #[error("wire error: {0}")]
    Wire(WireError),

    /// A peer sent a message this protocol version cannot interpret.
    ///
    /// Non-recoverable: indicates a protocol or version mismatch and is
    /// never silently swallowed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// No reply arrived within the bound; the socket was destroyed.
    #[error("connection timed out on {0}")]
    ConnectionTimeout(String),

    /// A handshake never completed within the caller-specified time.
    #[error("synchronization timed out: {0}")]
    SynchronizationTimeout(String),

    /// The channel could not be created: name already registered or the
    /// addressed peer is absent.
    #[error("cannot create channel: {0}")]
    Creation(String),

    /// A second reply was attempted for the same request.
    #[error("a reply was already sent for this request")]
    AlreadyReplied,
}

impl From<WireError> for ComsError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::UnknownType(_) | WireError::Malformed(_) | WireError::Json(_) => {
                ComsError::Malformed(err.to_string())
            }
            other => ComsError::Wire(other),
        }
    }
}

impl From<DirectoryError> for ComsError {
    fn from(err: DirectoryError) -> Self {
        ComsError::Creation(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ComsError>;
