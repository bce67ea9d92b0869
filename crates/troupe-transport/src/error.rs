/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to a remote endpoint.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    /// The endpoint did not resolve to any address.
    #[error("endpoint '{0}' did not resolve")]
    Unresolvable(String),

    /// The port allocator has no port left to lease.
    #[error("no port available from the allocator")]
    NoPortAvailable,

    /// Generic I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
