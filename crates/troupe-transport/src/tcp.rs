use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Result, TransportError};

/// Connect to a remote endpoint (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<TcpStream> {
    let stream = TcpStream::connect(endpoint.addr()).map_err(|source| TransportError::Connect {
        endpoint: endpoint.to_string(),
        source,
    })?;
    configure(&stream, endpoint)?;
    Ok(stream)
}

/// Connect to a remote endpoint with a bound on the connect itself.
pub fn connect_timeout(endpoint: &Endpoint, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    let addrs = endpoint
        .addr()
        .to_socket_addrs()
        .map_err(|source| TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        })?;

    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                configure(&stream, endpoint)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    match last_err {
        Some(source) => Err(TransportError::Connect {
            endpoint: endpoint.to_string(),
            source,
        }),
        None => Err(TransportError::Unresolvable(endpoint.to_string())),
    }
}

/// Apply read/write timeouts to a stream. `None` means block forever.
pub fn set_io_timeouts(
    stream: &TcpStream,
    read: Option<Duration>,
    write: Option<Duration>,
) -> Result<()> {
    stream.set_read_timeout(read)?;
    stream.set_write_timeout(write)?;
    Ok(())
}

fn configure(stream: &TcpStream, endpoint: &Endpoint) -> Result<()> {
    stream.set_nodelay(true)?;
    debug!(%endpoint, "connected");
    Ok(())
}
