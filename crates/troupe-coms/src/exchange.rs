use std::net::TcpStream;
use std::time::Duration;

use troupe_transport::Endpoint;
use troupe_wire::{Envelope, MessageReader, MessageWriter, Multipart, WireError};
use tracing::debug;

use crate::error::{ComsError, Result};
use crate::context::POLL_INTERVAL;
use crate::poll::Deadline;

/// One bounded request/reply operation: exactly one send followed by one
/// blocking receive, no pipelining.
///
/// The connection is created lazily on first use. When a request times
/// out the socket is destroyed and never reused — request/reply enforces
/// strict alternation and a socket with an unanswered send is unusable —
/// so the next request on the same `Exchange` transparently creates a
/// fresh connection. Control and data messages share the typed envelope,
/// so SYNC and CANCEL multiplex over the same transport as
/// REQUEST/RESPONSE.
pub struct Exchange {
    endpoint: Endpoint,
    identity: Option<String>,
    timeout: Option<Duration>,
    poll_interval: Duration,
    conn: Option<(MessageReader<TcpStream>, MessageWriter<TcpStream>)>,
}

impl Exchange {
    /// Create an exchange to `endpoint`. `identity` addresses a channel
    /// instance behind a shared transport; `None` sends an empty identity
    /// frame (direct connection). No socket is created yet.
    pub fn new(endpoint: Endpoint, identity: Option<String>) -> Self {
        Self {
            endpoint,
            identity,
            timeout: None,
            poll_interval: POLL_INTERVAL,
            conn: None,
        }
    }

    /// Bound each request. `None` blocks forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The remote endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// True while a connection exists (diagnostic).
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_none() {
            let stream = match self.timeout {
                Some(timeout) => troupe_transport::connect_timeout(&self.endpoint, timeout)?,
                None => troupe_transport::connect(&self.endpoint)?,
            };
            troupe_transport::set_io_timeouts(&stream, Some(self.poll_interval), None)?;
            let read_half = stream.try_clone().map_err(troupe_transport::TransportError::Io)?;
            self.conn = Some((MessageReader::new(read_half), MessageWriter::new(stream)));
        }
        Ok(())
    }

    /// Perform one exchange: send the envelope plus payload frames, then
    /// block for the single reply message.
    pub fn request(&mut self, envelope: &Envelope, payload: &[&[u8]]) -> Result<Multipart> {
        self.ensure_connected()?;
        let identity = self.identity.clone().unwrap_or_default();
        let envelope_frame = envelope.encode();
        let parts = message_parts(identity.as_bytes(), &envelope_frame, payload);

        let (reader, writer) = self.conn.as_mut().expect("connection was just ensured");
        if let Err(err) = writer.send(&parts) {
            self.conn = None;
            return Err(err.into());
        }

        let deadline = Deadline::new(self.timeout);
        loop {
            match reader.read_message() {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_poll_timeout() => {
                    if deadline.expired() {
                        debug!(endpoint = %self.endpoint, "exchange timed out, destroying socket");
                        self.conn = None;
                        return Err(ComsError::ConnectionTimeout(self.endpoint.to_string()));
                    }
                }
                Err(WireError::ConnectionClosed) => {
                    self.conn = None;
                    return Err(ComsError::Wire(WireError::ConnectionClosed));
                }
                Err(err) => {
                    self.conn = None;
                    return Err(err.into());
                }
            }
        }
    }

    /// Send without awaiting a reply on this socket.
    ///
    /// Used by the requester's data path, whose responses are routed to
    /// its private reply socket rather than back over this connection.
    pub(crate) fn send_only(&mut self, envelope: &Envelope, payload: &[&[u8]]) -> Result<()> {
        self.ensure_connected()?;
        let identity = self.identity.clone().unwrap_or_default();
        let envelope_frame = envelope.encode();
        let parts = message_parts(identity.as_bytes(), &envelope_frame, payload);

        let (_, writer) = self.conn.as_mut().expect("connection was just ensured");
        if let Err(err) = writer.send(&parts) {
            self.conn = None;
            return Err(err.into());
        }
        Ok(())
    }

    /// Drop the connection. The next request creates a fresh one.
    pub fn terminate(&mut self) {
        self.conn = None;
    }
}

fn message_parts<'a>(
    identity: &'a [u8],
    envelope_frame: &'a [u8],
    payload: &[&'a [u8]],
) -> Vec<&'a [u8]> {
    let mut parts = Vec::with_capacity(2 + payload.len());
    parts.push(identity);
    parts.push(envelope_frame);
    parts.extend_from_slice(payload);
    parts
}
