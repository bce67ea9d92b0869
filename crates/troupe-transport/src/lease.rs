use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TransportError};

/// Port allocator protocol.
///
/// Implementations hand out candidate ports for one owner application and
/// track which ones turned out to be unusable. The allocator itself lives
/// outside this layer (the orchestration server); in-process
/// implementations exist for tests and single-process deployments.
pub trait PortLessor: Send + Sync {
    /// Request a candidate port.
    fn request_port(&self) -> Result<u16>;

    /// Report that a requested port could not be bound.
    fn set_unavailable(&self, port: u16);

    /// Return a leased port after teardown.
    fn release_port(&self, port: u16);
}

/// A port checked out from a [`PortLessor`] for one channel's lifetime.
///
/// Released exactly once: either through [`LeasedPort::release`] or on drop,
/// whichever comes first.
pub struct LeasedPort {
    port: u16,
    lessor: Arc<dyn PortLessor>,
    released: AtomicBool,
}

impl LeasedPort {
    /// The leased port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Return the port to the allocator. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            debug!(port = self.port, "releasing leased port");
            self.lessor.release_port(self.port);
        }
    }
}

impl Drop for LeasedPort {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for LeasedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedPort")
            .field("port", &self.port)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

/// Bind a listener on a leased port.
///
/// Loops "request a port, attempt bind, on failure mark unavailable and
/// retry" until a bind succeeds or the allocator runs out of ports.
pub fn bind_leased(lessor: &Arc<dyn PortLessor>) -> Result<(TcpListener, LeasedPort)> {
    loop {
        let port = lessor.request_port()?;
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(listener) => {
                debug!(port, "bound listener on leased port");
                return Ok((
                    listener,
                    LeasedPort {
                        port,
                        lessor: Arc::clone(lessor),
                        released: AtomicBool::new(false),
                    },
                ));
            }
            Err(err) => {
                debug!(port, %err, "leased port not bindable, marking unavailable");
                lessor.set_unavailable(port);
            }
        }
    }
}
