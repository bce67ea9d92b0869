use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use troupe_transport::{bind_leased, LeasedPort, PortLessor};
use troupe_wire::MessageWriter;
use tracing::debug;

use crate::error::Result;
use crate::socket::ACCEPT_POLL;

/// Fan-out socket for a stream producer.
///
/// Binds a leased port, accepts subscriber connections on a background
/// thread, and writes every message to all connected subscribers.
/// Subscribers whose connection broke are dropped on the next send —
/// delivery is "what arrived before disconnect".
pub(crate) struct BroadcastSocket {
    port: u16,
    lease: LeasedPort,
    conns: Arc<Mutex<Vec<MessageWriter<TcpStream>>>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastSocket {
    pub fn bind(lessor: &Arc<dyn PortLessor>) -> Result<Self> {
        let (listener, lease) = bind_leased(lessor)?;
        listener
            .set_nonblocking(true)
            .map_err(troupe_transport::TransportError::Io)?;

        let port = lease.port();
        let conns: Arc<Mutex<Vec<MessageWriter<TcpStream>>>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_conns = Arc::clone(&conns);
        let accept_shutdown = Arc::clone(&shutdown);
        let accept_thread = std::thread::spawn(move || loop {
            if accept_shutdown.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "subscriber connected");
                    let _ = stream.set_nodelay(true);
                    accept_conns.lock().unwrap().push(MessageWriter::new(stream));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    debug!(%err, "broadcast accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        });

        Ok(Self {
            port,
            lease,
            conns,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Send one message to every connected subscriber.
    ///
    /// Serialized internally, so a producer may be driven by several
    /// threads sharing one socket.
    pub fn send(&self, parts: &[&[u8]]) {
        let mut conns = self.conns.lock().unwrap();
        conns.retain_mut(|writer| match writer.send(parts) {
            Ok(()) => true,
            Err(err) => {
                debug!(%err, "dropping broken subscriber connection");
                false
            }
        });
    }

    /// Stop accepting, drop all connections and release the port.
    /// Idempotent.
    pub fn close(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.accept_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
            self.conns.lock().unwrap().clear();
            self.lease.release();
        }
    }
}

impl Drop for BroadcastSocket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use troupe_wire::MessageReader;

    use super::*;
    use crate::mem::MemoryLessor;

    fn wait_for_connections(socket: &BroadcastSocket, n: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while socket.conns.lock().unwrap().len() < n {
            assert!(std::time::Instant::now() < deadline, "connections not seen");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn fans_out_to_all_connections() {
        let lessor: Arc<dyn PortLessor> = MemoryLessor::ephemeral();
        let socket = BroadcastSocket::bind(&lessor).unwrap();

        let connect = || TcpStream::connect(("127.0.0.1", socket.port())).unwrap();
        let first = connect();
        let second = connect();
        wait_for_connections(&socket, 2);

        socket.send(&[b"topic", b"payload"]);

        for stream in [first, second] {
            let mut reader = MessageReader::new(stream);
            let message = reader.read_message().unwrap();
            assert_eq!(message[0].as_ref(), b"topic");
            assert_eq!(message[1].as_ref(), b"payload");
        }
    }

    #[test]
    fn dead_connection_dropped_on_send() {
        let lessor: Arc<dyn PortLessor> = MemoryLessor::ephemeral();
        let socket = BroadcastSocket::bind(&lessor).unwrap();

        let alive = TcpStream::connect(("127.0.0.1", socket.port())).unwrap();
        let dead = TcpStream::connect(("127.0.0.1", socket.port())).unwrap();
        wait_for_connections(&socket, 2);
        drop(dead);

        // First send may still land in the dead socket's buffers; the
        // broken pipe is observed on a later send.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while socket.conns.lock().unwrap().len() > 1 {
            socket.send(&[b"probe"]);
            assert!(std::time::Instant::now() < deadline, "dead conn not dropped");
            std::thread::sleep(Duration::from_millis(10));
        }

        socket.send(&[b"last"]);
        let mut reader = MessageReader::new(alive);
        // The live connection saw every message, ending with "last".
        let mut seen_last = false;
        while !seen_last {
            let message = reader.read_message().unwrap();
            seen_last = message[0].as_ref() == b"last";
        }
    }

    #[test]
    fn close_releases_port_once() {
        let lessor = MemoryLessor::ephemeral();
        let lessor_dyn: Arc<dyn PortLessor> = lessor.clone();
        let socket = BroadcastSocket::bind(&lessor_dyn).unwrap();
        let port = socket.port();

        socket.close();
        socket.close();

        // The released port is requestable again.
        let mut found = false;
        for _ in 0..2000 {
            if lessor.request_port().unwrap() == port {
                found = true;
                break;
            }
        }
        assert!(found, "closed socket should have released its port");
    }
}
