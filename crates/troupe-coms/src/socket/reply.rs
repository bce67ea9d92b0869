use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use troupe_wire::{Envelope, MessageReader, MessageWriter, Multipart, WireError};
use troupe_transport::{bind_leased, LeasedPort, PortLessor};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::poll::{Deadline, Polled};
use crate::socket::ACCEPT_POLL;

/// Return path of one inbound message: the write half of the connection
/// it arrived on. Cloneable and sendable so replies can come from another
/// thread (router workers).
#[derive(Clone, Debug)]
pub(crate) struct ReplyRoute {
    writer: Arc<Mutex<MessageWriter<TcpStream>>>,
}

impl ReplyRoute {
    fn new(stream: TcpStream) -> Self {
        Self {
            writer: Arc::new(Mutex::new(MessageWriter::new(stream))),
        }
    }

    pub fn send(&self, parts: &[&[u8]]) -> Result<()> {
        self.writer.lock().unwrap().send(parts)?;
        Ok(())
    }

    /// Send the OK acknowledgement. Failures only mean the peer is
    /// already gone, so they are logged and dropped.
    pub fn ack_ok(&self) {
        let envelope = Envelope::ok().encode();
        if let Err(err) = self.send(&[b"", &envelope]) {
            debug!(%err, "failed to deliver acknowledgement");
        }
    }
}

/// Listening half of a request/reply channel.
///
/// Accepts any number of peer connections; a reader thread per connection
/// feeds complete messages, tagged with their return route, into one
/// queue. SYNC probes are acknowledged at this level so a peer can
/// synchronize against a channel whose owner is not currently blocked in
/// `receive()`; everything else waits in the queue for the channel.
pub(crate) struct ReplySocket {
    port: u16,
    lease: LeasedPort,
    inbox: mpsc::Receiver<(ReplyRoute, Multipart)>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    poll_interval: Duration,
}

impl ReplySocket {
    pub fn bind(
        lessor: &Arc<dyn PortLessor>,
        identity: Option<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let (listener, lease) = bind_leased(lessor)?;
        listener
            .set_nonblocking(true)
            .map_err(troupe_transport::TransportError::Io)?;

        let port = lease.port();
        let (tx, inbox) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let readers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();

        let accept_shutdown = Arc::clone(&shutdown);
        let accept_readers = Arc::clone(&readers);
        let accept_thread = std::thread::spawn(move || loop {
            if accept_shutdown.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "reply peer connected");
                    let _ = stream.set_nodelay(true);
                    let _ = stream.set_read_timeout(Some(poll_interval));
                    let write_half = match stream.try_clone() {
                        Ok(half) => half,
                        Err(err) => {
                            debug!(%err, "cannot clone reply connection");
                            continue;
                        }
                    };
                    let route = ReplyRoute::new(write_half);
                    let reader = MessageReader::new(stream);
                    let handle = spawn_reader(
                        reader,
                        route,
                        tx.clone(),
                        identity.clone(),
                        Arc::clone(&accept_shutdown),
                    );
                    accept_readers.lock().unwrap().push(handle);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => {
                    debug!(%err, "reply accept failed");
                    std::thread::sleep(ACCEPT_POLL);
                }
            }
        });

        Ok(Self {
            port,
            lease,
            inbox,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
            readers,
            poll_interval,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Wait for the next inbound message, bounded by the deadline and
    /// observing the cancellation token every poll interval.
    pub fn recv(
        &self,
        deadline: Deadline,
        token: &CancelToken,
    ) -> Result<Polled<(ReplyRoute, Multipart)>> {
        loop {
            if token.should_stop() {
                return Ok(Polled::Stopped);
            }
            match self.inbox.recv_timeout(self.poll_interval) {
                Ok(item) => return Ok(Polled::Ready(item)),
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.expired() {
                        return Ok(Polled::TimedOut);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(Polled::Stopped),
            }
        }
    }

    /// Stop the accept and reader threads and release the port.
    /// Idempotent.
    pub fn close(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            if let Some(handle) = self.accept_thread.lock().unwrap().take() {
                let _ = handle.join();
            }
            for handle in self.readers.lock().unwrap().drain(..) {
                let _ = handle.join();
            }
            self.lease.release();
        }
    }
}

impl Drop for ReplySocket {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reader(
    mut reader: MessageReader<TcpStream>,
    route: ReplyRoute,
    tx: mpsc::Sender<(ReplyRoute, Multipart)>,
    identity: Option<String>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    std::thread::spawn(move || loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        match reader.read_message() {
            Ok(message) => {
                if misaddressed(&message, identity.as_deref()) {
                    warn!("skipping message addressed to another identity");
                    continue;
                }
                if is_sync_probe(&message) {
                    route.ack_ok();
                    continue;
                }
                if tx.send((route.clone(), message)).is_err() {
                    return;
                }
            }
            Err(err) if err.is_poll_timeout() => continue,
            Err(WireError::ConnectionClosed) => return,
            Err(err) => {
                debug!(%err, "reply connection failed");
                return;
            }
        }
    })
}

/// Multiple channel instances may share one transport behind a proxy, so
/// an addressed message whose identity is someone else's is skipped, not
/// an error. An empty identity frame means a direct connection.
fn misaddressed(message: &Multipart, identity: Option<&str>) -> bool {
    match (message.first(), identity) {
        (Some(addressed), Some(own)) => {
            !addressed.is_empty() && addressed.as_ref() != own.as_bytes()
        }
        _ => false,
    }
}

fn is_sync_probe(message: &Multipart) -> bool {
    message
        .get(1)
        .map(|frame| matches!(Envelope::decode(frame), Ok(Envelope::Sync)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use troupe_transport::Endpoint;

    use super::*;
    use crate::context::POLL_INTERVAL;
    use crate::mem::MemoryLessor;

    fn bind(identity: Option<&str>) -> ReplySocket {
        let lessor: Arc<dyn PortLessor> = MemoryLessor::ephemeral();
        ReplySocket::bind(
            &lessor,
            identity.map(str::to_string),
            Duration::from_millis(20),
        )
        .unwrap()
    }

    fn connect(socket: &ReplySocket) -> (MessageWriter<TcpStream>, MessageReader<TcpStream>) {
        let endpoint = Endpoint::new("127.0.0.1", socket.port());
        let stream = troupe_transport::connect(&endpoint).unwrap();
        let reader = MessageReader::new(stream.try_clone().unwrap());
        (MessageWriter::new(stream), reader)
    }

    #[test]
    fn delivers_message_with_route() {
        let socket = bind(None);
        let (mut writer, mut reader) = connect(&socket);

        writer
            .send(&[b"".as_ref(), &Envelope::Cancel.encode()])
            .unwrap();

        let token = CancelToken::new();
        let polled = socket.recv(Deadline::forever(), &token).unwrap();
        let (route, message) = match polled {
            Polled::Ready(item) => item,
            other => panic!("unexpected poll outcome: {other:?}"),
        };
        assert!(matches!(
            Envelope::decode(&message[1]).unwrap(),
            Envelope::Cancel
        ));

        route.ack_ok();
        let ack = reader.read_message().unwrap();
        assert!(matches!(
            Envelope::decode(&ack[1]).unwrap(),
            Envelope::Response { value: 0, .. }
        ));
    }

    #[test]
    fn sync_probe_acked_without_consumer() {
        let socket = bind(None);
        let (mut writer, mut reader) = connect(&socket);

        writer
            .send(&[b"".as_ref(), &Envelope::Sync.encode()])
            .unwrap();

        // Nobody calls recv(); the ack still arrives.
        let ack = reader.read_message().unwrap();
        assert!(matches!(
            Envelope::decode(&ack[1]).unwrap(),
            Envelope::Response { value: 0, .. }
        ));

        // And the probe was not queued for the channel.
        let token = CancelToken::new();
        let polled = socket
            .recv(Deadline::new(Some(Duration::from_millis(50))), &token)
            .unwrap();
        assert!(matches!(polled, Polled::TimedOut));
    }

    #[test]
    fn misaddressed_message_skipped() {
        let socket = bind(Some("responder-x-1"));
        let (mut writer, _reader) = connect(&socket);

        writer
            .send(&[b"responder-y-2".as_ref(), &Envelope::Cancel.encode()])
            .unwrap();
        writer
            .send(&[b"responder-x-1".as_ref(), &Envelope::Cancel.encode()])
            .unwrap();

        let token = CancelToken::new();
        let polled = socket.recv(Deadline::forever(), &token).unwrap();
        match polled {
            Polled::Ready((_, message)) => {
                assert_eq!(message[0].as_ref(), b"responder-x-1");
            }
            other => panic!("unexpected poll outcome: {other:?}"),
        }
    }

    #[test]
    fn recv_observes_cancellation() {
        let socket = bind(None);
        let token = CancelToken::new();
        token.cancel();

        let polled = socket.recv(Deadline::forever(), &token).unwrap();
        assert!(matches!(polled, Polled::Stopped));
    }

    #[test]
    fn recv_times_out() {
        let socket = bind(None);
        let token = CancelToken::new();

        let start = std::time::Instant::now();
        let polled = socket
            .recv(Deadline::new(Some(Duration::from_millis(60))), &token)
            .unwrap();
        assert!(matches!(polled, Polled::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn messages_from_two_peers_interleave() {
        let socket = bind(None);
        let (mut first, _r1) = connect(&socket);
        let (mut second, _r2) = connect(&socket);

        first
            .send(&[b"".as_ref(), &Envelope::StreamEnd.encode()])
            .unwrap();
        second
            .send(&[b"".as_ref(), &Envelope::StreamEnd.encode()])
            .unwrap();

        let token = CancelToken::new();
        for _ in 0..2 {
            let polled = socket.recv(Deadline::forever(), &token).unwrap();
            assert!(matches!(polled, Polled::Ready(_)));
        }
    }

    #[test]
    fn poll_interval_default_is_documented_value() {
        assert_eq!(POLL_INTERVAL, Duration::from_millis(100));
    }
}
