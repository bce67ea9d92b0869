//! Wire-protocol clients for the orchestration server's collaborators.
//!
//! The server hosts the discovery store, the port allocator and the
//! status broadcast; these clients speak the store and port envelopes
//! over an [`Exchange`] to the server endpoint, and decode the status
//! stream into the events the liveness watchers consume. Reply
//! convention: `Response { value: 0 }` is success, any other value is
//! the operation-specific failure; `request_port` replies carry the
//! leased port in `value`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use troupe_transport::{Endpoint, PortLessor, TransportError};
use troupe_wire::{Envelope, MessageReader, WireError};
use tracing::warn;

use crate::context::{
    AppState, Directory, DirectoryError, StatusEvent, StatusFeed, POLL_INTERVAL,
};
use crate::error::ComsError;
use crate::exchange::Exchange;

/// One request/reply connection to the orchestration server, shared by
/// the operations of one client.
struct ServerLink {
    app_id: u32,
    exchange: Mutex<Exchange>,
}

impl ServerLink {
    fn new(server: Endpoint, app_id: u32, timeout: Option<Duration>) -> Self {
        Self {
            app_id,
            exchange: Mutex::new(Exchange::new(server, None).with_timeout(timeout)),
        }
    }

    fn call(&self, envelope: &Envelope) -> std::result::Result<Envelope, ComsError> {
        let reply = self.exchange.lock().unwrap().request(envelope, &[])?;
        let frame = reply.get(1).ok_or_else(|| {
            ComsError::Malformed("server reply is missing its envelope frame".to_string())
        })?;
        Ok(Envelope::decode(frame)?)
    }
}

/// Discovery store hosted by the orchestration server.
pub struct RemoteDirectory {
    link: ServerLink,
}

impl RemoteDirectory {
    pub fn new(server: Endpoint, app_id: u32, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            link: ServerLink::new(server, app_id, timeout),
        })
    }
}

impl Directory for RemoteDirectory {
    fn store(&self, key: &str, value: &str) -> Result<(), DirectoryError> {
        let envelope = Envelope::StoreKeyValue {
            id: self.link.app_id,
            key: key.to_string(),
            value: value.to_string(),
        };
        match self.link.call(&envelope).map_err(backend)? {
            Envelope::Response { value: 0, .. } => Ok(()),
            Envelope::Response { .. } => Err(DirectoryError::AlreadyExists(key.to_string())),
            other => Err(unexpected(&other)),
        }
    }

    fn get(&self, key: &str) -> Result<Option<String>, DirectoryError> {
        let envelope = Envelope::GetKeyValue {
            id: self.link.app_id,
            key: key.to_string(),
        };
        match self.link.call(&envelope).map_err(backend)? {
            Envelope::Response { value: 0, message } => Ok(message),
            Envelope::Response { .. } => Ok(None),
            other => Err(unexpected(&other)),
        }
    }

    fn remove(&self, key: &str) -> Result<(), DirectoryError> {
        let envelope = Envelope::RemoveKey {
            id: self.link.app_id,
            key: key.to_string(),
        };
        match self.link.call(&envelope).map_err(backend)? {
            Envelope::Response { value: 0, .. } => Ok(()),
            Envelope::Response { .. } => Err(DirectoryError::NotFound(key.to_string())),
            other => Err(unexpected(&other)),
        }
    }
}

fn backend(err: ComsError) -> DirectoryError {
    DirectoryError::Backend(err.to_string())
}

fn unexpected(envelope: &Envelope) -> DirectoryError {
    DirectoryError::Backend(format!("unexpected reply type {}", envelope.code()))
}

/// Port allocator hosted by the orchestration server.
pub struct RemoteLessor {
    link: ServerLink,
}

impl RemoteLessor {
    pub fn new(server: Endpoint, app_id: u32, timeout: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            link: ServerLink::new(server, app_id, timeout),
        })
    }
}

impl PortLessor for RemoteLessor {
    fn request_port(&self) -> troupe_transport::Result<u16> {
        let reply = self
            .link
            .call(&Envelope::RequestPort {
                id: self.link.app_id,
            })
            .map_err(io_error)?;
        match reply {
            Envelope::Response { value, .. } if value > 0 => {
                u16::try_from(value).map_err(|_| TransportError::NoPortAvailable)
            }
            Envelope::Response { .. } => Err(TransportError::NoPortAvailable),
            other => Err(io_error(ComsError::Malformed(format!(
                "unexpected reply type {}",
                other.code()
            )))),
        }
    }

    fn set_unavailable(&self, port: u16) {
        let envelope = Envelope::PortUnavailable {
            id: self.link.app_id,
            port,
        };
        if let Err(err) = self.link.call(&envelope) {
            warn!(%err, port, "cannot report port as unavailable");
        }
    }

    fn release_port(&self, port: u16) {
        let envelope = Envelope::ReleasePort {
            id: self.link.app_id,
            port,
        };
        if let Err(err) = self.link.call(&envelope) {
            warn!(%err, port, "cannot release leased port");
        }
    }
}

fn io_error(err: ComsError) -> TransportError {
    TransportError::Io(std::io::Error::other(err.to_string()))
}

/// Status broadcast hosted by the orchestration server.
///
/// Connects to the server's status endpoint and fans the decoded
/// lifecycle events out to local subscribers; liveness watchers consume
/// it exactly like the in-memory hub.
pub struct RemoteStatusFeed {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<StatusEvent>>>>,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteStatusFeed {
    /// Connect to the server's status broadcast and start decoding.
    pub fn connect(server: Endpoint) -> crate::error::Result<Arc<Self>> {
        let stream = troupe_transport::connect(&server)?;
        troupe_transport::set_io_timeouts(&stream, Some(POLL_INTERVAL), None)?;
        let mut reader = MessageReader::new(stream);

        let subscribers: Arc<Mutex<Vec<mpsc::Sender<StatusEvent>>>> = Arc::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_subscribers = Arc::clone(&subscribers);
        let thread_shutdown = Arc::clone(&shutdown);
        let thread = std::thread::spawn(move || loop {
            if thread_shutdown.load(Ordering::SeqCst) {
                return;
            }
            match reader.read_message() {
                Ok(message) => {
                    let Some(frame) = message.get(1) else { continue };
                    match Envelope::decode(frame) {
                        Ok(Envelope::Status {
                            id,
                            name,
                            state,
                            past_states,
                            exit_code,
                        }) => {
                            let event = StatusEvent {
                                id,
                                name,
                                state: AppState::from_code(state),
                                past_states,
                                exit_code,
                            };
                            thread_subscribers
                                .lock()
                                .unwrap()
                                .retain(|subscriber| subscriber.send(event.clone()).is_ok());
                        }
                        Ok(_) => continue,
                        Err(err) => {
                            warn!(%err, "undecodable message on status broadcast");
                        }
                    }
                }
                Err(err) if err.is_poll_timeout() => continue,
                Err(WireError::ConnectionClosed) => return,
                Err(err) => {
                    warn!(%err, "status broadcast read failed");
                    return;
                }
            }
        });

        Ok(Arc::new(Self {
            subscribers,
            shutdown,
            thread: Mutex::new(Some(thread)),
        }))
    }

    /// Stop the reader thread and join it. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            if let Some(thread) = self.thread.lock().unwrap().take() {
                let _ = thread.join();
            }
        }
    }
}

impl StatusFeed for RemoteStatusFeed {
    fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}

impl Drop for RemoteStatusFeed {
    fn drop(&mut self) {
        self.stop();
    }
}
