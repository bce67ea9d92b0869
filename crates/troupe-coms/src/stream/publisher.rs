use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use troupe_wire::Envelope;
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::context::{channel_identity, channel_key, Context, DirectoryError, POLL_INTERVAL};
use crate::error::{ComsError, Result};
use crate::poll::{Deadline, Polled};
use crate::rpc::ResponderAdvert;
use crate::socket::{BroadcastSocket, ReplySocket};
use crate::state::{ChannelState, StateCell};
use crate::stream::{barrier_key, StreamAdvert, KEY_PREFIX};

/// Barrier thread answering stream handshakes on behalf of the producer.
///
/// The thread owns its reply socket; the socket closes (and releases its
/// leased port) when the thread exits.
struct Barrier {
    port: u16,
    stop: CancelToken,
    subscribed: Arc<AtomicU32>,
    thread: Option<JoinHandle<()>>,
}

impl Barrier {
    fn halt(&mut self) {
        self.stop.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The producing side of a stream channel.
///
/// Binds a broadcast socket on a leased port and advertises
/// `{port, n_subscribers, sync}` under a key derived from the logical
/// stream name. When a subscriber count or synchronization is requested,
/// a background barrier thread answers handshake probes and counts
/// subscription announcements.
///
/// `send`, `send_two_parts` and `send_end` take `&self` and are
/// serialized internally, so several producer threads may legitimately
/// share one publisher.
pub struct Publisher {
    ctx: Arc<Context>,
    name: String,
    key: String,
    identity: String,
    n_subscribers: u32,
    sync: bool,
    poll_interval: Duration,
    state: StateCell,
    token: CancelToken,
    socket: Option<Arc<BroadcastSocket>>,
    barrier: Option<Barrier>,
    ended: AtomicBool,
    advertised: bool,
    registered: bool,
}

impl Publisher {
    /// Create an empty publisher expecting `n_subscribers` subscribers.
    /// Zero means fire-and-forget. No sockets exist until `init()`.
    pub fn create(ctx: Arc<Context>, name: impl Into<String>, n_subscribers: u32) -> Self {
        let name = name.into();
        let key = channel_key(KEY_PREFIX, &name);
        let identity = channel_identity(&key, ctx.app().id);
        Self {
            ctx,
            name,
            key,
            identity,
            n_subscribers,
            sync: false,
            poll_interval: POLL_INTERVAL,
            state: StateCell::new(),
            token: CancelToken::new(),
            socket: None,
            barrier: None,
            ended: AtomicBool::new(false),
            advertised: false,
            registered: false,
        }
    }

    /// Ask subscribers to handshake even without a subscriber count.
    pub fn set_sync(&mut self, value: bool) {
        self.sync = value;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// The leased port the broadcast socket is bound on, once initialized.
    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(|socket| socket.port())
    }

    /// Bind, start the barrier when one is needed, and advertise. Fails
    /// with a creation error if a publisher with the same logical name is
    /// already registered.
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        self.state.set(ChannelState::Handshaking);

        let socket = Arc::new(BroadcastSocket::bind(self.ctx.lessor())?);
        let port = socket.port();

        let barrier = if self.n_subscribers > 0 || self.sync {
            let barrier = self.start_barrier(&socket)?;
            let advert = serde_json::to_string(&ResponderAdvert { port: barrier.port })
                .expect("advert serialization cannot fail");
            if let Err(err) = self.ctx.directory().store(&barrier_key(&self.name), &advert) {
                let mut barrier = barrier;
                barrier.halt();
                socket.close();
                return Err(creation_error(err, &self.name));
            }
            Some(barrier)
        } else {
            None
        };

        let advert = serde_json::to_string(&StreamAdvert {
            port,
            n_subscribers: self.n_subscribers,
            sync: self.sync,
        })
        .expect("advert serialization cannot fail");
        if let Err(err) = self.ctx.directory().store(&self.key, &advert) {
            if let Some(mut barrier) = barrier {
                let _ = self.ctx.directory().remove(&barrier_key(&self.name));
                barrier.halt();
            }
            socket.close();
            return Err(creation_error(err, &self.name));
        }
        self.advertised = true;
        self.barrier = barrier;
        self.socket = Some(socket);

        if !self.registered {
            self.ctx.cancels().register(&self.token);
            self.registered = true;
        }

        info!(stream = %self.name, port, "publisher ready");
        self.state.set(ChannelState::Ready);
        Ok(())
    }

    fn start_barrier(&self, broadcast: &Arc<BroadcastSocket>) -> Result<Barrier> {
        let identity = channel_identity(&barrier_key(&self.name), self.ctx.app().id);
        let socket = ReplySocket::bind(self.ctx.lessor(), Some(identity), self.poll_interval)?;
        let port = socket.port();
        let stop = CancelToken::new();
        let subscribed = Arc::new(AtomicU32::new(0));

        let broadcast = Arc::clone(broadcast);
        let probe_identity = self.identity.clone();
        let stream_name = self.name.clone();
        let channel_token = self.token.clone();
        let count = Arc::clone(&subscribed);
        let loop_token = stop.clone();
        let thread = std::thread::spawn(move || loop {
            match socket.recv(Deadline::forever(), &loop_token) {
                Ok(Polled::Ready((route, message))) => {
                    if message.len() < 2 {
                        warn!("stream barrier message is missing its envelope frame");
                        continue;
                    }
                    match Envelope::decode(&message[1]) {
                        Ok(Envelope::SyncStream { .. }) => {
                            // Echo a probe on the data socket so the asking
                            // subscriber can observe that data is flowing.
                            let envelope = Envelope::SyncStream {
                                name: stream_name.clone(),
                            }
                            .encode();
                            broadcast.send(&[probe_identity.as_bytes(), &envelope]);
                            route.ack_ok();
                        }
                        Ok(Envelope::Subscribe) => {
                            count.fetch_add(1, Ordering::SeqCst);
                            route.ack_ok();
                        }
                        Ok(Envelope::Cancel) => {
                            channel_token.cancel();
                            route.ack_ok();
                            return;
                        }
                        Ok(other) => {
                            error!(
                                code = other.code(),
                                "unexpected envelope type on stream barrier"
                            );
                        }
                        Err(err) => {
                            error!(%err, "malformed message on stream barrier");
                        }
                    }
                }
                Ok(Polled::Stopped) => return,
                Ok(Polled::TimedOut) | Ok(Polled::Closed) => continue,
                Err(err) => {
                    error!(%err, "stream barrier receive failed");
                    return;
                }
            }
        });

        Ok(Barrier {
            port,
            stop,
            subscribed,
            thread: Some(thread),
        })
    }

    /// Block until the expected number of subscribers announced
    /// themselves. A count of zero never blocks; canceled first reports
    /// `false`.
    pub fn wait_for_subscribers(&self) -> bool {
        if self.n_subscribers == 0 {
            return true;
        }
        let Some(barrier) = self.barrier.as_ref() else {
            return false;
        };
        loop {
            if barrier.subscribed.load(Ordering::SeqCst) >= self.n_subscribers {
                return true;
            }
            if self.token.should_stop() {
                return false;
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Number of subscription announcements counted so far.
    pub fn subscriber_count(&self) -> u32 {
        self.barrier
            .as_ref()
            .map(|barrier| barrier.subscribed.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Broadcast a one-part data message to every connected subscriber.
    pub fn send(&self, data: &[u8]) -> Result<()> {
        self.publish(&[data])
    }

    /// Broadcast a data message in two binary parts.
    pub fn send_two_parts(&self, first: &[u8], second: &[u8]) -> Result<()> {
        self.publish(&[first, second])
    }

    fn publish(&self, payload: &[&[u8]]) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ComsError::Creation("publisher is not initialized".to_string()))?;
        if self.ended.load(Ordering::SeqCst) {
            // The end marker is final; later sends are dropped.
            return Ok(());
        }
        let envelope = Envelope::Stream.encode();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(2 + payload.len());
        parts.push(self.identity.as_bytes());
        parts.push(&envelope);
        parts.extend_from_slice(payload);
        socket.send(&parts);
        Ok(())
    }

    /// Broadcast the explicit end-of-stream marker. Emits at most once,
    /// no matter how often it is called.
    pub fn send_end(&self) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ComsError::Creation("publisher is not initialized".to_string()))?;
        self.emit_end(socket);
        Ok(())
    }

    fn emit_end(&self, socket: &BroadcastSocket) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let envelope = Envelope::StreamEnd.encode();
            socket.send(&[self.identity.as_bytes(), &envelope]);
            self.token.mark_ended();
        }
    }

    /// Cancel the publisher, unblocking a barrier wait in another thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this publisher.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// True once the end marker was sent.
    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Emit the end marker if it was never sent, remove the
    /// advertisements, stop the barrier thread and release the leased
    /// ports. Idempotent, safe to call after cancellation.
    pub fn terminate(&mut self) {
        if let Some(socket) = self.socket.take() {
            self.emit_end(&socket);
            if self.advertised {
                let _ = self.ctx.directory().remove(&self.key);
                self.advertised = false;
            }
            if let Some(mut barrier) = self.barrier.take() {
                let _ = self.ctx.directory().remove(&barrier_key(&self.name));
                barrier.halt();
            }
            socket.close();
            self.ctx.cancels().deregister(&self.token);
            self.registered = false;
        }
    }
}

fn creation_error(err: DirectoryError, name: &str) -> ComsError {
    match err {
        DirectoryError::AlreadyExists(_) => {
            ComsError::Creation(format!("a publisher named '{name}' already exists"))
        }
        other => other.into(),
    }
}
