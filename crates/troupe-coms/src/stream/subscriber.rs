use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use troupe_transport::Endpoint;
use troupe_wire::{Envelope, Multipart};
use tracing::{debug, info};

use crate::cancel::{CancelToken, LivenessWatcher};
use crate::context::{channel_identity, channel_key, Context, PeerApp, POLL_INTERVAL};
use crate::error::{ComsError, Result};
use crate::exchange::Exchange;
use crate::poll::{Deadline, Polled, TimeoutBudget};
use crate::rpc::ResponderAdvert;
use crate::socket::SubscribeSocket;
use crate::state::{ChannelState, StateCell};
use crate::stream::{barrier_key, StreamAdvert, KEY_PREFIX};

/// The consuming side of a stream channel.
///
/// Looks the producer's advertisement up in its discovery store, connects
/// to the broadcast socket and, when the advertisement asks for it,
/// handshakes through the producer's barrier before `init()` returns: a
/// raw connect-then-read is asynchronous underneath and could silently
/// miss the first messages.
pub struct Subscriber {
    ctx: Arc<Context>,
    peer: PeerApp,
    name: String,
    key: String,
    identity: String,
    check_app: bool,
    timeout: Option<Duration>,
    poll_interval: Duration,
    state: StateCell,
    token: CancelToken,
    socket: Option<SubscribeSocket>,
    watcher: Option<LivenessWatcher>,
    registered: bool,
}

impl Subscriber {
    /// Create an empty subscriber for a stream hosted by `peer`.
    pub fn create(ctx: Arc<Context>, peer: PeerApp, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = channel_key(KEY_PREFIX, &name);
        let identity = channel_identity(&key, peer.id);
        Self {
            ctx,
            peer,
            name,
            key,
            identity,
            check_app: false,
            timeout: None,
            poll_interval: POLL_INTERVAL,
            state: StateCell::new(),
            token: CancelToken::new(),
            socket: None,
            watcher: None,
            registered: false,
        }
    }

    /// Watch the producing application's status and treat a terminal
    /// state like cancellation.
    pub fn set_check_app(&mut self, value: bool) {
        self.check_app = value;
    }

    /// Bound each blocking operation. `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
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

    /// Look the stream up, connect and handshake.
    ///
    /// Raises a synchronization-timeout error when the advertisement or
    /// the handshake does not arrive within the configured timeout, and a
    /// creation error when the producing application is already known to
    /// have terminated. Returns quietly (without reaching `Ready`) if
    /// canceled while waiting.
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        self.state.set(ChannelState::Handshaking);
        let budget = TimeoutBudget::new(self.timeout);

        if self.check_app && self.watcher.is_none() {
            self.watcher = Some(LivenessWatcher::watch(
                self.ctx.status(),
                self.peer.id,
                self.token.clone(),
            ));
        }

        let Some(advert) = self.lookup(&budget)? else {
            self.state.set(ChannelState::Canceled);
            return Ok(());
        };

        let endpoint = self.peer.endpoint.with_port(advert.port);
        let mut socket = SubscribeSocket::connect(&endpoint, self.poll_interval)?;

        if (advert.sync || advert.n_subscribers > 0)
            && !self.handshake(&mut socket, &advert, &budget)?
        {
            self.state.set(ChannelState::Canceled);
            return Ok(());
        }

        self.socket = Some(socket);
        if !self.registered {
            self.ctx.cancels().register(&self.token);
            self.registered = true;
        }

        info!(stream = %self.name, "subscriber connected");
        self.state.set(ChannelState::Ready);
        Ok(())
    }

    /// Wait for the producer's advertisement. `None` means canceled.
    fn lookup(&self, budget: &TimeoutBudget) -> Result<Option<StreamAdvert>> {
        loop {
            if let Some(value) = self.peer.directory().get(&self.key)? {
                let advert = serde_json::from_str(&value).map_err(|err| {
                    ComsError::Malformed(format!("invalid stream advertisement: {err}"))
                })?;
                return Ok(Some(advert));
            }
            if self.token.is_canceled() {
                return Ok(None);
            }
            if self.token.peer_lost() {
                return Err(ComsError::Creation(format!(
                    "application hosting stream '{}' already terminated",
                    self.name
                )));
            }
            if budget.exhausted() {
                return Err(ComsError::SynchronizationTimeout(format!(
                    "stream '{}' was never advertised",
                    self.name
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Probe through the barrier until data is observed on the data
    /// socket, then announce the subscription when the stream counts its
    /// subscribers. Returns `false` when canceled.
    fn handshake(
        &self,
        socket: &mut SubscribeSocket,
        advert: &StreamAdvert,
        budget: &TimeoutBudget,
    ) -> Result<bool> {
        let Some(barrier_endpoint) = self.barrier_endpoint(budget)? else {
            return Ok(false);
        };
        let barrier_identity = channel_identity(&barrier_key(&self.name), self.peer.id);
        let mut exchange = Exchange::new(barrier_endpoint, Some(barrier_identity));

        // Probe with a growing observation window until any message shows
        // up on the data socket.
        let mut window = self.poll_interval;
        loop {
            if self.token.should_stop() {
                return Ok(false);
            }
            exchange.set_timeout(Some(window));
            match exchange.request(
                &Envelope::SyncStream {
                    name: self.name.clone(),
                },
                &[],
            ) {
                Ok(_) => {
                    if socket.probe(window, &self.token)? {
                        break;
                    }
                }
                Err(ComsError::ConnectionTimeout(_)) | Err(ComsError::Transport(_)) => {
                    debug!(stream = %self.name, "stream sync attempt failed, retrying");
                }
                Err(other) => return Err(other),
            }
            if budget.exhausted() {
                return Err(ComsError::SynchronizationTimeout(format!(
                    "no data observed on stream '{}'",
                    self.name
                )));
            }
            window += self.poll_interval;
        }

        if advert.n_subscribers > 0 {
            exchange.set_timeout(budget.remaining());
            match exchange.request(&Envelope::Subscribe, &[]) {
                Ok(_) => {}
                Err(ComsError::ConnectionTimeout(_)) => {
                    return Err(ComsError::SynchronizationTimeout(format!(
                        "subscription to stream '{}' was never acknowledged",
                        self.name
                    )));
                }
                Err(other) => return Err(other),
            }
        }
        Ok(true)
    }

    /// Wait for the barrier advertisement. `None` means canceled.
    fn barrier_endpoint(&self, budget: &TimeoutBudget) -> Result<Option<Endpoint>> {
        let key = barrier_key(&self.name);
        loop {
            if let Some(value) = self.peer.directory().get(&key)? {
                let advert: ResponderAdvert = serde_json::from_str(&value).map_err(|err| {
                    ComsError::Malformed(format!("invalid stream barrier advertisement: {err}"))
                })?;
                return Ok(Some(self.peer.endpoint.with_port(advert.port)));
            }
            if self.token.should_stop() {
                return Ok(None);
            }
            if budget.exhausted() {
                return Err(ComsError::SynchronizationTimeout(format!(
                    "stream '{}' barrier was never advertised",
                    self.name
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Block for the next one-part data message.
    ///
    /// Returns `Ok(None)` when the stream ended, the channel was
    /// canceled, the configured timeout elapsed, or the producer
    /// disappeared mid-stream; the flags say which — peer loss sets none
    /// of them and simply ends the stream.
    pub fn receive(&mut self) -> Result<Option<Bytes>> {
        match self.next_message()? {
            Some(message) => {
                let payload = message.get(2).cloned().ok_or_else(|| {
                    ComsError::Malformed("stream message without payload frame".to_string())
                })?;
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }

    /// Block for the next two-part data message.
    pub fn receive_two_parts(&mut self) -> Result<Option<(Bytes, Bytes)>> {
        match self.next_message()? {
            Some(message) => {
                let first = message.get(2).cloned().ok_or_else(|| {
                    ComsError::Malformed("stream message without payload frame".to_string())
                })?;
                let second = message.get(3).cloned().ok_or_else(|| {
                    ComsError::Malformed(
                        "stream message without second payload frame".to_string(),
                    )
                })?;
                Ok(Some((first, second)))
            }
            None => Ok(None),
        }
    }

    fn next_message(&mut self) -> Result<Option<Multipart>> {
        self.token.reset_timed_out();
        let socket = self
            .socket
            .as_mut()
            .ok_or_else(|| ComsError::Creation("subscriber is not initialized".to_string()))?;
        if self.token.has_ended() {
            return Ok(None);
        }
        let deadline = Deadline::new(self.timeout);

        loop {
            match socket.recv(deadline, &self.token)? {
                Polled::Ready(message) => {
                    if message.len() < 2 {
                        return Err(ComsError::Malformed(
                            "stream message is missing its envelope frame".to_string(),
                        ));
                    }
                    // Several producer instances may share one transport;
                    // only this channel's identity is ours to consume.
                    if message[0].as_ref() != self.identity.as_bytes() {
                        continue;
                    }
                    match Envelope::decode(&message[1])? {
                        Envelope::Stream => return Ok(Some(message)),
                        Envelope::SyncStream { .. } => continue,
                        Envelope::StreamEnd => {
                            self.token.mark_ended();
                            self.state.set(ChannelState::Ended);
                            return Ok(None);
                        }
                        // Peers on the socket-injection scheme deliver the
                        // cancellation sentinel in-band.
                        Envelope::Cancel => {
                            self.token.cancel();
                            self.state.set(ChannelState::Canceled);
                            return Ok(None);
                        }
                        other => {
                            return Err(ComsError::Malformed(format!(
                                "unexpected envelope type {} on stream channel",
                                other.code()
                            )))
                        }
                    }
                }
                Polled::Stopped => {
                    if self.token.is_canceled() {
                        self.state.set(ChannelState::Canceled);
                    }
                    return Ok(None);
                }
                Polled::TimedOut => {
                    self.token.mark_timed_out();
                    return Ok(None);
                }
                Polled::Closed => return Ok(None),
            }
        }
    }

    /// Cancel the subscriber, unblocking a receive in another thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this subscriber.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// True once the stream's end marker was observed.
    pub fn has_ended(&self) -> bool {
        self.token.has_ended()
    }

    pub fn has_timed_out(&self) -> bool {
        self.token.has_timed_out()
    }

    /// Drop the connection and join the liveness watcher. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if self.socket.take().is_some() {
            self.ctx.cancels().deregister(&self.token);
            self.registered = false;
        }
    }
}
