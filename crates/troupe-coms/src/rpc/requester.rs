use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use troupe_transport::Endpoint;
use troupe_wire::Envelope;
use tracing::{debug, info};

use crate::cancel::{CancelToken, LivenessWatcher};
use crate::context::{channel_identity, channel_key, Context, PeerApp, POLL_INTERVAL};
use crate::error::{ComsError, Result};
use crate::exchange::Exchange;
use crate::poll::{Deadline, Polled, TimeoutBudget};
use crate::rpc::{ResponderAdvert, KEY_PREFIX};
use crate::socket::ReplySocket;
use crate::state::{ChannelState, StateCell};

/// First synchronization attempt window; each retry waits one step more.
const SYNC_STEP: Duration = Duration::from_millis(200);

/// The asking side of an RPC channel.
///
/// Owns a private reply socket on a leased port and an addressed link to
/// the responder. Requests and responses alternate strictly: at most one
/// request may be outstanding per requester instance — a caller contract,
/// not enforced here.
pub struct Requester {
    ctx: Arc<Context>,
    peer: PeerApp,
    responder_name: String,
    key: String,
    identity: String,
    check_app: bool,
    timeout: Option<Duration>,
    poll_interval: Duration,
    state: StateCell,
    token: CancelToken,
    reply_socket: Option<ReplySocket>,
    link: Option<Exchange>,
    responder_endpoint: Option<Endpoint>,
    watcher: Option<LivenessWatcher>,
    registered: bool,
}

impl Requester {
    /// Create an empty requester for a responder hosted by `peer`.
    pub fn create(ctx: Arc<Context>, peer: PeerApp, responder_name: impl Into<String>) -> Self {
        let responder_name = responder_name.into();
        let key = channel_key(KEY_PREFIX, &responder_name);
        let identity = channel_identity(&key, peer.id);
        Self {
            ctx,
            peer,
            responder_name,
            key,
            identity,
            check_app: false,
            timeout: None,
            poll_interval: POLL_INTERVAL,
            state: StateCell::new(),
            token: CancelToken::new(),
            reply_socket: None,
            link: None,
            responder_endpoint: None,
            watcher: None,
            registered: false,
        }
    }

    /// Watch the peer application's status and treat a terminal state
    /// like cancellation.
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

    pub fn responder_name(&self) -> &str {
        &self.responder_name
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Look the responder up, bind the private reply socket and
    /// synchronize the link.
    ///
    /// Raises a synchronization-timeout error when the handshake does not
    /// complete within the configured timeout. Returns quietly (without
    /// reaching `Ready`) if canceled while waiting.
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
        self.responder_endpoint = Some(self.peer.endpoint.with_port(advert.port));

        if self.reply_socket.is_none() {
            self.reply_socket = Some(ReplySocket::bind(
                self.ctx.lessor(),
                None,
                self.poll_interval,
            )?);
        }

        let Some(link) = self.sync_link(&budget)? else {
            self.state.set(ChannelState::Canceled);
            return Ok(());
        };
        self.link = Some(link);

        if !self.registered {
            self.ctx.cancels().register(&self.token);
            self.registered = true;
        }

        info!(responder = %self.responder_name, "requester synchronized");
        self.state.set(ChannelState::Ready);
        Ok(())
    }

    /// Wait for the responder's advertisement. `None` means canceled.
    fn lookup(&self, budget: &TimeoutBudget) -> Result<Option<ResponderAdvert>> {
        loop {
            if let Some(value) = self.peer.directory().get(&self.key)? {
                let advert = serde_json::from_str(&value).map_err(|err| {
                    ComsError::Malformed(format!("invalid responder advertisement: {err}"))
                })?;
                return Ok(Some(advert));
            }
            if self.token.is_canceled() {
                return Ok(None);
            }
            if self.token.peer_lost() {
                return Err(ComsError::Creation(format!(
                    "application hosting responder '{}' already terminated",
                    self.responder_name
                )));
            }
            if budget.exhausted() {
                return Err(ComsError::SynchronizationTimeout(format!(
                    "responder '{}' was never advertised",
                    self.responder_name
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Bounded retry loop: build a fresh socket, send SYNC, wait an
    /// increasing timeout; exhausting the global budget raises. `None`
    /// means canceled.
    fn sync_link(&mut self, budget: &TimeoutBudget) -> Result<Option<Exchange>> {
        let endpoint = self
            .responder_endpoint
            .clone()
            .expect("endpoint resolved before sync");
        let mut step = SYNC_STEP;

        loop {
            if self.token.should_stop() {
                return Ok(None);
            }
            let mut link =
                Exchange::new(endpoint.clone(), Some(self.identity.clone())).with_timeout(Some(step));
            match link.request(&Envelope::Sync, &[]) {
                Ok(_) => {
                    link.set_timeout(self.timeout);
                    return Ok(Some(link));
                }
                Err(ComsError::ConnectionTimeout(_)) | Err(ComsError::Transport(_)) => {
                    debug!(responder = %self.responder_name, ?step, "sync attempt failed, retrying");
                    step += SYNC_STEP;
                    if budget.exhausted() {
                        return Err(ComsError::SynchronizationTimeout(format!(
                            "requester cannot synchronize responder '{}'",
                            self.responder_name
                        )));
                    }
                    std::thread::sleep(self.poll_interval);
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Send a one-part request.
    ///
    /// If the link was reset by a previous timeout, the requester
    /// re-synchronizes first and can time out during that synchronization.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.send_parts(&[data])
    }

    /// Send a request in two binary parts.
    pub fn send_two_parts(&mut self, first: &[u8], second: &[u8]) -> Result<()> {
        self.send_parts(&[first, second])
    }

    fn send_parts(&mut self, payload: &[&[u8]]) -> Result<()> {
        self.token.reset_timed_out();

        if self.link.is_none() {
            let budget = TimeoutBudget::new(self.timeout);
            match self.sync_link(&budget)? {
                Some(link) => self.link = Some(link),
                None => return Ok(()), // canceled
            }
        }

        let reply_port = self
            .reply_socket
            .as_ref()
            .map(ReplySocket::port)
            .ok_or_else(|| ComsError::Creation("requester is not initialized".to_string()))?;

        let app = self.ctx.app();
        let envelope = Envelope::Request {
            app_name: app.name.clone(),
            app_id: app.id,
            endpoint: app.endpoint.to_string(),
            reply_port,
        };

        let link = self.link.as_mut().expect("link was just synchronized");
        if let Err(err) = link.send_only(&envelope, payload) {
            self.link = None;
            return Err(err);
        }
        Ok(())
    }

    /// Block, bounded by the configured timeout, for exactly one
    /// RESPONSE envelope; any other type yields null.
    ///
    /// A timeout resets the link so the next `send()` re-synchronizes.
    pub fn receive(&mut self) -> Result<Option<Bytes>> {
        self.token.reset_timed_out();
        let socket = self
            .reply_socket
            .as_ref()
            .ok_or_else(|| ComsError::Creation("requester is not initialized".to_string()))?;
        let deadline = Deadline::new(self.timeout);

        match socket.recv(deadline, &self.token)? {
            Polled::Ready((route, message)) => {
                if message.len() < 2 {
                    return Err(ComsError::Malformed(
                        "reply message is missing its envelope frame".to_string(),
                    ));
                }
                match Envelope::decode(&message[1])? {
                    Envelope::Response { .. } => {
                        route.ack_ok();
                        Ok(Some(message.get(2).cloned().unwrap_or_default()))
                    }
                    Envelope::Cancel => {
                        self.token.cancel();
                        self.state.set(ChannelState::Canceled);
                        route.ack_ok();
                        Ok(None)
                    }
                    _ => {
                        route.ack_ok();
                        Ok(None)
                    }
                }
            }
            Polled::Stopped => {
                if self.token.is_canceled() {
                    self.state.set(ChannelState::Canceled);
                }
                Ok(None)
            }
            Polled::TimedOut => {
                self.token.mark_timed_out();
                // The unanswered link socket is unusable; force a fresh
                // synchronization on the next send.
                self.link = None;
                Ok(None)
            }
            Polled::Closed => Ok(None),
        }
    }

    /// Cancel the requester, unblocking a receive in another thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this requester.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    pub fn has_timed_out(&self) -> bool {
        self.token.has_timed_out()
    }

    /// Release the sockets and the leased reply port; join the liveness
    /// watcher. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(socket) = self.reply_socket.take() {
            socket.close();
            self.ctx.cancels().deregister(&self.token);
            self.registered = false;
        }
        self.link = None;
    }
}
