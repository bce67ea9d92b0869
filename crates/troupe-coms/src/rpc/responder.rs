use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::cancel::CancelToken;
use crate::context::{channel_identity, channel_key, Context, DirectoryError, POLL_INTERVAL};
use crate::error::{ComsError, Result};
use crate::poll::{Deadline, Polled};
use crate::rpc::{interpret, Inbound, Request, ResponderAdvert, KEY_PREFIX};
use crate::socket::ReplySocket;
use crate::state::{ChannelState, StateCell};

/// The answering side of an RPC channel.
///
/// Binds a reply socket on a leased port and registers it in the
/// discovery store under a key derived from the logical responder name
/// and the owner application id.
pub struct Responder {
    ctx: Arc<Context>,
    name: String,
    key: String,
    identity: String,
    state: StateCell,
    token: CancelToken,
    socket: Option<ReplySocket>,
    timeout: Option<Duration>,
    poll_interval: Duration,
    advertised: bool,
    registered: bool,
}

impl Responder {
    /// Create an empty responder. No sockets exist until `init()`.
    pub fn create(ctx: Arc<Context>, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = channel_key(KEY_PREFIX, &name);
        let identity = channel_identity(&key, ctx.app().id);
        Self {
            ctx,
            name,
            key,
            identity,
            state: StateCell::new(),
            token: CancelToken::new(),
            socket: None,
            timeout: None,
            poll_interval: POLL_INTERVAL,
            advertised: false,
            registered: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound each receive. `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// The leased port the responder is bound on, once initialized.
    pub fn port(&self) -> Option<u16> {
        self.socket.as_ref().map(ReplySocket::port)
    }

    /// Bind and advertise. Fails with a creation error if a responder
    /// with the same logical name is already registered.
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        self.state.set(ChannelState::Handshaking);

        let socket = ReplySocket::bind(
            self.ctx.lessor(),
            Some(self.identity.clone()),
            self.poll_interval,
        )?;

        let advert = serde_json::to_string(&ResponderAdvert {
            port: socket.port(),
        })
        .expect("advert serialization cannot fail");

        if let Err(err) = self.ctx.directory().store(&self.key, &advert) {
            socket.close();
            return Err(match err {
                DirectoryError::AlreadyExists(_) => ComsError::Creation(format!(
                    "a responder named '{}' already exists",
                    self.name
                )),
                other => other.into(),
            });
        }
        self.advertised = true;

        if !self.registered {
            self.ctx.cancels().register(&self.token);
            self.registered = true;
        }

        info!(name = %self.name, port = socket.port(), "responder ready");
        self.socket = Some(socket);
        self.state.set(ChannelState::Ready);
        Ok(())
    }

    /// Block for one request.
    ///
    /// Returns `Ok(None)` when canceled or when the configured timeout
    /// elapsed; the flags say which. SYNC probes are answered below this
    /// level and never surface here.
    pub fn receive(&mut self) -> Result<Option<Request>> {
        self.token.reset_timed_out();
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| ComsError::Creation("responder is not initialized".to_string()))?;
        let deadline = Deadline::new(self.timeout);

        match socket.recv(deadline, &self.token)? {
            Polled::Ready((route, message)) => match interpret(&route, message, self.timeout)? {
                Inbound::Request(request) => Ok(Some(request)),
                Inbound::Canceled => {
                    self.token.cancel();
                    self.state.set(ChannelState::Canceled);
                    Ok(None)
                }
            },
            Polled::Stopped => {
                if self.token.is_canceled() {
                    self.state.set(ChannelState::Canceled);
                }
                Ok(None)
            }
            Polled::TimedOut => {
                self.token.mark_timed_out();
                Ok(None)
            }
            Polled::Closed => Ok(None),
        }
    }

    /// Cancel the responder, unblocking a receive in another thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this responder.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    pub fn has_timed_out(&self) -> bool {
        self.token.has_timed_out()
    }

    /// Release the socket, the leased port and the advertisement.
    /// Idempotent, safe to call after cancellation.
    pub fn terminate(&mut self) {
        if let Some(socket) = self.socket.take() {
            if self.advertised {
                let _ = self.ctx.directory().remove(&self.key);
                self.advertised = false;
            }
            socket.close();
            self.ctx.cancels().deregister(&self.token);
            self.registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use troupe_transport::Endpoint;
    use troupe_wire::Envelope;

    use super::*;
    use crate::exchange::Exchange;
    use crate::testutil::test_context;

    #[test]
    fn duplicate_name_is_creation_error() {
        let ctx = test_context(1);

        let mut first = Responder::create(ctx.clone(), "control");
        first.init().unwrap();

        let mut second = Responder::create(ctx, "control");
        assert!(matches!(second.init(), Err(ComsError::Creation(_))));

        first.terminate();
    }

    #[test]
    fn name_free_again_after_terminate() {
        let ctx = test_context(1);

        let mut first = Responder::create(ctx.clone(), "control");
        first.init().unwrap();
        first.terminate();

        let mut second = Responder::create(ctx, "control");
        second.init().unwrap();
        second.terminate();
    }

    #[test]
    fn inbound_cancel_envelope_unblocks() {
        let ctx = test_context(1);
        let mut responder = Responder::create(ctx, "cancelable");
        responder.init().unwrap();

        let endpoint = Endpoint::new("127.0.0.1", responder.port().unwrap());
        let identity = responder.identity.clone();
        let canceler = thread::spawn(move || {
            let mut exchange = Exchange::new(endpoint, Some(identity))
                .with_timeout(Some(Duration::from_secs(2)));
            exchange.request(&Envelope::Cancel, &[]).unwrap();
        });

        let received = responder.receive().unwrap();
        assert!(received.is_none());
        assert!(responder.is_canceled());

        canceler.join().unwrap();
        responder.terminate();
    }

    #[test]
    fn receive_timeout_sets_flag_only() {
        let ctx = test_context(1);
        let mut responder = Responder::create(ctx, "quiet");
        responder.init().unwrap();
        responder.set_timeout(Some(Duration::from_millis(80)));

        let received = responder.receive().unwrap();
        assert!(received.is_none());
        assert!(responder.has_timed_out());
        assert!(!responder.is_canceled());
        assert_eq!(responder.state(), ChannelState::Ready);

        responder.terminate();
    }

    #[test]
    fn terminate_is_idempotent() {
        let ctx = test_context(1);
        let mut responder = Responder::create(ctx, "twice");
        responder.init().unwrap();
        responder.terminate();
        responder.terminate();
    }
}
