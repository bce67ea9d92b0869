use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use troupe_wire::Multipart;
use tracing::info;

use crate::cancel::CancelToken;
use crate::context::{channel_identity, channel_key, Context, DirectoryError, POLL_INTERVAL};
use crate::error::{ComsError, Result};
use crate::poll::{Deadline, Polled};
use crate::rpc::{interpret, Inbound, Request, ResponderAdvert, KEY_PREFIX};
use crate::socket::{ReplyRoute, ReplySocket};
use crate::state::{ChannelState, StateCell};

#[derive(Default)]
struct QueueInner {
    items: Mutex<VecDeque<(ReplyRoute, Multipart)>>,
    available: Condvar,
}

/// In-process work queue between the router front and its workers.
#[derive(Clone, Default)]
pub(crate) struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    fn push(&self, item: (ReplyRoute, Multipart)) {
        self.inner.items.lock().unwrap().push_back(item);
        self.inner.available.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<(ReplyRoute, Multipart)> {
        let items = self.inner.items.lock().unwrap();
        let (mut items, _) = self
            .inner
            .available
            .wait_timeout_while(items, timeout, |items| items.is_empty())
            .unwrap();
        items.pop_front()
    }
}

/// Scale-out front door for one logical responder.
///
/// Accepts requests from many requesters on one advertised reply socket
/// and relays them in-process to whichever attached worker next calls
/// `receive()`. Each request is processed by exactly one worker; no
/// ordering is guaranteed across workers. Replies travel back through the
/// return path embedded in each request.
pub struct Router {
    ctx: Arc<Context>,
    name: String,
    key: String,
    identity: String,
    state: StateCell,
    token: CancelToken,
    front: Option<ReplySocket>,
    queue: WorkQueue,
    poll_interval: Duration,
    advertised: bool,
    registered: bool,
}

impl Router {
    /// Create an empty router. No sockets exist until `init()`.
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
            front: None,
            queue: WorkQueue::default(),
            poll_interval: POLL_INTERVAL,
            advertised: false,
            registered: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_poll_interval(&mut self, interval: Duration) {
        self.poll_interval = interval;
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// The leased port the front door is bound on, once initialized.
    pub fn port(&self) -> Option<u16> {
        self.front.as_ref().map(ReplySocket::port)
    }

    /// Bind the front door and advertise it exactly like a basic
    /// responder — requesters cannot tell the difference.
    pub fn init(&mut self) -> Result<()> {
        if self.state.is_ready() {
            return Ok(());
        }
        self.state.set(ChannelState::Handshaking);

        let front = ReplySocket::bind(
            self.ctx.lessor(),
            Some(self.identity.clone()),
            self.poll_interval,
        )?;

        let advert = serde_json::to_string(&ResponderAdvert { port: front.port() })
            .expect("advert serialization cannot fail");
        if let Err(err) = self.ctx.directory().store(&self.key, &advert) {
            front.close();
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

        info!(name = %self.name, port = front.port(), "responder router ready");
        self.front = Some(front);
        self.state.set(ChannelState::Ready);
        Ok(())
    }

    /// Attach a worker consuming from this router's queue.
    pub fn worker(&self) -> RouterWorker {
        RouterWorker {
            queue: self.queue.clone(),
            token: CancelToken::new(),
            timeout: None,
            poll_interval: self.poll_interval,
        }
    }

    /// Relay inbound messages onto the worker queue until canceled.
    ///
    /// Blocking; meant to own its thread. `cancel()` unblocks it within
    /// one poll interval.
    pub fn run(&self) -> Result<()> {
        let front = self
            .front
            .as_ref()
            .ok_or_else(|| ComsError::Creation("router is not initialized".to_string()))?;

        loop {
            match front.recv(Deadline::forever(), &self.token)? {
                Polled::Ready(item) => self.queue.push(item),
                Polled::Stopped => {
                    self.state.set(ChannelState::Canceled);
                    return Ok(());
                }
                Polled::TimedOut | Polled::Closed => continue,
            }
        }
    }

    /// Cancel the relay loop.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this router.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    /// Release the front socket, its leased port and the advertisement.
    /// Idempotent.
    pub fn terminate(&mut self) {
        if let Some(front) = self.front.take() {
            if self.advertised {
                let _ = self.ctx.directory().remove(&self.key);
                self.advertised = false;
            }
            front.close();
            self.ctx.cancels().deregister(&self.token);
            self.registered = false;
        }
    }
}

/// One of the N workers behind a [`Router`].
pub struct RouterWorker {
    queue: WorkQueue,
    token: CancelToken,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl RouterWorker {
    /// Bound each receive. `None` blocks forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Block for one relayed request.
    pub fn receive(&mut self) -> Result<Option<Request>> {
        self.token.reset_timed_out();
        let deadline = Deadline::new(self.timeout);

        loop {
            if self.token.should_stop() {
                return Ok(None);
            }
            match self.queue.pop_timeout(self.poll_interval) {
                Some((route, message)) => match interpret(&route, message, self.timeout)? {
                    Inbound::Request(request) => return Ok(Some(request)),
                    Inbound::Canceled => {
                        self.token.cancel();
                        return Ok(None);
                    }
                },
                None => {
                    if deadline.expired() {
                        self.token.mark_timed_out();
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Cancel this worker, unblocking a receive in another thread.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// A handle other threads can use to cancel this worker.
    pub fn cancel_handle(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_canceled()
    }

    pub fn has_timed_out(&self) -> bool {
        self.token.has_timed_out()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::thread;

    use super::*;
    use crate::rpc::Requester;
    use crate::testutil::TestWorld;

    #[test]
    fn requests_fan_out_across_workers() {
        let world = TestWorld::new();
        let server_ctx = world.context("server", 1);

        let mut router = Router::create(server_ctx.clone(), "compute");
        router.init().unwrap();
        let router_cancel = router.cancel_handle();

        let (done_tx, done_rx) = mpsc::channel();
        let mut worker_threads = Vec::new();
        let mut worker_cancels = Vec::new();
        for worker_id in 0..3u32 {
            let mut worker = router.worker();
            worker_cancels.push(worker.cancel_handle());
            let done = done_tx.clone();
            worker_threads.push(thread::spawn(move || loop {
                match worker.receive().unwrap() {
                    Some(mut request) => {
                        request.reply(format!("worker-{worker_id}").as_bytes()).unwrap();
                        done.send(worker_id).unwrap();
                    }
                    None => return,
                }
            }));
        }

        let relay = thread::spawn(move || {
            router.run().unwrap();
            router
        });

        // Three clients, one request each.
        let mut client_threads = Vec::new();
        for client_id in 0..3u32 {
            let client_ctx = world.context("client", 10 + client_id);
            let peer = world.peer_of(&server_ctx);
            client_threads.push(thread::spawn(move || {
                let mut requester = Requester::create(client_ctx, peer, "compute");
                requester.set_timeout(Some(Duration::from_secs(5)));
                requester.init().unwrap();
                requester.send(b"work").unwrap();
                let response = requester.receive().unwrap().unwrap();
                requester.terminate();
                response
            }));
        }

        let mut responses = HashSet::new();
        for handle in client_threads {
            responses.insert(String::from_utf8(handle.join().unwrap().to_vec()).unwrap());
        }
        assert_eq!(done_rx.iter().take(3).count(), 3);
        assert!(!responses.is_empty());

        router_cancel.cancel();
        let mut router = relay.join().unwrap();
        router.terminate();

        for cancel in worker_cancels {
            cancel.cancel();
        }
        for handle in worker_threads {
            handle.join().unwrap();
        }
    }

    #[test]
    fn worker_timeout_sets_flag() {
        let world = TestWorld::new();
        let ctx = world.context("server", 1);

        let mut router = Router::create(ctx, "idle");
        router.init().unwrap();

        let mut worker = router.worker();
        worker.set_timeout(Some(Duration::from_millis(80)));

        assert!(worker.receive().unwrap().is_none());
        assert!(worker.has_timed_out());
        assert!(!worker.is_canceled());

        router.terminate();
    }

    #[test]
    fn cancel_unblocks_run() {
        let world = TestWorld::new();
        let ctx = world.context("server", 1);

        let mut router = Router::create(ctx, "relay");
        router.init().unwrap();
        let cancel = router.cancel_handle();

        let relay = thread::spawn(move || {
            router.run().unwrap();
            router
        });

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();

        let mut router = relay.join().unwrap();
        assert!(router.is_canceled());
        assert_eq!(router.state(), ChannelState::Canceled);
        router.terminate();
    }
}
