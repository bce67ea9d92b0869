use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::debug;

use crate::context::{StatusFeed, POLL_INTERVAL};

#[derive(Default)]
struct TokenInner {
    canceled: AtomicBool,
    ended: AtomicBool,
    timed_out: AtomicBool,
    peer_lost: AtomicBool,
}

/// Level-triggered cancellation token shared between a channel and the
/// threads that may need to unblock it.
///
/// Every blocking receive polls in bounded intervals and observes this
/// token between polls, so `cancel()` unblocks any in-progress or future
/// receive within one polling interval. Cancellation is one-shot: once set
/// it stays visible and never auto-resets.
///
/// The token also latches the two other explanations for a null receive —
/// end-of-stream and timeout — which are mutually exclusive with
/// cancellation.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the channel. Callable from any thread, idempotent.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    /// True once `cancel()` has been called.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// True once the stream's explicit end marker was observed.
    pub fn has_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// True if the last receive ran out of time.
    pub fn has_timed_out(&self) -> bool {
        self.inner.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_ended(&self) {
        self.inner.ended.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_timed_out(&self) {
        self.inner.timed_out.store(true, Ordering::SeqCst);
    }

    /// Each receive starts with a clean timeout flag; the flag describes
    /// the most recent call.
    pub(crate) fn reset_timed_out(&self) {
        self.inner.timed_out.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_peer_lost(&self) {
        self.inner.peer_lost.store(true, Ordering::SeqCst);
    }

    pub(crate) fn peer_lost(&self) -> bool {
        self.inner.peer_lost.load(Ordering::SeqCst)
    }

    /// True when a poll loop must give up and report a null receive:
    /// canceled, or the watched peer reached a terminal state.
    pub(crate) fn should_stop(&self) -> bool {
        self.is_canceled() || self.peer_lost()
    }

    fn downgrade(&self) -> Weak<TokenInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .field("ended", &self.has_ended())
            .field("timed_out", &self.has_timed_out())
            .field("peer_lost", &self.peer_lost())
            .finish()
    }
}

/// Process-wide registry of live cancelable channels.
///
/// Channels register on `init()` and deregister on `terminate()`; a single
/// [`CancelRegistry::cancel_all`] unblocks every outstanding receive in
/// the process (for example at shutdown). The registry is passed into
/// channel constructors through the [`crate::Context`], so each test can
/// use an isolated one.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<Vec<Weak<TokenInner>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, token: &CancelToken) {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.retain(|weak| weak.strong_count() > 0);
        tokens.push(token.downgrade());
    }

    pub(crate) fn deregister(&self, token: &CancelToken) {
        let target = token.downgrade();
        self.tokens
            .lock()
            .unwrap()
            .retain(|weak| weak.strong_count() > 0 && !Weak::ptr_eq(weak, &target));
    }

    /// Cancel every registered channel.
    pub fn cancel_all(&self) {
        let tokens = self.tokens.lock().unwrap();
        debug!(count = tokens.len(), "canceling all registered channels");
        for weak in tokens.iter() {
            if let Some(inner) = weak.upgrade() {
                inner.canceled.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Number of live registrations.
    pub fn active(&self) -> usize {
        self.tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// Background thread watching the status broadcast for one application.
///
/// A terminal state for the watched id latches peer-loss on the token,
/// which makes a blocked receive return null as if canceled. The thread is
/// joined during `terminate()`.
pub(crate) struct LivenessWatcher {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LivenessWatcher {
    pub fn watch(feed: &Arc<dyn StatusFeed>, app_id: u32, token: CancelToken) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let events = feed.subscribe();
        let thread_shutdown = Arc::clone(&shutdown);

        let handle = std::thread::spawn(move || loop {
            if thread_shutdown.load(Ordering::SeqCst) {
                return;
            }
            match events.recv_timeout(POLL_INTERVAL) {
                Ok(event) => {
                    if event.id == app_id && event.state.is_terminal() {
                        debug!(app_id, state = ?event.state, "watched application reached terminal state");
                        token.mark_peer_lost();
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the watcher and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for LivenessWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::context::{AppState, StatusEvent};
    use crate::mem::StatusHub;

    #[test]
    fn cancel_is_level_triggered_and_idempotent() {
        let token = CancelToken::new();
        assert!(!token.is_canceled());

        token.cancel();
        token.cancel();
        assert!(token.is_canceled());
        assert!(token.should_stop());
    }

    #[test]
    fn cancel_visible_across_threads() {
        let token = CancelToken::new();
        let shared = token.clone();

        let canceler = thread::spawn(move || shared.cancel());
        canceler.join().unwrap();

        assert!(token.is_canceled());
    }

    #[test]
    fn timeout_flag_resets_per_receive() {
        let token = CancelToken::new();
        token.mark_timed_out();
        assert!(token.has_timed_out());

        token.reset_timed_out();
        assert!(!token.has_timed_out());
    }

    #[test]
    fn registry_cancels_all_registered() {
        let registry = CancelRegistry::new();
        let first = CancelToken::new();
        let second = CancelToken::new();

        registry.register(&first);
        registry.register(&second);
        assert_eq!(registry.active(), 2);

        registry.cancel_all();
        assert!(first.is_canceled());
        assert!(second.is_canceled());
    }

    #[test]
    fn deregistered_token_not_canceled() {
        let registry = CancelRegistry::new();
        let kept = CancelToken::new();
        let removed = CancelToken::new();

        registry.register(&kept);
        registry.register(&removed);
        registry.deregister(&removed);
        assert_eq!(registry.active(), 1);

        registry.cancel_all();
        assert!(kept.is_canceled());
        assert!(!removed.is_canceled());
    }

    #[test]
    fn watcher_latches_terminal_state() {
        let hub = Arc::new(StatusHub::new());
        let feed: Arc<dyn StatusFeed> = hub.clone();
        let token = CancelToken::new();

        let mut watcher = LivenessWatcher::watch(&feed, 42, token.clone());

        hub.publish(StatusEvent::new(42, "worker", AppState::Running));
        assert!(!token.peer_lost());

        hub.publish(StatusEvent::new(42, "worker", AppState::Failure));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !token.peer_lost() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(token.peer_lost());
        assert!(!token.is_canceled());

        watcher.stop();
    }

    #[test]
    fn watcher_ignores_other_applications() {
        let hub = Arc::new(StatusHub::new());
        let feed: Arc<dyn StatusFeed> = hub.clone();
        let token = CancelToken::new();

        let mut watcher = LivenessWatcher::watch(&feed, 1, token.clone());
        hub.publish(StatusEvent::new(2, "other", AppState::Killed));

        thread::sleep(Duration::from_millis(50));
        assert!(!token.peer_lost());

        watcher.stop();
    }
}
