use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use troupe_transport::{Endpoint, PortLessor};

use crate::cancel::CancelRegistry;

/// Default bounded-poll interval for blocking receives.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identity of one application instance in the orchestration system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub name: String,
    pub id: u32,
    pub endpoint: Endpoint,
}

impl AppIdentity {
    pub fn new(name: impl Into<String>, id: u32, endpoint: Endpoint) -> Self {
        Self {
            name: name.into(),
            id,
            endpoint,
        }
    }
}

/// Application lifecycle states carried by the status broadcast.
///
/// Encoded as bit values so that a history of visited states fits in one
/// integer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Success,
    Stopped,
    Killed,
    Failure,
}

impl AppState {
    pub fn code(self) -> u32 {
        match self {
            AppState::Unknown => 0,
            AppState::Starting => 1,
            AppState::Running => 2,
            AppState::Stopping => 4,
            AppState::Success => 8,
            AppState::Stopped => 16,
            AppState::Killed => 32,
            AppState::Failure => 64,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => AppState::Starting,
            2 => AppState::Running,
            4 => AppState::Stopping,
            8 => AppState::Success,
            16 => AppState::Stopped,
            32 => AppState::Killed,
            64 => AppState::Failure,
            _ => AppState::Unknown,
        }
    }

    /// Terminal states: no further transition occurs after reaching one.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppState::Success | AppState::Stopped | AppState::Killed | AppState::Failure
        )
    }
}

/// One entry of the status broadcast.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub id: u32,
    pub name: String,
    pub state: AppState,
    pub past_states: u32,
    pub exit_code: Option<i32>,
}

impl StatusEvent {
    pub fn new(id: u32, name: impl Into<String>, state: AppState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            past_states: state.code(),
            exit_code: None,
        }
    }
}

/// Errors reported by the discovery store.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("key '{0}' is already registered")]
    AlreadyExists(String),

    #[error("key '{0}' is not registered")]
    NotFound(String),

    #[error("directory backend error: {0}")]
    Backend(String),
}

/// The discovery/key-value rendezvous store, scoped to one owner
/// application id.
///
/// A producer advertises its channel address under a well-known key; a
/// peer unaware of the address looks it up later. The store itself lives
/// outside this layer and provides its own serialization.
pub trait Directory: Send + Sync {
    /// Register a key. Fails if the key is already present.
    fn store(&self, key: &str, value: &str) -> Result<(), DirectoryError>;

    /// Look a key up.
    fn get(&self, key: &str) -> Result<Option<String>, DirectoryError>;

    /// Remove a key.
    fn remove(&self, key: &str) -> Result<(), DirectoryError>;
}

/// The external status broadcast, consumed for liveness checking.
pub trait StatusFeed: Send + Sync {
    /// Subscribe to all subsequent status events.
    fn subscribe(&self) -> mpsc::Receiver<StatusEvent>;
}

/// Everything a channel needs about the process it lives in: the
/// application's own identity plus handles to the external collaborators
/// and the process-wide cancellation registry.
///
/// Passed explicitly into every channel constructor; there are no
/// globals, so tests can build fully isolated contexts.
#[derive(Clone)]
pub struct Context {
    app: AppIdentity,
    directory: Arc<dyn Directory>,
    lessor: Arc<dyn PortLessor>,
    status: Arc<dyn StatusFeed>,
    cancels: CancelRegistry,
}

impl Context {
    pub fn new(
        app: AppIdentity,
        directory: Arc<dyn Directory>,
        lessor: Arc<dyn PortLessor>,
        status: Arc<dyn StatusFeed>,
    ) -> Arc<Self> {
        Arc::new(Self {
            app,
            directory,
            lessor,
            status,
            cancels: CancelRegistry::new(),
        })
    }

    /// This application's identity.
    pub fn app(&self) -> &AppIdentity {
        &self.app
    }

    /// The discovery store scoped to this application.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// The leased-port allocator for this application.
    pub fn lessor(&self) -> &Arc<dyn PortLessor> {
        &self.lessor
    }

    /// The status broadcast feed.
    pub fn status(&self) -> &Arc<dyn StatusFeed> {
        &self.status
    }

    /// The process-wide cancellation registry.
    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Cancel every registered channel in this context.
    pub fn cancel_all(&self) {
        self.cancels.cancel_all();
    }
}

/// Handle to another application hosting the remote end of a channel:
/// its identity plus a view of *its* discovery store.
#[derive(Clone)]
pub struct PeerApp {
    pub name: String,
    pub id: u32,
    pub endpoint: Endpoint,
    directory: Arc<dyn Directory>,
}

impl PeerApp {
    pub fn new(
        name: impl Into<String>,
        id: u32,
        endpoint: Endpoint,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            name: name.into(),
            id,
            endpoint,
            directory,
        }
    }

    /// The peer application's discovery store.
    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }
}

/// Discovery key for a channel kind and logical name.
pub(crate) fn channel_key(kind_prefix: &str, name: &str) -> String {
    format!("{kind_prefix}-{name}")
}

/// Routing identity of a channel instance: the key qualified by the owner
/// application id. Doubles as pub/sub topic prefix and RPC routing key.
pub(crate) fn channel_identity(key: &str, owner_id: u32) -> String {
    format!("{key}-{owner_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_roundtrip() {
        for state in [
            AppState::Starting,
            AppState::Running,
            AppState::Stopping,
            AppState::Success,
            AppState::Stopped,
            AppState::Killed,
            AppState::Failure,
        ] {
            assert_eq!(AppState::from_code(state.code()), state);
        }
        assert_eq!(AppState::from_code(12345), AppState::Unknown);
    }

    #[test]
    fn terminal_states() {
        assert!(AppState::Success.is_terminal());
        assert!(AppState::Stopped.is_terminal());
        assert!(AppState::Killed.is_terminal());
        assert!(AppState::Failure.is_terminal());
        assert!(!AppState::Running.is_terminal());
        assert!(!AppState::Starting.is_terminal());
    }

    #[test]
    fn key_and_identity_convention() {
        let key = channel_key("stream-abc", "positions");
        assert_eq!(key, "stream-abc-positions");
        assert_eq!(channel_identity(&key, 12), "stream-abc-positions-12");
    }
}
