//! In-memory implementations of the external collaborators.
//!
//! Single-process deployments and tests wire channels together with these
//! instead of the orchestration server: one shared [`MemoryStore`] playing
//! the rendezvous store, a [`MemoryLessor`] per application for port
//! leases, and a [`StatusHub`] broadcasting lifecycle events.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use troupe_transport::{PortLessor, TransportError};

use crate::context::{Directory, DirectoryError, StatusEvent, StatusFeed};

/// Shared key-value store holding the entries of every application.
///
/// Keys are scoped per owner application id, matching the server's store:
/// two applications may register the same key without clashing, and a
/// peer looks a key up in the owner's scope.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(u32, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A [`Directory`] view scoped to one application id.
    pub fn scoped(self: &Arc<Self>, app_id: u32) -> Arc<dyn Directory> {
        Arc::new(ScopedDirectory {
            store: Arc::clone(self),
            app_id,
        })
    }
}

struct ScopedDirectory {
    store: Arc<MemoryStore>,
    app_id: u32,
}

impl Directory for ScopedDirectory {
    fn store(&self, key: &str, value: &str) -> Result<(), DirectoryError> {
        let mut entries = self.store.entries.lock().unwrap();
        let entry_key = (self.app_id, key.to_string());
        if entries.contains_key(&entry_key) {
            return Err(DirectoryError::AlreadyExists(key.to_string()));
        }
        entries.insert(entry_key, value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, DirectoryError> {
        let entries = self.store.entries.lock().unwrap();
        Ok(entries.get(&(self.app_id, key.to_string())).cloned())
    }

    fn remove(&self, key: &str) -> Result<(), DirectoryError> {
        let mut entries = self.store.entries.lock().unwrap();
        match entries.remove(&(self.app_id, key.to_string())) {
            Some(_) => Ok(()),
            None => Err(DirectoryError::NotFound(key.to_string())),
        }
    }
}

struct LessorState {
    cursor: u16,
    unavailable: HashSet<u16>,
    leased: HashSet<u16>,
}

/// Port allocator scanning a fixed range.
///
/// Ports reported unavailable are skipped on later requests; released
/// ports become requestable again.
pub struct MemoryLessor {
    base: u16,
    count: u16,
    state: Mutex<LessorState>,
}

impl MemoryLessor {
    pub fn new(base: u16, count: u16) -> Arc<Self> {
        Arc::new(Self {
            base,
            count,
            state: Mutex::new(LessorState {
                cursor: 0,
                unavailable: HashSet::new(),
                leased: HashSet::new(),
            }),
        })
    }

    /// The range used when tests don't care about specific ports.
    pub fn ephemeral() -> Arc<Self> {
        Self::new(29000, 2000)
    }
}

impl PortLessor for MemoryLessor {
    fn request_port(&self) -> troupe_transport::Result<u16> {
        let mut state = self.state.lock().unwrap();
        for _ in 0..self.count {
            let port = self.base + state.cursor;
            state.cursor = (state.cursor + 1) % self.count;
            if state.unavailable.contains(&port) || state.leased.contains(&port) {
                continue;
            }
            state.leased.insert(port);
            return Ok(port);
        }
        Err(TransportError::NoPortAvailable)
    }

    fn set_unavailable(&self, port: u16) {
        let mut state = self.state.lock().unwrap();
        state.leased.remove(&port);
        state.unavailable.insert(port);
    }

    fn release_port(&self, port: u16) {
        self.state.lock().unwrap().leased.remove(&port);
    }
}

/// Fan-out status broadcaster.
///
/// Each subscriber gets every event published after it subscribed;
/// subscribers that went away are pruned on publish.
#[derive(Default)]
pub struct StatusHub {
    subscribers: Mutex<Vec<mpsc::Sender<StatusEvent>>>,
}

impl StatusHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcast one event to every live subscriber.
    pub fn publish(&self, event: StatusEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}

impl StatusFeed for StatusHub {
    fn subscribe(&self) -> mpsc::Receiver<StatusEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }
}
