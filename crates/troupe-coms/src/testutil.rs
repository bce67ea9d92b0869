//! Shared fixtures for channel tests: one in-memory world of
//! collaborators and contexts built on top of it.

use std::sync::Arc;

use troupe_transport::Endpoint;

use crate::context::{AppIdentity, Context, PeerApp};
use crate::mem::{MemoryLessor, MemoryStore, StatusHub};

pub(crate) struct TestWorld {
    store: Arc<MemoryStore>,
    lessor: Arc<MemoryLessor>,
    hub: Arc<StatusHub>,
}

impl TestWorld {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            lessor: MemoryLessor::ephemeral(),
            hub: Arc::new(StatusHub::new()),
        }
    }

    pub fn context(&self, name: &str, id: u32) -> Arc<Context> {
        Context::new(
            AppIdentity::new(name, id, Endpoint::new("127.0.0.1", 7000)),
            self.store.scoped(id),
            self.lessor.clone(),
            self.hub.clone(),
        )
    }

    /// A peer handle for the application behind `ctx`, the way another
    /// process would see it.
    pub fn peer_of(&self, ctx: &Arc<Context>) -> PeerApp {
        let app = ctx.app();
        PeerApp::new(
            app.name.clone(),
            app.id,
            app.endpoint.clone(),
            ctx.directory().clone(),
        )
    }

    /// The shared status broadcaster.
    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }
}

/// An isolated context for tests that need no peer.
pub(crate) fn test_context(id: u32) -> Arc<Context> {
    TestWorld::new().context("app", id)
}
