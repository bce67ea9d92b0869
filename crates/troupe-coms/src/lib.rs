//! Inter-process communication channels for orchestrated applications.
//!
//! This is the coms layer of the troupe orchestration system: worker
//! applications launched by a server discover each other and exchange
//! data over the channels in this crate.
//!
//! - [`stream`]: publish/subscribe channels with an optional N-subscriber
//!   synchronization barrier and an explicit end-of-stream marker.
//! - [`rpc`]: identity-addressed half-duplex request/reply channels,
//!   including a scale-out router backed by several workers.
//! - [`Exchange`]: the bounded send-then-receive primitive the channels
//!   build their handshakes and replies on.
//! - [`cancel`]: the cross-thread cancellation and liveness machinery
//!   that unblocks otherwise-uninterruptible blocking receives.
//!
//! Channels are wired into their process through a [`Context`] carrying
//! the application's identity and the external collaborators: the
//! discovery store, the port allocator and the status broadcast.
//! In-memory implementations live in [`mem`]; clients speaking the wire
//! protocol to the orchestration server live in [`remote`].

pub mod cancel;
pub mod context;
pub mod error;
pub mod exchange;
pub mod mem;
mod poll;
pub mod remote;
pub mod rpc;
mod socket;
pub mod state;
pub mod stream;

#[cfg(test)]
mod testutil;

pub use cancel::{CancelRegistry, CancelToken};
pub use context::{
    AppIdentity, AppState, Context, Directory, DirectoryError, PeerApp, StatusEvent, StatusFeed,
    POLL_INTERVAL,
};
pub use error::{ComsError, Result};
pub use exchange::Exchange;
pub use remote::{RemoteDirectory, RemoteLessor, RemoteStatusFeed};
pub use rpc::{Request, Requester, Responder, Router, RouterWorker};
pub use state::ChannelState;
pub use stream::{Publisher, Subscriber};
