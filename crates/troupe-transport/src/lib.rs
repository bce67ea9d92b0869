//! TCP transport layer for troupe channels.
//!
//! Channels do not pick their own ports: every listening socket is bound
//! through a leased port checked out from an allocator and returned exactly
//! once on teardown. This crate provides the endpoint type, the
//! request/bind/mark-unavailable loop, and blocking connect helpers.

pub mod endpoint;
pub mod error;
pub mod lease;
pub mod tcp;

pub use endpoint::Endpoint;
pub use error::{Result, TransportError};
pub use lease::{bind_leased, LeasedPort, PortLessor};
pub use tcp::{connect, connect_timeout, set_io_timeouts};
