//! Publish/subscribe stream channels with a subscriber barrier.
//!
//! A [`Publisher`] binds a broadcast socket on a leased port and
//! advertises it under a key derived from its logical name; any number of
//! [`Subscriber`]s look the key up, synchronize against the producer so
//! that no early message is silently dropped, and consume the stream
//! until its explicit end marker. A publisher configured with an expected
//! subscriber count blocks in [`Publisher::wait_for_subscribers`] until
//! that many subscribers announced themselves.

pub mod publisher;
pub mod subscriber;

pub use publisher::Publisher;
pub use subscriber::Subscriber;

use serde::{Deserialize, Serialize};

use crate::context::channel_key;

/// Key prefix for stream advertisements in the discovery store.
pub const KEY_PREFIX: &str = "stream-8a40f2d5-91c3-4e76-a2b8-0d5c1e9b63a7";

/// Advertisement a publisher registers under its discovery key.
///
/// Carries both the expected subscriber count and an explicit sync flag;
/// a subscriber handshakes whenever either asks for it.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StreamAdvert {
    pub port: u16,
    pub n_subscribers: u32,
    pub sync: bool,
}

/// The barrier responder is advertised like an RPC responder, under a
/// name derived from the stream name.
pub(crate) fn barrier_key(name: &str) -> String {
    channel_key(crate::rpc::KEY_PREFIX, &format!("stream:{name}"))
}
