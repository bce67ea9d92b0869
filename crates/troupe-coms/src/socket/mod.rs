//! Socket machinery shared by the channel implementations.
//!
//! Accept loops run non-blocking with a short poll so that shutdown flags
//! are observed promptly; reader threads use the channel poll interval as
//! their read timeout so a close or cancel is never more than one interval
//! away.

mod broadcast;
mod reply;
mod subscribe;

pub(crate) use broadcast::BroadcastSocket;
pub(crate) use reply::{ReplyRoute, ReplySocket};
pub(crate) use subscribe::SubscribeSocket;

use std::time::Duration;

pub(crate) const ACCEPT_POLL: Duration = Duration::from_millis(20);
