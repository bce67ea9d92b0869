//! Identity-addressed half-duplex RPC channels.
//!
//! A [`Responder`] binds a reply socket on a leased port and advertises it
//! under a key derived from its logical name; a [`Requester`] looks the
//! key up, synchronizes against the responder, and exchanges one request
//! for one response at a time. The [`Router`] variant presents one
//! logical responder backed by N concurrently-processing workers.

pub mod request;
pub mod requester;
pub mod responder;
pub mod router;

pub use request::Request;
pub use requester::Requester;
pub use responder::Responder;
pub use router::{Router, RouterWorker};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use troupe_wire::{Envelope, Multipart};

use crate::error::{ComsError, Result};
use crate::socket::ReplyRoute;

/// Key prefix for responder advertisements in the discovery store.
pub const KEY_PREFIX: &str = "responder-c4f81b62-7d35-49ab-8e10-2f6d9a0c47e1";

/// Advertisement a responder registers under its discovery key.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ResponderAdvert {
    pub port: u16,
}

pub(crate) enum Inbound {
    Request(Request),
    Canceled,
}

/// Interpret one queued message on a responder channel.
///
/// SYNC probes never reach this point (they are acknowledged at the
/// socket layer), so everything other than REQUEST and CANCEL is a
/// protocol fault.
pub(crate) fn interpret(
    route: &ReplyRoute,
    message: Multipart,
    reply_timeout: Option<Duration>,
) -> Result<Inbound> {
    if message.len() < 2 {
        return Err(ComsError::Malformed(
            "rpc message is missing its envelope frame".to_string(),
        ));
    }
    match Envelope::decode(&message[1])? {
        Envelope::Request {
            app_name,
            app_id,
            endpoint,
            reply_port,
        } => {
            let payload = message.get(2).cloned().ok_or_else(|| {
                ComsError::Malformed("request envelope without payload frame".to_string())
            })?;
            let second = message.get(3).cloned();
            let endpoint = endpoint.parse().map_err(|_| {
                ComsError::Malformed(format!("request carries invalid endpoint '{endpoint}'"))
            })?;
            Ok(Inbound::Request(Request::new(
                app_name,
                app_id,
                endpoint,
                reply_port,
                payload,
                second,
                reply_timeout,
            )))
        }
        Envelope::Cancel => {
            route.ack_ok();
            Ok(Inbound::Canceled)
        }
        other => Err(ComsError::Malformed(format!(
            "unexpected envelope type {} on responder channel",
            other.code()
        ))),
    }
}
