use std::time::Duration;

use bytes::Bytes;
use troupe_transport::Endpoint;
use troupe_wire::Envelope;

use crate::error::{ComsError, Result};
use crate::exchange::Exchange;

/// One request delivered by a responder.
///
/// Carries the payload plus enough of the caller's identity to reply to
/// its private reply socket directly, or to reconnect to the requester's
/// owning server and resolve the live instance.
pub struct Request {
    app_name: String,
    app_id: u32,
    endpoint: Endpoint,
    reply_port: u16,
    payload: Bytes,
    second: Option<Bytes>,
    reply_timeout: Option<Duration>,
    replied: bool,
}

impl Request {
    pub(crate) fn new(
        app_name: String,
        app_id: u32,
        endpoint: Endpoint,
        reply_port: u16,
        payload: Bytes,
        second: Option<Bytes>,
        reply_timeout: Option<Duration>,
    ) -> Self {
        Self {
            app_name,
            app_id,
            endpoint,
            reply_port,
            payload,
            second,
            reply_timeout,
            replied: false,
        }
    }

    /// The request payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The second payload part of a two-part request.
    pub fn second_part(&self) -> Option<&[u8]> {
        self.second.as_deref()
    }

    /// Name of the requesting application.
    pub fn requester_name(&self) -> &str {
        &self.app_name
    }

    /// Id of the requesting application.
    pub fn requester_id(&self) -> u32 {
        self.app_id
    }

    /// Endpoint of the server owning the requesting application.
    pub fn requester_server(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The requester's private reply socket.
    pub fn reply_endpoint(&self) -> Endpoint {
        self.endpoint.with_port(self.reply_port)
    }

    /// True once a reply was delivered.
    pub fn has_replied(&self) -> bool {
        self.replied
    }

    /// Deliver the reply over a short-lived exchange to the requester's
    /// reply socket; the socket is discarded afterward.
    ///
    /// Exactly one reply is expected per request: a second call fails
    /// fast instead of delivering twice.
    pub fn reply(&mut self, data: &[u8]) -> Result<()> {
        if self.replied {
            return Err(ComsError::AlreadyReplied);
        }
        let mut exchange =
            Exchange::new(self.reply_endpoint(), None).with_timeout(self.reply_timeout);
        exchange.request(
            &Envelope::Response {
                value: 0,
                message: None,
            },
            &[data],
        )?;
        self.replied = true;
        Ok(())
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("app_name", &self.app_name)
            .field("app_id", &self.app_id)
            .field("endpoint", &self.endpoint)
            .field("reply_port", &self.reply_port)
            .field("payload_len", &self.payload.len())
            .field("replied", &self.replied)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::new(
            "camera".to_string(),
            9,
            Endpoint::new("127.0.0.1", 7000),
            7105,
            Bytes::from_static(b"frame"),
            None,
            Some(Duration::from_millis(100)),
        )
    }

    #[test]
    fn caller_identity_exposed() {
        let request = request();
        assert_eq!(request.requester_name(), "camera");
        assert_eq!(request.requester_id(), 9);
        assert_eq!(request.requester_server().port(), 7000);
        assert_eq!(request.reply_endpoint().port(), 7105);
        assert_eq!(request.payload(), b"frame");
        assert!(request.second_part().is_none());
    }

    #[test]
    fn second_reply_fails_fast() {
        // Nothing listens on the reply endpoint, so the first reply fails
        // on connect and must NOT count as delivered.
        let mut request = request();
        assert!(request.reply(b"data").is_err());
        assert!(!request.has_replied());
    }
}
