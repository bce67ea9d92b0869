use std::collections::VecDeque;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use troupe_transport::Endpoint;
use troupe_wire::{MessageReader, Multipart, WireError};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::poll::{Deadline, Polled};

enum ReadStep {
    Message(Multipart),
    Idle,
    Closed,
}

/// Consumer side of a stream channel: one connection to the producer's
/// broadcast socket.
///
/// Carries a small pending buffer so the connection handshake can observe
/// that data is flowing without consuming the message it observed.
pub(crate) struct SubscribeSocket {
    reader: MessageReader<TcpStream>,
    pending: VecDeque<Multipart>,
    poll_interval: Duration,
}

impl SubscribeSocket {
    pub fn connect(endpoint: &Endpoint, poll_interval: Duration) -> Result<Self> {
        let stream = troupe_transport::connect(endpoint)?;
        troupe_transport::set_io_timeouts(&stream, Some(poll_interval), None)?;
        Ok(Self {
            reader: MessageReader::new(stream),
            pending: VecDeque::new(),
            poll_interval,
        })
    }

    fn step(&mut self) -> Result<ReadStep> {
        match self.reader.read_message() {
            Ok(message) => Ok(ReadStep::Message(message)),
            Err(err) if err.is_poll_timeout() => Ok(ReadStep::Idle),
            Err(WireError::ConnectionClosed) => Ok(ReadStep::Closed),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait up to `window` for any message to be observed. The message is
    /// kept and handed out by the next [`SubscribeSocket::recv`].
    pub fn probe(&mut self, window: Duration, token: &CancelToken) -> Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let deadline = Instant::now() + window;
        loop {
            if token.should_stop() {
                return Ok(false);
            }
            match self.step()? {
                ReadStep::Message(message) => {
                    self.pending.push_back(message);
                    return Ok(true);
                }
                ReadStep::Idle => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                }
                ReadStep::Closed => return Ok(false),
            }
        }
    }

    /// Wait for the next message, bounded by the deadline and observing
    /// the cancellation token every poll interval.
    pub fn recv(&mut self, deadline: Deadline, token: &CancelToken) -> Result<Polled<Multipart>> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(Polled::Ready(message));
        }
        loop {
            if token.should_stop() {
                return Ok(Polled::Stopped);
            }
            match self.step()? {
                ReadStep::Message(message) => return Ok(Polled::Ready(message)),
                ReadStep::Idle => {
                    if deadline.expired() {
                        return Ok(Polled::TimedOut);
                    }
                }
                ReadStep::Closed => return Ok(Polled::Closed),
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use troupe_wire::MessageWriter;

    use super::*;

    fn producer() -> (TcpListener, Endpoint) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Endpoint::new("127.0.0.1", port))
    }

    #[test]
    fn probe_keeps_observed_message() {
        let (listener, endpoint) = producer();

        let publisher = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = MessageWriter::new(stream);
            writer.send(&[b"id".as_ref(), b"probe-me"]).unwrap();
            stream_park(writer);
        });

        let token = CancelToken::new();
        let mut socket =
            SubscribeSocket::connect(&endpoint, Duration::from_millis(20)).unwrap();

        assert!(socket.probe(Duration::from_secs(2), &token).unwrap());

        // The observed message is delivered, not lost.
        match socket.recv(Deadline::forever(), &token).unwrap() {
            Polled::Ready(message) => assert_eq!(message[1].as_ref(), b"probe-me"),
            other => panic!("unexpected poll outcome: {other:?}"),
        }

        drop(socket);
        publisher.join().unwrap();
    }

    #[test]
    fn probe_times_out_on_silence() {
        let (listener, endpoint) = producer();
        let _keep = listener;

        let token = CancelToken::new();
        let mut socket =
            SubscribeSocket::connect(&endpoint, Duration::from_millis(20)).unwrap();

        assert!(!socket.probe(Duration::from_millis(80), &token).unwrap());
    }

    #[test]
    fn recv_reports_closed_connection() {
        let (listener, endpoint) = producer();

        let token = CancelToken::new();
        let mut socket =
            SubscribeSocket::connect(&endpoint, Duration::from_millis(20)).unwrap();

        let (stream, _) = listener.accept().unwrap();
        drop(stream);

        let polled = socket.recv(Deadline::forever(), &token).unwrap();
        assert!(matches!(polled, Polled::Closed));
    }

    #[test]
    fn recv_observes_cancel() {
        let (listener, endpoint) = producer();
        let _keep = listener;

        let token = CancelToken::new();
        let mut socket =
            SubscribeSocket::connect(&endpoint, Duration::from_millis(20)).unwrap();

        token.cancel();
        let polled = socket.recv(Deadline::forever(), &token).unwrap();
        assert!(matches!(polled, Polled::Stopped));
    }

    fn stream_park(writer: MessageWriter<TcpStream>) {
        // Hold the connection open briefly so the consumer side finishes.
        thread::sleep(Duration::from_millis(200));
        drop(writer);
    }
}
