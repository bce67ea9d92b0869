use std::io::{ErrorKind, Read};

use bytes::{Bytes, BytesMut};

use crate::codec::{decode_frame, Multipart, WireConfig};
use crate::error::{Result, WireError};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete multipart messages from any `Read` stream.
///
/// Partial reads are buffered internally; a message interrupted by a read
/// timeout resumes transparently on the next call, so bounded poll loops
/// can keep calling [`MessageReader::read_message`] without losing frames.
pub struct MessageReader<T> {
    inner: T,
    buf: BytesMut,
    parts: Vec<Bytes>,
    config: WireConfig,
}

impl<T: Read> MessageReader<T> {
    /// Create a new message reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, WireConfig::default())
    }

    /// Create a new message reader with explicit configuration.
    pub fn with_config(inner: T, config: WireConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            parts: Vec::new(),
            config,
        }
    }

    /// Read the next complete message (blocking).
    ///
    /// Returns `Err(WireError::ConnectionClosed)` at EOF. A `WouldBlock`
    /// or `TimedOut` I/O error surfaces as `WireError::Io` with internal
    /// state intact; callers in poll loops test it with
    /// [`WireError::is_poll_timeout`] and retry.
    pub fn read_message(&mut self) -> Result<Multipart> {
        loop {
            while let Some((payload, more)) =
                decode_frame(&mut self.buf, self.config.max_payload_size)?
            {
                self.parts.push(payload);
                if !more {
                    return Ok(std::mem::take(&mut self.parts));
                }
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            let read = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(WireError::Io(err)),
            };

            if read == 0 {
                return Err(WireError::ConnectionClosed);
            }

            self.buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;
    use crate::codec::encode_message;

    #[test]
    fn read_single_message() {
        let mut wire = BytesMut::new();
        encode_message(&[b"id".as_ref(), b"env", b"data"], &mut wire).unwrap();

        let mut reader = MessageReader::new(Cursor::new(wire.to_vec()));
        let message = reader.read_message().unwrap();

        assert_eq!(message.len(), 3);
        assert_eq!(message[2].as_ref(), b"data");
    }

    #[test]
    fn read_sequential_messages() {
        let mut wire = BytesMut::new();
        encode_message(&[b"one".as_ref()], &mut wire).unwrap();
        encode_message(&[b"two".as_ref(), b"parts"], &mut wire).unwrap();

        let mut reader = MessageReader::new(Cursor::new(wire.to_vec()));

        let first = reader.read_message().unwrap();
        let second = reader.read_message().unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(first[0].as_ref(), b"one");
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].as_ref(), b"parts");
    }

    #[test]
    fn byte_by_byte_reads_reassemble() {
        let mut wire = BytesMut::new();
        encode_message(&[b"slow".as_ref(), b"path"], &mut wire).unwrap();

        let mut reader = MessageReader::new(ByteByByteReader {
            bytes: wire.to_vec(),
            pos: 0,
        });

        let message = reader.read_message().unwrap();
        assert_eq!(message.len(), 2);
        assert_eq!(message[0].as_ref(), b"slow");
        assert_eq!(message[1].as_ref(), b"path");
    }

    #[test]
    fn eof_is_connection_closed() {
        let mut reader = MessageReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            reader.read_message(),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn eof_mid_message_is_connection_closed() {
        let mut wire = BytesMut::new();
        encode_message(&[b"head".as_ref(), b"tail"], &mut wire).unwrap();
        wire.truncate(wire.len() - 2);

        let mut reader = MessageReader::new(Cursor::new(wire.to_vec()));
        assert!(matches!(
            reader.read_message(),
            Err(WireError::ConnectionClosed)
        ));
    }

    #[test]
    fn timeout_mid_message_resumes() {
        let mut wire = BytesMut::new();
        encode_message(&[b"first-half".as_ref(), b"second-half"], &mut wire).unwrap();
        let bytes = wire.to_vec();
        let split = bytes.len() / 2;

        let mut reader = MessageReader::new(TimeoutBetweenChunks {
            chunks: vec![bytes[..split].to_vec(), bytes[split..].to_vec()],
            timed_out: false,
        });

        let err = reader.read_message().unwrap_err();
        assert!(err.is_poll_timeout());

        // Internal state kept; the retry completes the message.
        let message = reader.read_message().unwrap();
        assert_eq!(message.len(), 2);
        assert_eq!(message[0].as_ref(), b"first-half");
        assert_eq!(message[1].as_ref(), b"second-half");
    }

    #[test]
    fn interrupted_read_retries() {
        let mut wire = BytesMut::new();
        encode_message(&[b"ok".as_ref()], &mut wire).unwrap();

        let mut reader = MessageReader::new(InterruptedThenData {
            bytes: wire.to_vec(),
            pos: 0,
            interrupted: false,
        });

        let message = reader.read_message().unwrap();
        assert_eq!(message[0].as_ref(), b"ok");
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct TimeoutBetweenChunks {
        chunks: Vec<Vec<u8>>,
        timed_out: bool,
    }

    impl Read for TimeoutBetweenChunks {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.chunks.is_empty() && !self.timed_out {
                let chunk = self.chunks.remove(0);
                buf[..chunk.len()].copy_from_slice(&chunk);
                self.timed_out = true;
                return Ok(chunk.len());
            }
            if self.chunks.is_empty() {
                return Ok(0);
            }
            self.timed_out = false;
            Err(std::io::Error::from(ErrorKind::WouldBlock))
        }
    }

    struct InterruptedThenData {
        bytes: Vec<u8>,
        pos: usize,
        interrupted: bool,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }
}
