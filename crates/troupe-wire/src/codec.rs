use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Frame header: magic (2) + length (4) + flags (1) = 7 bytes.
pub const FRAME_HEADER_SIZE: usize = 7;

/// Magic bytes: "TW" (0x54 0x57).
pub const MAGIC: [u8; 2] = [0x54, 0x57];

/// Flag bit: more frames follow in the same message.
const FLAG_MORE: u8 = 0x01;

/// Default maximum payload size per frame: 16 MiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// An ordered sequence of frame payloads forming one message.
pub type Multipart = Vec<Bytes>;

/// Configuration for the message codec.
#[derive(Debug, Clone)]
pub struct WireConfig {
    /// Maximum payload size per frame in bytes. Default: 16 MiB.
    pub max_payload_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Encode a single frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────────┬───────────┬───────────┬──────────────────┐
/// │ Magic (2B)   │ Length    │ Flags     │ Payload          │
/// │ 0x54 0x57    │ (4B LE)   │ (1B)      │ (Length bytes)   │
/// │ "TW"         │           │ bit0=MORE │                  │
/// └──────────────┴───────────┴───────────┴──────────────────┘
/// ```
pub fn encode_frame(payload: &[u8], more: bool, dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(FRAME_HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u8(if more { FLAG_MORE } else { 0 });
    dst.put_slice(payload);
    Ok(())
}

/// Encode a whole message: every frame carries MORE except the last.
///
/// An empty part list encodes as one empty terminal frame so that a
/// message is never zero frames on the wire.
pub fn encode_message<P: AsRef<[u8]>>(parts: &[P], dst: &mut BytesMut) -> Result<()> {
    if parts.is_empty() {
        return encode_frame(&[], false, dst);
    }
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        encode_frame(part.as_ref(), i < last, dst)?;
    }
    Ok(())
}

/// Decode one frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes and returns the payload plus the
/// MORE flag.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<(Bytes, bool)>> {
    if src.len() < FRAME_HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let payload_len = u32::from_le_bytes(src[2..6].try_into().unwrap()) as usize;
    let flags = src[6];

    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = FRAME_HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(FRAME_HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some((payload, flags & FLAG_MORE != 0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(src: &mut BytesMut) -> Multipart {
        let mut parts = Vec::new();
        loop {
            let (payload, more) = decode_frame(src, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
            parts.push(payload);
            if !more {
                return parts;
            }
        }
    }

    #[test]
    fn single_part_roundtrip() {
        let mut buf = BytesMut::new();
        encode_message(&[b"hello".as_ref()], &mut buf).unwrap();

        assert_eq!(buf.len(), FRAME_HEADER_SIZE + 5);
        let parts = drain(&mut buf);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn multipart_roundtrip() {
        let mut buf = BytesMut::new();
        encode_message(&[b"id".as_ref(), b"env", b"payload"], &mut buf).unwrap();

        let parts = drain(&mut buf);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].as_ref(), b"id");
        assert_eq!(parts[1].as_ref(), b"env");
        assert_eq!(parts[2].as_ref(), b"payload");
        assert!(buf.is_empty());
    }

    #[test]
    fn empty_message_is_one_empty_frame() {
        let mut buf = BytesMut::new();
        encode_message::<&[u8]>(&[], &mut buf).unwrap();

        let parts = drain(&mut buf);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_empty());
    }

    #[test]
    fn empty_parts_survive() {
        let mut buf = BytesMut::new();
        encode_message(&[b"".as_ref(), b"env", b""], &mut buf).unwrap();

        let parts = drain(&mut buf);
        assert_eq!(parts.len(), 3);
        assert!(parts[0].is_empty());
        assert_eq!(parts[1].as_ref(), b"env");
        assert!(parts[2].is_empty());
    }

    #[test]
    fn incomplete_header_needs_more() {
        let mut buf = BytesMut::from(&MAGIC[..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());
    }

    #[test]
    fn incomplete_payload_needs_more() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", false, &mut buf).unwrap();
        buf.truncate(FRAME_HEADER_SIZE + 2);

        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .is_none());
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0, 0][..]);
        assert!(matches!(
            decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD),
            Err(WireError::InvalidMagic)
        ));
    }

    #[test]
    fn oversized_payload_rejected_on_decode() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(64);
        buf.put_u8(0);

        assert!(matches!(
            decode_frame(&mut buf, 16),
            Err(WireError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn two_messages_back_to_back() {
        let mut buf = BytesMut::new();
        encode_message(&[b"a".as_ref(), b"b"], &mut buf).unwrap();
        encode_message(&[b"c".as_ref()], &mut buf).unwrap();

        let first = drain(&mut buf);
        let second = drain(&mut buf);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].as_ref(), b"c");
        assert!(buf.is_empty());
    }
}
