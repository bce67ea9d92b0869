//! Multipart message framing and typed envelopes.
//!
//! Every message on the wire is a sequence of frames; each frame carries:
//! - A 2-byte magic number ("TW") for stream synchronization
//! - A 4-byte little-endian payload length
//! - A 1-byte flag field whose low bit marks "more frames follow"
//!
//! Channels exchange messages shaped `[identity][envelope][payload...]`:
//! the identity addresses a channel instance (and may be empty on a direct
//! connection), the envelope is a typed JSON object selecting how the
//! remaining frames are interpreted.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, encode_message, Multipart, WireConfig, DEFAULT_MAX_PAYLOAD,
    FRAME_HEADER_SIZE,
};
pub use envelope::{codes, Envelope};
pub use error::{Result, WireError};
pub use reader::MessageReader;
pub use writer::MessageWriter;
