use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::error::{Result, WireError};

/// Envelope type codes. Contract-level constants shared by every peer.
pub mod codes {
    pub const SYNC: u64 = 1;
    pub const SYNC_STREAM: u64 = 2;
    pub const SUBSCRIBE: u64 = 3;
    pub const STREAM: u64 = 4;
    pub const STREAM_END: u64 = 5;
    pub const REQUEST: u64 = 6;
    pub const RESPONSE: u64 = 7;
    pub const CANCEL: u64 = 8;
    pub const STATUS: u64 = 9;
    pub const STORE_KEY_VALUE: u64 = 10;
    pub const GET_KEY_VALUE: u64 = 11;
    pub const REMOVE_KEY: u64 = 12;
    pub const REQUEST_PORT: u64 = 13;
    pub const PORT_UNAVAILABLE: u64 = 14;
    pub const RELEASE_PORT: u64 = 15;
}

/// The mandatory first envelope frame of every message.
///
/// A JSON object `{"type": <int>, ...}` on the wire. The frames that
/// follow it are raw payload whose interpretation this type selects.
/// Decoding is the single place unknown type codes are rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Connection probe; the receiver acknowledges immediately.
    Sync,
    /// Stream handshake probe naming the stream channel.
    SyncStream { name: String },
    /// Barrier subscription announcement.
    Subscribe,
    /// Stream data; payload in the following 1–2 frames.
    Stream,
    /// Explicit end-of-stream marker.
    StreamEnd,
    /// RPC request carrying the caller's identity and private reply port.
    Request {
        app_name: String,
        app_id: u32,
        endpoint: String,
        reply_port: u16,
    },
    /// RPC response or acknowledgement.
    Response { value: i64, message: Option<String> },
    /// Cancellation sentinel.
    Cancel,
    /// Application lifecycle status broadcast.
    Status {
        id: u32,
        name: String,
        state: u32,
        past_states: u32,
        exit_code: Option<i32>,
    },
    /// Discovery store: register a key (fails if present).
    StoreKeyValue { id: u32, key: String, value: String },
    /// Discovery store: look a key up.
    GetKeyValue { id: u32, key: String },
    /// Discovery store: remove a key.
    RemoveKey { id: u32, key: String },
    /// Port allocator: request a candidate port.
    RequestPort { id: u32 },
    /// Port allocator: report a candidate port as unusable.
    PortUnavailable { id: u32, port: u16 },
    /// Port allocator: return a leased port.
    ReleasePort { id: u32, port: u16 },
}

impl Envelope {
    /// The wire type code of this envelope.
    pub fn code(&self) -> u64 {
        match self {
            Envelope::Sync => codes::SYNC,
            Envelope::SyncStream { .. } => codes::SYNC_STREAM,
            Envelope::Subscribe => codes::SUBSCRIBE,
            Envelope::Stream => codes::STREAM,
            Envelope::StreamEnd => codes::STREAM_END,
            Envelope::Request { .. } => codes::REQUEST,
            Envelope::Response { .. } => codes::RESPONSE,
            Envelope::Cancel => codes::CANCEL,
            Envelope::Status { .. } => codes::STATUS,
            Envelope::StoreKeyValue { .. } => codes::STORE_KEY_VALUE,
            Envelope::GetKeyValue { .. } => codes::GET_KEY_VALUE,
            Envelope::RemoveKey { .. } => codes::REMOVE_KEY,
            Envelope::RequestPort { .. } => codes::REQUEST_PORT,
            Envelope::PortUnavailable { .. } => codes::PORT_UNAVAILABLE,
            Envelope::ReleasePort { .. } => codes::RELEASE_PORT,
        }
    }

    /// A successful acknowledgement envelope.
    pub fn ok() -> Self {
        Envelope::Response {
            value: 0,
            message: Some("OK".to_string()),
        }
    }

    /// Serialize to the wire form.
    pub fn encode(&self) -> Bytes {
        let mut obj = match self {
            Envelope::Sync
            | Envelope::Subscribe
            | Envelope::Stream
            | Envelope::StreamEnd
            | Envelope::Cancel => json!({}),
            Envelope::SyncStream { name } => json!({ "name": name }),
            Envelope::Request {
                app_name,
                app_id,
                endpoint,
                reply_port,
            } => json!({
                "appName": app_name,
                "appId": app_id,
                "endpoint": endpoint,
                "replyPort": reply_port,
            }),
            Envelope::Response { value, message } => {
                let mut obj = json!({ "value": value });
                if let Some(message) = message {
                    obj["message"] = json!(message);
                }
                obj
            }
            Envelope::Status {
                id,
                name,
                state,
                past_states,
                exit_code,
            } => {
                let mut obj = json!({
                    "id": id,
                    "name": name,
                    "state": state,
                    "pastStates": past_states,
                });
                if let Some(exit_code) = exit_code {
                    obj["exitCode"] = json!(exit_code);
                }
                obj
            }
            Envelope::StoreKeyValue { id, key, value } => {
                json!({ "id": id, "key": key, "value": value })
            }
            Envelope::GetKeyValue { id, key } | Envelope::RemoveKey { id, key } => {
                json!({ "id": id, "key": key })
            }
            Envelope::RequestPort { id } => json!({ "id": id }),
            Envelope::PortUnavailable { id, port } | Envelope::ReleasePort { id, port } => {
                json!({ "id": id, "port": port })
            }
        };
        obj["type"] = json!(self.code());
        Bytes::from(serde_json::to_vec(&obj).expect("envelope serialization cannot fail"))
    }

    /// Parse an envelope frame.
    ///
    /// This is the deserialization boundary: unknown type codes become
    /// [`WireError::UnknownType`], structural problems become
    /// [`WireError::Malformed`].
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)?;
        let obj = value
            .as_object()
            .ok_or_else(|| WireError::Malformed("envelope is not an object".to_string()))?;
        let code = obj
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| WireError::Malformed("missing 'type' field".to_string()))?;

        match code {
            codes::SYNC => Ok(Envelope::Sync),
            codes::SYNC_STREAM => Ok(Envelope::SyncStream {
                name: get_str(obj, "name")?,
            }),
            codes::SUBSCRIBE => Ok(Envelope::Subscribe),
            codes::STREAM => Ok(Envelope::Stream),
            codes::STREAM_END => Ok(Envelope::StreamEnd),
            codes::REQUEST => Ok(Envelope::Request {
                app_name: get_str(obj, "appName")?,
                app_id: get_u32(obj, "appId")?,
                endpoint: get_str(obj, "endpoint")?,
                reply_port: get_u16(obj, "replyPort")?,
            }),
            codes::RESPONSE => Ok(Envelope::Response {
                value: obj
                    .get("value")
                    .and_then(Value::as_i64)
                    .ok_or_else(|| missing("value"))?,
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }),
            codes::CANCEL => Ok(Envelope::Cancel),
            codes::STATUS => Ok(Envelope::Status {
                id: get_u32(obj, "id")?,
                name: get_str(obj, "name")?,
                state: get_u32(obj, "state")?,
                past_states: get_u32(obj, "pastStates")?,
                exit_code: obj
                    .get("exitCode")
                    .and_then(Value::as_i64)
                    .map(|code| code as i32),
            }),
            codes::STORE_KEY_VALUE => Ok(Envelope::StoreKeyValue {
                id: get_u32(obj, "id")?,
                key: get_str(obj, "key")?,
                value: get_str(obj, "value")?,
            }),
            codes::GET_KEY_VALUE => Ok(Envelope::GetKeyValue {
                id: get_u32(obj, "id")?,
                key: get_str(obj, "key")?,
            }),
            codes::REMOVE_KEY => Ok(Envelope::RemoveKey {
                id: get_u32(obj, "id")?,
                key: get_str(obj, "key")?,
            }),
            codes::REQUEST_PORT => Ok(Envelope::RequestPort {
                id: get_u32(obj, "id")?,
            }),
            codes::PORT_UNAVAILABLE => Ok(Envelope::PortUnavailable {
                id: get_u32(obj, "id")?,
                port: get_u16(obj, "port")?,
            }),
            codes::RELEASE_PORT => Ok(Envelope::ReleasePort {
                id: get_u32(obj, "id")?,
                port: get_u16(obj, "port")?,
            }),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

fn missing(field: &str) -> WireError {
    WireError::Malformed(format!("missing or mistyped '{field}' field"))
}

fn get_str(obj: &Map<String, Value>, field: &str) -> Result<String> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| missing(field))
}

fn get_u32(obj: &Map<String, Value>, field: &str) -> Result<u32> {
    obj.get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| missing(field))
}

fn get_u16(obj: &Map<String, Value>, field: &str) -> Result<u16> {
    obj.get(field)
        .and_then(Value::as_u64)
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| missing(field))
}
