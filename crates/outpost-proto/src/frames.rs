//! Control-channel frame types
//!
//! Every message on the control channel is one JSON object with a `type`
//! field. Body bytes travel base64-encoded in `data`/`body` so frames stay
//! ASCII-safe regardless of the payload.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Which body stream a `chunk` or `end` frame belongs to.
///
/// `Request` marks the inbound request body flowing edge → client. When the
/// field is absent on the wire the frame belongs to the response stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    /// True when an optional direction field marks the request stream.
    pub fn is_request(direction: Option<Direction>) -> bool {
        matches!(direction, Some(Direction::Request))
    }
}

/// Main control-channel frame enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    /// Client declares tunnel presence and its informational upstream port
    Register { port: u16 },

    /// Edge acknowledges registration, echoing the port
    Registered { port: u16 },

    /// Edge begins an inbound request; body (if any) follows as chunks
    #[serde(rename_all = "camelCase")]
    Request {
        id: String,
        method: String,
        /// Origin-form path including query
        url: String,
        headers: Vec<(String, String)>,
        has_body: bool,
    },

    /// A body fragment; `data` is base64-encoded raw bytes
    Chunk {
        id: String,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },

    /// Terminates a body stream
    End {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        direction: Option<Direction>,
    },

    /// Client begins the response; inline `body` or `streaming: true`
    Response {
        id: String,
        status: u16,
        headers: Vec<(String, String)>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        streaming: Option<bool>,
    },

    /// Out-of-band notification, not tied to a request id
    Error { message: String },
}

impl Frame {
    /// Request id this frame is routed by, if it carries one.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Frame::Request { id, .. }
            | Frame::Chunk { id, .. }
            | Frame::End { id, .. }
            | Frame::Response { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// Encode raw body bytes for the `data`/`body` fields
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a `data`/`body` field back to raw bytes
pub fn decode_body(encoded: &str) -> Result<Vec<u8>, CodecError> {
    BASE64
        .decode(encoded)
        .map_err(|e| CodecError::InvalidBody(e.to_string()))
}
