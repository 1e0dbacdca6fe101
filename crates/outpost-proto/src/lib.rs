//! Tunnel Protocol Definitions
//!
//! This crate defines the frame vocabulary spoken on the control channel
//! between the edge server and the tunnel client, the JSON codec for it,
//! and the small shared helpers both endpoints need (hop-by-hop header
//! sanitization, request-id minting).

pub mod codec;
pub mod frames;
pub mod headers;
pub mod id;

pub use codec::{decode_frame, encode_frame, CodecError};
pub use frames::{decode_body, encode_body, Direction, Frame};
pub use headers::{is_hop_by_hop, sanitize_headers};
pub use id::mint_request_id;

/// Maximum encoded frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Path of the control-channel endpoint on the edge server
pub const CONNECT_PATH: &str = "/connect";

/// Path of the edge health endpoint
pub const HEALTH_PATH: &str = "/health";
