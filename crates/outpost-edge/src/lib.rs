//! Edge server for the outpost tunnel
//!
//! Owns the public HTTP listener and the control-channel endpoint. Inbound
//! public requests are multiplexed onto the single registered tunnel channel
//! under synthetic request ids; response frames are demultiplexed back into
//! streaming HTTP responses.

pub mod channel;
pub mod forward;
pub mod inflight;
pub mod manager;
pub mod server;

pub use inflight::InflightTable;
pub use manager::{TunnelManager, TunnelStatus};
pub use server::{AppState, EdgeConfig, EdgeServer, EdgeServerError};

use std::time::Duration;

/// Default deadline for an in-flight request, absolute from creation
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default edge listener port
pub const DEFAULT_EDGE_PORT: u16 = 3001;
