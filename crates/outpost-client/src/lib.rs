//! Tunnel client for the outpost edge
//!
//! Opens and maintains the control channel, dispatches tunneled requests
//! against the local service, and reconnects with bounded exponential
//! backoff when the channel drops.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod reconnect;
pub mod tunnel;

pub use config::{ClientConfig, ConfigStore, StatusFile};
pub use error::TunnelError;
pub use reconnect::{ReconnectConfig, ReconnectController, ReconnectError};
pub use tunnel::{run_with_reconnect, RunConfig};

/// Default local port the client forwards to
pub const DEFAULT_LOCAL_PORT: u16 = 3000;
