//! Client error types

use thiserror::Error;

/// Tunnel client errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] outpost_proto::CodecError),

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Invalid edge domain: {0}")]
    InvalidDomain(String),

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(usize),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
