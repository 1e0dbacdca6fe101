//! Tunnel registration management
//!
//! The edge owns at most one registered tunnel at a time. Registering a new
//! channel closes the previous one and fails its in-flight requests.

use outpost_proto::Frame;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::inflight::InflightTable;

/// Outbound frame queue depth per channel
const FRAME_QUEUE_CAPACITY: usize = 256;

/// Snapshot of tunnel state for the health surface
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TunnelStatus {
    pub connected: bool,
    pub port: Option<u16>,
    pub uptime_ms: Option<u64>,
    pub in_flight: usize,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TunnelStatus {
    fn disconnected() -> Self {
        Self {
            connected: false,
            port: None,
            uptime_ms: None,
            in_flight: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }
}

struct TunnelShared {
    conn_id: String,
    port: u16,
    connected_at: Instant,
    frame_tx: mpsc::Sender<Frame>,
    inflight: InflightTable,
    cancel: CancellationToken,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// Handle to one registered tunnel channel.
///
/// Clones share the same channel. All writes go through `send`, which feeds
/// the single writer task, so message framing stays atomic even with many
/// request body pumps writing concurrently.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<TunnelShared>,
}

impl TunnelHandle {
    /// Create a handle plus the receiver its writer task consumes
    pub fn new(conn_id: String, port: u16) -> (Self, mpsc::Receiver<Frame>) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let handle = Self {
            shared: Arc::new(TunnelShared {
                conn_id,
                port,
                connected_at: Instant::now(),
                frame_tx,
                inflight: InflightTable::new(),
                cancel: CancellationToken::new(),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }),
        };
        (handle, frame_rx)
    }

    /// Queue a frame for the writer task. Errors when the channel is closed.
    pub async fn send(&self, frame: Frame) -> Result<(), ChannelClosed> {
        if self.shared.cancel.is_cancelled() {
            return Err(ChannelClosed);
        }
        self.shared
            .frame_tx
            .send(frame)
            .await
            .map_err(|_| ChannelClosed)
    }

    pub fn conn_id(&self) -> &str {
        &self.shared.conn_id
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn inflight(&self) -> &InflightTable {
        &self.shared.inflight
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn record_bytes_sent(&self, n: u64) {
        self.shared.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_bytes_received(&self, n: u64) {
        self.shared.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Close the channel and fail everything still in flight
    pub fn close(&self) {
        self.shared.cancel.cancel();
        self.shared.inflight.clear();
    }

    fn status(&self) -> TunnelStatus {
        TunnelStatus {
            connected: !self.is_closed(),
            port: Some(self.shared.port),
            uptime_ms: Some(self.shared.connected_at.elapsed().as_millis() as u64),
            in_flight: self.shared.inflight.count(),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Error returned when sending on a closed channel
#[derive(Debug, thiserror::Error)]
#[error("Control channel closed")]
pub struct ChannelClosed;

/// Owns the single active tunnel slot
pub struct TunnelManager {
    active: RwLock<Option<TunnelHandle>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            active: RwLock::new(None),
        }
    }

    /// Install a new tunnel, replacing (and closing) any previous one
    pub async fn register(&self, handle: TunnelHandle) {
        let previous = {
            let mut active = self.active.write().await;
            active.replace(handle.clone())
        };

        if let Some(old) = previous {
            warn!(
                "Replacing registered tunnel {} with {}",
                old.conn_id(),
                handle.conn_id()
            );
            old.close();
        }

        info!(
            "Tunnel {} registered for upstream port {}",
            handle.conn_id(),
            handle.port()
        );
    }

    /// Clear the slot when a channel's read loop ends.
    ///
    /// Only removes the entry if it still belongs to `conn_id`, so a
    /// replacement registration is never clobbered by the old channel's
    /// teardown.
    pub async fn unregister(&self, conn_id: &str) {
        let removed = {
            let mut active = self.active.write().await;
            if active.as_ref().is_some_and(|t| t.conn_id() == conn_id) {
                active.take()
            } else {
                None
            }
        };

        if let Some(tunnel) = removed {
            tunnel.close();
            info!("Tunnel {} unregistered", conn_id);
        }
    }

    /// Current open tunnel, if one is registered
    pub async fn current(&self) -> Option<TunnelHandle> {
        let active = self.active.read().await;
        active.as_ref().filter(|t| !t.is_closed()).cloned()
    }

    /// Status snapshot for the health surface
    pub async fn status(&self) -> TunnelStatus {
        match self.current().await {
            Some(tunnel) => tunnel.status(),
            None => TunnelStatus::disconnected(),
        }
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}
