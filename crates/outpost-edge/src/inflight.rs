//! In-flight request tracker
//!
//! Tracks public requests forwarded through the tunnel and routes response
//! frames back to them. One demultiplexer owns the table; each request gets
//! a private mailbox, so frame dispatch is O(1) by id lookup.

use dashmap::DashMap;
use outpost_proto::Frame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Mailbox depth per in-flight request
const MAILBOX_CAPACITY: usize = 64;

/// Tracks in-flight requests awaiting frames from the tunnel client
#[derive(Clone)]
pub struct InflightTable {
    /// Maps request id -> mailbox sender for that request
    requests: Arc<DashMap<String, mpsc::Sender<Frame>>>,
}

impl InflightTable {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new in-flight request, returning its mailbox receiver
    pub fn register(&self, id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.requests.insert(id.to_string(), tx);
        debug!("Registered in-flight request {}", id);
        rx
    }

    /// Route a frame to the mailbox of the request it belongs to.
    ///
    /// Awaiting the mailbox send applies backpressure to the channel read
    /// loop, which keeps per-id frames in receive order. Returns false when
    /// no request with that id is in flight (tolerated: races with request
    /// completion are expected).
    pub async fn dispatch(&self, frame: Frame) -> bool {
        let Some(id) = frame.request_id() else {
            return false;
        };

        let tx = match self.requests.get(id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("No in-flight request {} for inbound frame", id);
                return false;
            }
        };

        if tx.send(frame).await.is_err() {
            warn!("Mailbox receiver dropped before frame delivery");
            return false;
        }
        true
    }

    /// Remove a request from the table (idempotent)
    pub fn remove(&self, id: &str) {
        if self.requests.remove(id).is_some() {
            debug!("Removed in-flight request {}", id);
        }
    }

    /// Drop every mailbox sender, failing all in-flight requests.
    ///
    /// Each request task observes its mailbox closing and terminates per the
    /// state machine (503 before headers, truncation after).
    pub fn clear(&self) {
        let count = self.requests.len();
        self.requests.clear();
        if count > 0 {
            warn!("Failed {} in-flight request(s) on tunnel close", count);
        }
    }

    /// Get count of in-flight requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for InflightTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes an in-flight record when dropped.
///
/// Every request holds exactly one guard, so the create/destroy balance
/// holds on every exit path: normal end, timeout, malformed frame, caller
/// disconnect. Removal after a table clear is a no-op.
pub struct InflightGuard {
    table: InflightTable,
    id: String,
}

impl InflightGuard {
    pub fn new(table: InflightTable, id: String) -> Self {
        Self { table, id }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str) -> Frame {
        Frame::Chunk {
            id: id.to_string(),
            data: outpost_proto::encode_body(b"x"),
            direction: None,
        }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let table = InflightTable::new();
        let mut rx = table.register("req-1");

        assert_eq!(table.count(), 1);
        assert!(table.dispatch(chunk("req-1")).await);

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.request_id(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_id() {
        let table = InflightTable::new();
        assert!(!table.dispatch(chunk("ghost")).await);
    }

    #[tokio::test]
    async fn test_dispatch_without_id() {
        let table = InflightTable::new();
        let frame = Frame::Error {
            message: "advisory".to_string(),
        };
        assert!(!table.dispatch(frame).await);
    }

    #[tokio::test]
    async fn test_clear_closes_mailboxes() {
        let table = InflightTable::new();
        let mut rx1 = table.register("a");
        let mut rx2 = table.register("b");

        table.clear();
        assert_eq!(table.count(), 0);

        assert!(rx1.recv().await.is_none());
        assert!(rx2.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_guard_removes_once() {
        let table = InflightTable::new();
        let _rx = table.register("g");

        {
            let _guard = InflightGuard::new(table.clone(), "g".to_string());
            assert_eq!(table.count(), 1);
        }
        assert_eq!(table.count(), 0);

        // Second removal attempt is a no-op
        table.remove("g");
        assert_eq!(table.count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_after_receiver_dropped() {
        let table = InflightTable::new();
        let rx = table.register("d");
        drop(rx);

        assert!(!table.dispatch(chunk("d")).await);
    }

    #[tokio::test]
    async fn test_many_concurrent_requests() {
        let table = InflightTable::new();

        let mut receivers = Vec::new();
        for i in 0..200 {
            receivers.push((i, table.register(&format!("req-{}", i))));
        }
        assert_eq!(table.count(), 200);

        for (i, mut rx) in receivers {
            let id = format!("req-{}", i);
            assert!(table.dispatch(chunk(&id)).await);
            assert_eq!(rx.recv().await.unwrap().request_id(), Some(id.as_str()));
            table.remove(&id);
        }
        assert_eq!(table.count(), 0);
    }
}
