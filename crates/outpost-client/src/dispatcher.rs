//! Frame dispatcher
//!
//! Consumes frames from the control channel, issues loopback HTTP requests
//! against the local service, and streams bodies in both directions. Local
//! failures become synthetic protocol responses, never channel teardowns.

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use outpost_proto::{encode_body, sanitize_headers, Direction, Frame};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Request-body feed depth per pending request
const BODY_FEED_CAPACITY: usize = 64;

/// Dispatches inbound `request` frames against the local service
#[derive(Clone)]
pub struct Dispatcher {
    local_port: u16,
    http: reqwest::Client,
    frame_tx: mpsc::Sender<Frame>,
    /// Pending request-body feeds, keyed by request id
    pending: Arc<DashMap<String, mpsc::Sender<Bytes>>>,
}

impl Dispatcher {
    pub fn new(local_port: u16, frame_tx: mpsc::Sender<Frame>) -> Self {
        Self {
            local_port,
            http: reqwest::Client::new(),
            frame_tx,
            pending: Arc::new(DashMap::new()),
        }
    }

    /// Handle one inbound frame from the channel read loop
    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Request {
                id,
                method,
                url,
                headers,
                has_body,
            } => {
                let dispatcher = self.clone();
                tokio::spawn(async move {
                    dispatcher
                        .run_request(id, method, url, headers, has_body)
                        .await;
                });
            }

            Frame::Chunk {
                id,
                data,
                direction,
            } if Direction::is_request(direction) => {
                self.feed_body(&id, &data).await;
            }

            Frame::End { id, direction } if Direction::is_request(direction) => {
                // Dropping the sender closes the loopback request body
                self.pending.remove(&id);
            }

            Frame::Registered { port } => {
                debug!("Registration acknowledged for port {}", port);
            }

            Frame::Error { message } => {
                warn!("Edge error: {}", message);
            }

            // Response-direction frames and stray registers are not ours
            other => {
                debug!("Ignoring unexpected frame {:?}", other);
            }
        }
    }

    /// Route a request-body chunk to its pending loopback request.
    ///
    /// Unknown ids are silently ignored: the request may already have
    /// failed locally while chunks were in flight.
    async fn feed_body(&self, id: &str, data: &str) {
        let tx = match self.pending.get(id) {
            Some(entry) => entry.value().clone(),
            None => return,
        };

        match outpost_proto::decode_body(data) {
            Ok(bytes) => {
                if tx.send(Bytes::from(bytes)).await.is_err() {
                    self.pending.remove(id);
                }
            }
            Err(e) => {
                warn!("Dropping malformed request chunk for {}: {}", id, e);
            }
        }
    }

    /// Issue one tunneled request against the local service
    async fn run_request(
        &self,
        id: String,
        method: String,
        url: String,
        headers: Vec<(String, String)>,
        has_body: bool,
    ) {
        let target = format!("http://localhost:{}{}", self.local_port, url);

        let Ok(method) = reqwest::Method::from_bytes(method.as_bytes()) else {
            warn!("Request {} carried unusable method {}", id, method);
            self.send_error_head(&id, 500, "Bad request frame", "unusable method")
                .await;
            return;
        };

        let mut request = self.http.request(method, &target);
        request = request.headers(loopback_headers(&headers));

        if has_body {
            let (tx, rx) = mpsc::channel::<Bytes>(BODY_FEED_CAPACITY);
            self.pending.insert(id.clone(), tx);

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv()
                    .await
                    .map(|bytes| (Ok::<_, std::io::Error>(bytes), rx))
            });
            request = request.body(reqwest::Body::wrap_stream(stream));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.pending.remove(&id);
                let (status, kind) = if e.is_connect() {
                    (502, "Bad gateway")
                } else {
                    (500, "Local request failed")
                };
                warn!("Loopback request {} failed: {}", id, e);
                self.send_error_head(&id, status, kind, &e.to_string()).await;
                return;
            }
        };

        let status = response.status().as_u16();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let headers = sanitize_headers(headers);

        let head = Frame::Response {
            id: id.clone(),
            status,
            headers,
            body: None,
            streaming: Some(true),
        };
        if self.frame_tx.send(head).await.is_err() {
            self.pending.remove(&id);
            return;
        }

        // Stream the local response body back as chunk frames
        let mut body = response.bytes_stream();
        while let Some(result) = body.next().await {
            match result {
                Ok(bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let chunk = Frame::Chunk {
                        id: id.clone(),
                        data: encode_body(&bytes),
                        direction: None,
                    };
                    if self.frame_tx.send(chunk).await.is_err() {
                        self.pending.remove(&id);
                        return;
                    }
                }
                Err(e) => {
                    // Head already sent: abort with no further frames and
                    // let the edge deadline reap the record
                    warn!("Loopback response {} errored mid-stream: {}", id, e);
                    self.pending.remove(&id);
                    return;
                }
            }
        }

        let _ = self
            .frame_tx
            .send(Frame::End {
                id: id.clone(),
                direction: None,
            })
            .await;
        self.pending.remove(&id);
    }

    /// Synthetic error response with a JSON body describing the failure
    async fn send_error_head(&self, id: &str, status: u16, kind: &str, detail: &str) {
        let body = serde_json::json!({
            "error": kind,
            "message": detail,
        });

        let frame = Frame::Response {
            id: id.to_string(),
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Some(encode_body(body.to_string().as_bytes())),
            streaming: None,
        };

        let _ = self.frame_tx.send(frame).await;
    }

    /// Count of requests with an open loopback body feed
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Headers for the loopback request: forwarded verbatim except the fields
/// the local HTTP stack owns (`host`, and `content-length` because the body
/// is re-framed as a stream).
fn loopback_headers(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();

    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        map.append(name, value);
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_headers_drop_host_and_length() {
        let headers = vec![
            ("Host".to_string(), "edge.example.com".to_string()),
            ("Content-Length".to_string(), "42".to_string()),
            ("X-Custom".to_string(), "yes".to_string()),
        ];

        let map = loopback_headers(&headers);
        assert!(map.get("host").is_none());
        assert!(map.get("content-length").is_none());
        assert_eq!(map.get("x-custom").unwrap(), "yes");
    }

    #[tokio::test]
    async fn test_unknown_chunk_ignored() {
        let (frame_tx, _frame_rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(3000, frame_tx);

        // Chunk and end for an id nobody is waiting on must be a no-op
        dispatcher
            .handle_frame(Frame::Chunk {
                id: "ghost".to_string(),
                data: encode_body(b"data"),
                direction: Some(Direction::Request),
            })
            .await;
        dispatcher
            .handle_frame(Frame::End {
                id: "ghost".to_string(),
                direction: Some(Direction::Request),
            })
            .await;

        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_refused_becomes_502() {
        let (frame_tx, mut frame_rx) = mpsc::channel(8);
        // Port 1 is essentially never listening
        let dispatcher = Dispatcher::new(1, frame_tx);

        dispatcher
            .handle_frame(Frame::Request {
                id: "req-1".to_string(),
                method: "GET".to_string(),
                url: "/".to_string(),
                headers: vec![],
                has_body: false,
            })
            .await;

        let frame = frame_rx.recv().await.unwrap();
        match frame {
            Frame::Response {
                id, status, body, ..
            } => {
                assert_eq!(id, "req-1");
                assert_eq!(status, 502);
                let bytes = outpost_proto::decode_body(&body.unwrap()).unwrap();
                let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
                assert_eq!(value["error"], "Bad gateway");
            }
            other => panic!("Expected synthetic response, got {:?}", other),
        }

        assert_eq!(dispatcher.pending_count(), 0);
    }
}
