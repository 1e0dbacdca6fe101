//! Public request forwarding
//!
//! Turns one inbound public request into a `request` frame plus body chunks,
//! then drives the per-request state machine over the frames coming back:
//! `AwaitingHead` until the response head (or first chunk) arrives,
//! `Streaming` while body chunks flow, `Closed` on end, deadline, malformed
//! frame, or tunnel disconnect.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use outpost_proto::{decode_body, encode_body, sanitize_headers, Direction, Frame};
use std::io;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::inflight::InflightGuard;
use crate::manager::TunnelHandle;
use crate::server::AppState;

/// Catch-all handler: tunnel one inbound public request
pub async fn forward_handler(State(state): State<AppState>, req: Request) -> Response {
    let Some(tunnel) = state.manager.current().await else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No active tunnel",
            "No tunnel client is registered with this edge",
        );
    };

    let id = outpost_proto::mint_request_id();
    let deadline = Instant::now() + state.request_timeout;

    let method = req.method().as_str().to_string();
    let url = match req.uri().query() {
        Some(query) => format!("{}?{}", req.uri().path(), query),
        None => req.uri().path().to_string(),
    };

    let headers: Vec<(String, String)> = req
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

    let has_body = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > 0);

    let mailbox = tunnel.inflight().register(&id);
    let guard = InflightGuard::new(tunnel.inflight().clone(), id.clone());

    let head_frame = Frame::Request {
        id: id.clone(),
        method,
        url,
        headers,
        has_body,
    };

    if tunnel.send(head_frame).await.is_err() {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel disconnected",
            "The tunnel channel closed before the request could be sent",
        );
    }

    // Request body chunks follow the head frame on the same ordered channel
    if has_body {
        tokio::spawn(pump_request_body(
            tunnel.clone(),
            id.clone(),
            req.into_body(),
        ));
    }

    assemble_response(tunnel, id, mailbox, deadline, guard).await
}

/// Pipe the public request body to the channel, best-effort.
///
/// If the channel drops mid-stream the record is reaped by the deadline or
/// by the channel-close teardown, so errors here are not surfaced.
async fn pump_request_body(tunnel: TunnelHandle, id: String, body: Body) {
    let mut stream = body.into_data_stream();

    while let Some(result) = stream.next().await {
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("Public request body error for {}: {}", id, e);
                return;
            }
        };
        if bytes.is_empty() {
            continue;
        }

        let chunk = Frame::Chunk {
            id: id.clone(),
            data: encode_body(&bytes),
            direction: Some(Direction::Request),
        };
        if tunnel.send(chunk).await.is_err() {
            return;
        }
    }

    let end = Frame::End {
        id,
        direction: Some(Direction::Request),
    };
    let _ = tunnel.send(end).await;
}

/// `AwaitingHead`: wait for the first frame and decide the response shape
async fn assemble_response(
    tunnel: TunnelHandle,
    id: String,
    mut mailbox: mpsc::Receiver<Frame>,
    deadline: Instant,
    guard: InflightGuard,
) -> Response {
    let first = tokio::select! {
        _ = tokio::time::sleep_until(deadline) => {
            debug!("Request {} hit its deadline before a response head", id);
            return error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "Request timeout",
                "The tunnel client did not respond in time",
            );
        }
        frame = mailbox.recv() => frame,
    };

    match first {
        Some(Frame::Response {
            status,
            headers,
            body,
            streaming,
            ..
        }) => {
            let Ok(status) = StatusCode::from_u16(status) else {
                warn!("Response frame for {} carried invalid status", id);
                return malformed_response();
            };

            let inline = match body.as_deref().map(decode_body).transpose() {
                Ok(inline) => inline.map(Bytes::from),
                Err(e) => {
                    warn!("Response frame for {} carried invalid body: {}", id, e);
                    return malformed_response();
                }
            };

            if streaming == Some(true) {
                // Head written, body streams from subsequent chunk frames
                let stream = StreamState {
                    mailbox,
                    deadline,
                    pending: inline,
                    done: false,
                    _guard: guard,
                };
                build_response(status, &headers, streamed_body(stream))
            } else {
                build_response(status, &headers, Body::from(inline.unwrap_or_default()))
            }
        }

        // Body-first response: synthesize an implicit 200 OK
        Some(Frame::Chunk { data, .. }) => match decode_body(&data) {
            Ok(bytes) => {
                let stream = StreamState {
                    mailbox,
                    deadline,
                    pending: Some(Bytes::from(bytes)),
                    done: false,
                    _guard: guard,
                };
                build_response(StatusCode::OK, &[], streamed_body(stream))
            }
            Err(e) => {
                warn!("Chunk frame for {} carried invalid data: {}", id, e);
                malformed_response()
            }
        },

        // End with no head at all: empty implicit 200 OK
        Some(Frame::End { .. }) => build_response(StatusCode::OK, &[], Body::empty()),

        Some(frame) => {
            warn!("Unexpected frame {:?} while awaiting head for {}", frame, id);
            malformed_response()
        }

        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "Tunnel disconnected",
            "The tunnel channel closed while the request was in flight",
        ),
    }
}

/// `Streaming` state, owned by the response body stream.
///
/// Holding the guard here ties record cleanup to the body's lifetime: the
/// record is removed exactly when the stream is dropped, whether it finished
/// normally, timed out, or the public caller went away.
struct StreamState {
    mailbox: mpsc::Receiver<Frame>,
    deadline: Instant,
    pending: Option<Bytes>,
    done: bool,
    _guard: InflightGuard,
}

/// Body driven by the request's mailbox until `end`, deadline, or close.
///
/// Truncation paths yield an error so the caller observes an aborted body
/// rather than a clean end.
fn streamed_body(state: StreamState) -> Body {
    Body::from_stream(futures_util::stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }

        if let Some(bytes) = state.pending.take() {
            return Some((Ok(bytes), state));
        }

        tokio::select! {
            _ = tokio::time::sleep_until(state.deadline) => {
                state.done = true;
                let err = io::Error::new(io::ErrorKind::TimedOut, "request deadline exceeded");
                Some((Err(err), state))
            }
            frame = state.mailbox.recv() => match frame {
                Some(Frame::Chunk { data, .. }) => match decode_body(&data) {
                    Ok(bytes) => Some((Ok(Bytes::from(bytes)), state)),
                    Err(_) => {
                        state.done = true;
                        let err = io::Error::new(io::ErrorKind::InvalidData, "malformed chunk frame");
                        Some((Err(err), state))
                    }
                },
                Some(Frame::End { .. }) => None,
                Some(_) => {
                    state.done = true;
                    let err = io::Error::new(io::ErrorKind::InvalidData, "unexpected frame in body stream");
                    Some((Err(err), state))
                }
                None => {
                    state.done = true;
                    let err =
                        io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel disconnected");
                    Some((Err(err), state))
                }
            }
        }
    }))
}

fn build_response(status: StatusCode, headers: &[(String, String)], body: Body) -> Response {
    let mut builder = Response::builder().status(status);

    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            debug!("Skipping unrepresentable response header {}", name);
            continue;
        };
        builder = builder.header(name, value);
    }

    match builder.body(body) {
        Ok(response) => response,
        Err(e) => {
            warn!("Failed to build proxied response: {}", e);
            malformed_response()
        }
    }
}

fn malformed_response() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Malformed response",
        "The tunnel client sent a frame the edge could not apply",
    )
}

/// Edge-originated error with the JSON envelope `{error, message}`
pub fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": kind,
        "message": message,
    });

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
