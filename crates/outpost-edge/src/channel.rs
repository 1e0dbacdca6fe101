//! Control-channel endpoint
//!
//! Accepts the WebSocket upgrade at `/connect`, performs the registration
//! handshake, then runs split reader/writer tasks for the channel lifetime.
//! The writer task is the only place frames touch the socket, so framing is
//! atomic no matter how many request pumps write concurrently.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use outpost_proto::{decode_frame, encode_frame, Frame};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::manager::TunnelHandle;
use crate::server::AppState;

/// How long a freshly upgraded channel may take to send `register`
const REGISTER_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /connect` upgrades to the control channel
pub async fn connect_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_channel(state, socket))
}

async fn handle_channel(state: AppState, socket: WebSocket) {
    let (sink, mut stream) = socket.split();

    // Registration handshake: the first frame must be `register`
    let port = match tokio::time::timeout(REGISTER_TIMEOUT, read_register(&mut stream)).await {
        Ok(Some(port)) => port,
        Ok(None) => {
            debug!("Channel closed before registration");
            return;
        }
        Err(_) => {
            warn!("Channel sent no register frame within {:?}", REGISTER_TIMEOUT);
            return;
        }
    };

    let conn_id = format!("tunnel-{}", outpost_proto::mint_request_id());
    let (handle, frame_rx) = TunnelHandle::new(conn_id.clone(), port);

    let writer = tokio::spawn(writer_task(sink, frame_rx, handle.clone()));

    state.manager.register(handle.clone()).await;

    if handle.send(Frame::Registered { port }).await.is_err() {
        warn!("Channel {} closed before registration ack", conn_id);
        state.manager.unregister(&conn_id).await;
        writer.abort();
        return;
    }

    read_loop(&mut stream, &handle).await;

    // Channel-fatal: fail in-flight requests and free the slot
    state.manager.unregister(&conn_id).await;
    writer.abort();
    info!("Channel {} closed", conn_id);
}

/// Consume messages until the first decodable frame; accept only `register`
async fn read_register(stream: &mut SplitStream<WebSocket>) -> Option<u16> {
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match decode_frame(text.as_str()) {
                Ok(Frame::Register { port }) => return Some(port),
                Ok(frame) => {
                    warn!("Expected register frame, got {:?}", frame);
                    return None;
                }
                Err(e) => {
                    warn!("Malformed frame during handshake: {}", e);
                    return None;
                }
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => {}
            Err(e) => {
                debug!("Channel error during handshake: {}", e);
                return None;
            }
        }
    }
    None
}

/// Writer task - serializes queued frames onto the socket
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<Frame>,
    handle: TunnelHandle,
) {
    while let Some(frame) = frame_rx.recv().await {
        let text = match encode_frame(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping unencodable frame: {}", e);
                continue;
            }
        };

        handle.record_bytes_sent(text.len() as u64);

        if let Err(e) = sink.send(Message::Text(text.into())).await {
            debug!("Channel write failed: {}", e);
            break;
        }
    }

    let _ = sink.close().await;
}

/// Reader task - dispatches inbound frames to in-flight mailboxes
async fn read_loop(stream: &mut SplitStream<WebSocket>, handle: &TunnelHandle) {
    let cancel = handle.cancel_token();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Text(text))) => {
                handle.record_bytes_received(text.len() as u64);

                match decode_frame(text.as_str()) {
                    Ok(frame) => route_frame(handle, frame).await,
                    Err(e) => {
                        // Protocol error: log and continue, the channel stays up
                        warn!("Malformed frame on channel {}: {}", handle.conn_id(), e);
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong handled by the websocket layer
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("Channel {} read error: {}", handle.conn_id(), e);
                break;
            }
        }
    }
}

async fn route_frame(handle: &TunnelHandle, frame: Frame) {
    match frame {
        Frame::Chunk { .. } | Frame::End { .. } | Frame::Response { .. } => {
            // Unknown ids are tolerated: the request may have timed out
            handle.inflight().dispatch(frame).await;
        }
        Frame::Error { message } => {
            warn!("Client error on channel {}: {}", handle.conn_id(), message);
        }
        Frame::Register { .. } | Frame::Registered { .. } | Frame::Request { .. } => {
            warn!(
                "Unexpected {:?} frame on registered channel {}",
                frame,
                handle.conn_id()
            );
        }
    }
}
