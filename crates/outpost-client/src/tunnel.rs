//! Control-channel runtime
//!
//! Opens the WebSocket to the edge, registers, and runs the read loop that
//! feeds the dispatcher. `run_with_reconnect` wraps one session after
//! another behind the backoff controller until cancelled or exhausted.

use futures_util::{SinkExt, StreamExt};
use outpost_proto::{decode_frame, encode_frame, Frame, CONNECT_PATH};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::error::TunnelError;
use crate::reconnect::{ReconnectConfig, ReconnectController, ReconnectError};

/// Outbound frame queue depth
const FRAME_QUEUE_CAPACITY: usize = 256;

type Channel = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for one tunnel run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Edge base URL (`http://` or `https://`)
    pub domain: String,
    /// Local port requests are dispatched against
    pub local_port: u16,
    /// Give up after this many consecutive failed attempts (None = never)
    pub max_reconnect_attempts: Option<usize>,
}

/// Derive the control-channel URL from the configured edge domain
pub fn control_url(domain: &str) -> Result<String, TunnelError> {
    if let Some(rest) = domain.strip_prefix("https://") {
        Ok(format!("wss://{}{}", rest, CONNECT_PATH))
    } else if let Some(rest) = domain.strip_prefix("http://") {
        Ok(format!("ws://{}{}", rest, CONNECT_PATH))
    } else {
        Err(TunnelError::InvalidDomain(domain.to_string()))
    }
}

/// Open the tunnel and keep it open until cancelled.
///
/// Each successful open resets the backoff counter and writes
/// `status.json`; every disconnect removes it. Returns an error only when
/// the retry budget is exhausted.
pub async fn run_with_reconnect(
    config: RunConfig,
    store: ConfigStore,
    cancel: CancellationToken,
) -> Result<(), TunnelError> {
    let url = control_url(&config.domain)?;

    let reconnect_config = ReconnectConfig {
        max_attempts: config.max_reconnect_attempts,
        ..Default::default()
    };
    let mut controller = ReconnectController::new(reconnect_config, cancel.clone());

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match connect_async(&url).await {
            Ok((channel, _)) => {
                // Open succeeded: the counter resets here, not on the ack
                controller.reset();
                info!("Control channel open to {}", config.domain);

                if let Err(e) = store.write_status(&config.domain, config.local_port) {
                    warn!("Failed to write status file: {}", e);
                }

                let result = run_session(channel, config.local_port, &cancel).await;
                store.clear_status();

                match result {
                    Ok(()) => {
                        info!("Tunnel shut down");
                        return Ok(());
                    }
                    Err(e) => warn!("Control channel lost: {}", e),
                }
            }
            Err(e) => {
                warn!("Failed to open control channel: {}", e);
            }
        }

        match controller.wait().await {
            Ok(()) => {}
            Err(ReconnectError::Cancelled) => return Ok(()),
            Err(ReconnectError::MaxAttemptsReached) => {
                return Err(TunnelError::ReconnectExhausted(
                    controller.attempt().saturating_sub(1),
                ));
            }
        }
    }
}

/// One channel lifetime: register, then dispatch frames until the channel
/// drops or the run is cancelled.
async fn run_session(
    channel: Channel,
    local_port: u16,
    cancel: &CancellationToken,
) -> Result<(), TunnelError> {
    let (mut sink, mut stream) = channel.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(FRAME_QUEUE_CAPACITY);

    // Single writer task keeps frame boundaries atomic however many
    // response pumps are writing
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = match encode_frame(&frame) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping unencodable frame: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let dispatcher = Dispatcher::new(local_port, frame_tx.clone());

    if frame_tx
        .send(Frame::Register { port: local_port })
        .await
        .is_err()
    {
        writer.abort();
        return Err(TunnelError::ChannelClosed);
    }

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(()),
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => match decode_frame(text.as_str()) {
                    Ok(frame) => dispatcher.handle_frame(frame).await,
                    Err(e) => {
                        // Protocol error: the channel itself stays up
                        warn!("Malformed frame from edge: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break Err(TunnelError::ChannelClosed),
                // Ping/pong handled by the websocket layer
                Some(Ok(_)) => {}
                Some(Err(e)) => break Err(e.into()),
            }
        }
    };

    writer.abort();
    result
}
