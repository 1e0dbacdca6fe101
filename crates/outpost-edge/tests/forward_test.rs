//! Edge behavior against a scripted tunnel client
//!
//! Each test spins up the edge router on an ephemeral port and drives the
//! control channel with a hand-rolled websocket client, so the per-request
//! state machine is exercised over real frames.

use futures_util::{SinkExt, StreamExt};
use outpost_edge::server::{build_router, AppState};
use outpost_edge::TunnelManager;
use outpost_proto::{decode_frame, encode_body, encode_frame, Direction, Frame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_edge(request_timeout: Duration) -> (SocketAddr, Arc<TunnelManager>) {
    let manager = Arc::new(TunnelManager::new());
    let state = AppState {
        manager: manager.clone(),
        request_timeout,
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (addr, manager)
}

fn text(frame: &Frame) -> Message {
    Message::Text(encode_frame(frame).unwrap().into())
}

async fn next_frame(ws: &mut Ws) -> Frame {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return decode_frame(text.as_str()).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("Channel ended unexpectedly: {:?}", other),
        }
    }
}

async fn register_client(addr: SocketAddr, port: u16) -> Ws {
    let (mut ws, _) = connect_async(format!("ws://{}/connect", addr))
        .await
        .unwrap();

    ws.send(text(&Frame::Register { port })).await.unwrap();

    match next_frame(&mut ws).await {
        Frame::Registered { port: echoed } => assert_eq!(echoed, port),
        other => panic!("Expected registered ack, got {:?}", other),
    }

    ws
}

#[tokio::test]
async fn test_no_tunnel_returns_503() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;

    let response = reqwest::get(format!("http://{}/x", addr)).await.unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "No active tunnel");
}

#[tokio::test]
async fn test_health_reflects_registration() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["tunnel"]["connected"], false);

    let _ws = register_client(addr, 4321).await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["tunnel"]["connected"], true);
    assert_eq!(health["tunnel"]["port"], 4321);
}

#[tokio::test]
async fn test_simple_get_inline_response() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    let responder = tokio::spawn(async move {
        let frame = next_frame(&mut ws).await;
        let Frame::Request {
            id,
            method,
            url,
            headers,
            has_body,
        } = frame
        else {
            panic!("Expected request frame");
        };

        assert_eq!(method, "GET");
        assert_eq!(url, "/hello?name=world");
        assert!(!has_body);
        // No hop-by-hop header may cross the channel
        assert!(headers.iter().all(|(name, _)| !outpost_proto::is_hop_by_hop(name)));

        ws.send(text(&Frame::Response {
            id,
            status: 200,
            headers: vec![("content-type".to_string(), "text/plain".to_string())],
            body: Some(encode_body(b"hi")),
            streaming: None,
        }))
        .await
        .unwrap();
    });

    let response = reqwest::get(format!("http://{}/hello?name=world", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/plain");
    assert_eq!(response.text().await.unwrap(), "hi");

    responder.await.unwrap();
}

#[tokio::test]
async fn test_streaming_response_in_order() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    let responder = tokio::spawn(async move {
        let Frame::Request { id, .. } = next_frame(&mut ws).await else {
            panic!("Expected request frame");
        };

        ws.send(text(&Frame::Response {
            id: id.clone(),
            status: 200,
            headers: vec![("content-type".to_string(), "application/octet-stream".to_string())],
            body: None,
            streaming: Some(true),
        }))
        .await
        .unwrap();

        for part in [&b"alpha-"[..], &b"beta-"[..], &b"gamma"[..]] {
            ws.send(text(&Frame::Chunk {
                id: id.clone(),
                data: encode_body(part),
                direction: None,
            }))
            .await
            .unwrap();
        }

        ws.send(text(&Frame::End {
            id,
            direction: None,
        }))
        .await
        .unwrap();
    });

    let response = reqwest::get(format!("http://{}/stream", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"alpha-beta-gamma");

    responder.await.unwrap();
}

#[tokio::test]
async fn test_chunk_before_head_gets_implicit_200() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    let responder = tokio::spawn(async move {
        let Frame::Request { id, .. } = next_frame(&mut ws).await else {
            panic!("Expected request frame");
        };

        // Body-first response: no head frame at all
        ws.send(text(&Frame::Chunk {
            id: id.clone(),
            data: encode_body(b"headless"),
            direction: None,
        }))
        .await
        .unwrap();
        ws.send(text(&Frame::End {
            id,
            direction: None,
        }))
        .await
        .unwrap();
    });

    let response = reqwest::get(format!("http://{}/implicit", addr)).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "headless");

    responder.await.unwrap();
}

#[tokio::test]
async fn test_request_body_pumped_as_chunks() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    let payload: Vec<u8> = (0..128 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let responder = tokio::spawn(async move {
        let Frame::Request { id, has_body, .. } = next_frame(&mut ws).await else {
            panic!("Expected request frame");
        };
        assert!(has_body);

        // Collect the request body: chunk* then end, all request-direction
        let mut received = Vec::new();
        loop {
            match next_frame(&mut ws).await {
                Frame::Chunk {
                    id: chunk_id,
                    data,
                    direction,
                } => {
                    assert_eq!(chunk_id, id);
                    assert_eq!(direction, Some(Direction::Request));
                    received.extend(outpost_proto::decode_body(&data).unwrap());
                }
                Frame::End { direction, .. } => {
                    assert_eq!(direction, Some(Direction::Request));
                    break;
                }
                other => panic!("Unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, expected);

        ws.send(text(&Frame::Response {
            id,
            status: 200,
            headers: vec![],
            body: None,
            streaming: None,
        }))
        .await
        .unwrap();
    });

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{}/upload", addr))
        .body(payload)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    responder.await.unwrap();
}

#[tokio::test]
async fn test_deadline_returns_504() {
    let (addr, manager) = start_edge(Duration::from_millis(300)).await;
    let mut ws = register_client(addr, 3000).await;

    // Swallow the request frame and never respond
    let silent = tokio::spawn(async move {
        let _ = next_frame(&mut ws).await;
        ws
    });

    let response = reqwest::get(format!("http://{}/slow", addr)).await.unwrap();
    assert_eq!(response.status(), 504);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Request timeout");

    // The record must be reaped once the response is produced
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.status().await.in_flight, 0);

    drop(silent);
}

#[tokio::test]
async fn test_channel_drop_fails_request_with_503() {
    let (addr, manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    let dropper = tokio::spawn(async move {
        let _ = next_frame(&mut ws).await;
        // Terminate the channel with the request still awaiting its head
        drop(ws);
    });

    let response = reqwest::get(format!("http://{}/dropped", addr)).await.unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Tunnel disconnected");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.status().await.in_flight, 0);
    assert!(!manager.status().await.connected);

    dropper.await.unwrap();
}

#[tokio::test]
async fn test_second_registration_replaces_first() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;

    let mut first = register_client(addr, 1111).await;
    let _second = register_client(addr, 2222).await;

    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["tunnel"]["port"], 2222);

    // The replaced channel is closed by the edge
    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "replaced channel was not closed");
}

#[tokio::test]
async fn test_concurrent_requests_interleaved() {
    let (addr, _manager) = start_edge(Duration::from_secs(30)).await;
    let mut ws = register_client(addr, 3000).await;

    // Answer three requests, deliberately out of arrival order
    let responder = tokio::spawn(async move {
        let mut ids = Vec::new();
        for _ in 0..3 {
            let Frame::Request { id, url, .. } = next_frame(&mut ws).await else {
                panic!("Expected request frame");
            };
            ids.push((id, url));
        }

        ids.reverse();
        for (id, url) in ids {
            ws.send(text(&Frame::Response {
                id,
                status: 200,
                headers: vec![],
                body: Some(encode_body(url.as_bytes())),
                streaming: None,
            }))
            .await
            .unwrap();
        }
    });

    let client = reqwest::Client::new();
    let mut handles = Vec::new();
    for path in ["/a", "/b", "/c"] {
        let client = client.clone();
        let url = format!("http://{}{}", addr, path);
        handles.push(tokio::spawn(async move {
            let response = client.get(&url).send().await.unwrap();
            (path, response.text().await.unwrap())
        }));
    }

    for handle in handles {
        let (path, body) = handle.await.unwrap();
        assert_eq!(body, path);
    }

    responder.await.unwrap();
}
