//! End-to-end gateway tests over loopback sockets.
//!
//! Stands up the real server in front of a stub echo backend and drives calls
//! with a plain WebSocket client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::Message;

use tollgate::backend::wire::{self, ControlFrame};
use tollgate::server::{self, AppState};
use tollgate::types::{Metadata, StatusCode};
use tollgate::{Args, Status};

const CALL_PATH: &str = "/call/example.Echo/say";

/// Stub backend that echoes every frame and finishes the call with an OK
/// status once the gateway half-closes.
async fn spawn_echo_backend() -> (std::net::SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                let (mut sink, mut source) = ws.split();
                while let Some(Ok(message)) = source.next().await {
                    match message {
                        Message::Binary(data) => {
                            if sink.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        Message::Text(text) => {
                            if matches!(wire::parse(&text), Ok(ControlFrame::Eos)) {
                                let status = wire::encode(&ControlFrame::status(
                                    Status::ok(),
                                    Metadata::new(),
                                ));
                                let _ = sink.send(Message::Text(status)).await;
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (addr, connections)
}

async fn spawn_gateway(service_endpoint: String) -> std::net::SocketAddr {
    let args = Args::parse_from(["tollgate", "--service-endpoint", service_endpoint.as_str()]);
    let state = Arc::new(AppState::new(args));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server::run_with_listener(state, listener));
    addr
}

fn call_request(
    gateway: std::net::SocketAddr,
    payment_type: Option<&str>,
) -> Request<()> {
    let mut builder = Request::builder()
        .uri(format!("ws://{}{}", gateway, CALL_PATH))
        .header("Host", gateway.to_string())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key());
    if let Some(payment_type) = payment_type {
        builder = builder.header("snet-payment-type", payment_type);
    }
    builder.body(()).unwrap()
}

async fn next_message(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Message {
    timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended unexpectedly")
        .expect("transport error")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_default_handler_call_round_trips_unmodified() {
    let (backend, _connections) = spawn_echo_backend().await;
    let gateway = spawn_gateway(format!("ws://{}", backend)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(call_request(gateway, None))
        .await
        .expect("connect to gateway");

    ws.send(Message::Binary(b"hello tollgate".to_vec()))
        .await
        .unwrap();
    ws.send(Message::Text(wire::encode(&ControlFrame::Eos)))
        .await
        .unwrap();

    // Echoed frame comes back untouched.
    match next_message(&mut ws).await {
        Message::Binary(data) => assert_eq!(data, b"hello tollgate"),
        other => panic!("expected echoed frame, got {:?}", other),
    }

    // The call finishes with an OK status frame.
    match next_message(&mut ws).await {
        Message::Text(text) => match wire::parse(&text).unwrap() {
            ControlFrame::Status { status, .. } => assert_eq!(status.code, StatusCode::Ok),
            other => panic!("expected status frame, got {:?}", other),
        },
        other => panic!("expected status frame, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_payment_type_is_rejected_before_backend() {
    let (backend, connections) = spawn_echo_backend().await;
    let gateway = spawn_gateway(format!("ws://{}", backend)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(call_request(gateway, Some("unknown-type")))
        .await
        .expect("connect to gateway");

    // The first message is consumed eagerly before handler dispatch, so the
    // rejection arrives after it.
    ws.send(Message::Binary(b"x".to_vec())).await.unwrap();

    match next_message(&mut ws).await {
        Message::Text(text) => match wire::parse(&text).unwrap() {
            ControlFrame::Status { status, .. } => {
                assert_eq!(status.code, StatusCode::InvalidArgument);
                assert!(status.message.contains("snet-payment-type"));
                assert!(status.message.contains("unknown-type"));
            }
            other => panic!("expected status frame, got {:?}", other),
        },
        other => panic!("expected status frame, got {:?}", other),
    }

    // The backend was never dialed.
    assert_eq!(connections.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zero_frame_call_completes() {
    let (backend, _connections) = spawn_echo_backend().await;
    let gateway = spawn_gateway(format!("ws://{}", backend)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(call_request(gateway, None))
        .await
        .expect("connect to gateway");

    // Half-close immediately: no data frames at all.
    ws.send(Message::Text(wire::encode(&ControlFrame::Eos)))
        .await
        .unwrap();

    match next_message(&mut ws).await {
        Message::Text(text) => match wire::parse(&text).unwrap() {
            ControlFrame::Status { status, .. } => assert_eq!(status.code, StatusCode::Ok),
            other => panic!("expected status frame, got {:?}", other),
        },
        other => panic!("expected status frame, got {:?}", other),
    }
}
