//! Passthrough proxy to a backend speaking the gateway's own framing.
//!
//! Dials the backend over WebSocket, forwarding the call's (possibly
//! enriched) metadata as upgrade request headers, then relays frames in both
//! directions. A dedicated read pump translates wire messages into
//! [`BackendEvent`]s so the relay sees headers strictly before frames and a
//! single terminal event per call.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, Request};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::wire::{self, ControlFrame};
use crate::backend::{BackendEvent, BackendSink, BackendStream, ServiceHandler, ServiceMetadata};
use crate::relay;
use crate::stream::{CallContext, Frame, WrappedStream};
use crate::types::{Metadata, Status};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Relays calls to a backend service that speaks the gateway's framing.
pub struct PassthroughHandler {
    endpoint: String,
    /// Endpoint for model-management calls, when configured separately.
    training_endpoint: Option<String>,
    service: Arc<ServiceMetadata>,
}

impl PassthroughHandler {
    pub fn new(
        endpoint: String,
        training_endpoint: Option<String>,
        service: Arc<ServiceMetadata>,
    ) -> Self {
        Self {
            endpoint,
            training_endpoint,
            service,
        }
    }

    fn endpoint_for(&self, method: &str) -> &str {
        if self.service.is_special_method(method) {
            self.training_endpoint.as_deref().unwrap_or(&self.endpoint)
        } else {
            &self.endpoint
        }
    }
}

#[async_trait]
impl ServiceHandler for PassthroughHandler {
    async fn handle(&self, stream: WrappedStream) -> Result<(), Status> {
        let context = stream.context();
        let endpoint = self.endpoint_for(&context.info.method);
        let outbound = BackendStream::connect(endpoint, &context).await?;
        relay::run(stream, outbound).await
    }
}

impl BackendStream {
    /// Dial the backend and establish the outbound half of a call.
    pub async fn connect(endpoint: &str, context: &CallContext) -> Result<Self, Status> {
        let url = call_url(endpoint, &context.info.method);
        debug!(url = %url, "connecting to backend service");

        // The backend requires a well-formed handshake; call metadata rides
        // along as additional headers, minus anything handshake-reserved.
        let mut request = Request::builder()
            .uri(&url)
            .header("Host", endpoint.split("//").last().unwrap_or("localhost"))
            .header("Origin", "http://localhost")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .body(())
            .map_err(|e| Status::internal(format!("failed to build backend request: {}", e)))?;

        let headers = request.headers_mut();
        for (key, values) in context.metadata.iter() {
            if is_handshake_header(key) {
                continue;
            }
            for value in values {
                match (
                    HeaderName::from_bytes(key.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => {
                        headers.append(name, value);
                    }
                    _ => warn!(key, "skipping metadata entry not representable as header"),
                }
            }
        }

        let (ws, _response) = connect_async_with_config(request, None, false)
            .await
            .map_err(|e| Status::internal(format!("can't connect to service: {}", e)))?;

        info!(endpoint, method = %context.info.method, "connected to backend service");

        let (ws_sink, ws_source) = ws.split();
        let (events_tx, events_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tokio::spawn(read_pump(ws_source, events_tx, cancel.clone()));

        Ok(Self::from_parts(
            events_rx,
            Arc::new(WsBackendSink {
                sink: Mutex::new(ws_sink),
            }),
            cancel,
        ))
    }
}

struct WsBackendSink {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl BackendSink for WsBackendSink {
    async fn send(&self, frame: Frame) -> Result<(), Status> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.into_bytes().to_vec()))
            .await
            .map_err(|e| Status::unavailable(format!("backend send error: {}", e)))
    }

    async fn close_send(&self) -> Result<(), Status> {
        self.sink
            .lock()
            .await
            .send(Message::Text(wire::encode(&ControlFrame::Eos)))
            .await
            .map_err(|e| Status::unavailable(format!("backend half-close error: {}", e)))
    }
}

/// Translate backend wire messages into relay events until the call ends or
/// the relay cancels the connection.
async fn read_pump(
    mut source: SplitStream<WsStream>,
    events: mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = source.next() => message,
        };

        let terminal = match message {
            Some(Ok(Message::Binary(data))) => {
                if events.send(BackendEvent::Frame(Frame::new(data))).await.is_err() {
                    break;
                }
                continue;
            }
            Some(Ok(Message::Text(text))) => match wire::parse(&text) {
                Ok(ControlFrame::Header { metadata }) => {
                    if events.send(BackendEvent::Header(metadata)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Ok(ControlFrame::Status { status, metadata }) => BackendEvent::Closed {
                    status,
                    trailer: metadata,
                },
                Ok(ControlFrame::Eos) => BackendEvent::Closed {
                    status: Status::internal("unexpected eos control frame from backend"),
                    trailer: Metadata::new(),
                },
                Err(e) => BackendEvent::Closed {
                    status: e,
                    trailer: Metadata::new(),
                },
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
            Some(Ok(Message::Close(frame))) => {
                debug!(frame = ?frame, "backend closed connection without status");
                BackendEvent::Closed {
                    status: Status::internal("backend closed the stream without a status"),
                    trailer: Metadata::new(),
                }
            }
            None => BackendEvent::Closed {
                status: Status::internal("backend closed the stream without a status"),
                trailer: Metadata::new(),
            },
            Some(Err(e)) => BackendEvent::Closed {
                status: Status::unavailable(format!("backend transport error: {}", e)),
                trailer: Metadata::new(),
            },
        };

        let _ = events.send(terminal).await;
        break;
    }
}

fn call_url(endpoint: &str, method: &str) -> String {
    format!("{}/call{}", endpoint.trim_end_matches('/'), method)
}

/// Headers owned by the WebSocket handshake itself; never forwarded as call
/// metadata.
fn is_handshake_header(key: &str) -> bool {
    matches!(key, "host" | "connection" | "upgrade" | "origin")
        || key.starts_with("sec-websocket-")
}
