//! WebSocket upgrade and call driving.
//!
//! Each upgraded connection is one call: the upgrade request headers are the
//! call metadata, binary messages are data frames, and the server always
//! finishes the call with a status control frame followed by Close.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info};

use crate::backend::wire::{self, ControlFrame};
use crate::server::AppState;
use crate::stream::{CallInfo, Frame, FrameSink, FrameSource, ServerCall, TrailerSlot};
use crate::types::{Metadata, Status};

type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Handle a WebSocket upgrade on the call surface.
pub async fn handle_call_upgrade(
    state: Arc<AppState>,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    // "/call/example.Echo/say" -> method "/example.Echo/say"
    let method = req
        .uri()
        .path()
        .strip_prefix("/call")
        .unwrap_or_default()
        .to_string();
    if method.len() <= 1 {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Full::new(Bytes::from("missing method name")))
            .unwrap();
    }

    let metadata = Metadata::from_header_map(req.headers());

    match hyper_tungstenite::upgrade(req, None) {
        Ok((response, websocket)) => {
            tokio::spawn(async move {
                match websocket.await {
                    Ok(ws) => run_call(state, ws, method, metadata).await,
                    Err(e) => error!("WebSocket upgrade failed: {:?}", e),
                }
            });

            let (parts, _) = response.into_parts();
            Response::from_parts(parts, Full::new(Bytes::new()))
        }
        Err(e) => {
            error!("WebSocket upgrade error: {:?}", e);
            Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .body(Full::new(Bytes::from(format!(
                    "WebSocket upgrade failed: {e}"
                ))))
                .unwrap()
        }
    }
}

/// Drive one call through the interceptor chain, then write its final status.
async fn run_call(state: Arc<AppState>, ws: HyperWebSocket, method: String, metadata: Metadata) {
    info!(method = %method, "call opened");

    let (sink, source) = ws.split();
    let shared_sink = Arc::new(Mutex::new(sink));

    let info = Arc::new(CallInfo {
        method: method.clone(),
        client_streaming: true,
        server_streaming: true,
    });
    let trailer = TrailerSlot::default();
    let call = ServerCall {
        info,
        metadata: Some(metadata),
        source: Box::new(WsFrameSource { source }),
        sink: Arc::new(WsFrameSink {
            sink: Arc::clone(&shared_sink),
        }),
        trailer: trailer.clone(),
    };

    // The chain runs in its own task so a re-raised service panic still
    // results in a well-formed status on the wire; the crash itself stays
    // visible in the logs.
    let chain = Arc::clone(&state.chain);
    let status = match tokio::spawn(async move { chain.handle(call).await }).await {
        Ok(Ok(())) => Status::ok(),
        Ok(Err(status)) => status,
        Err(join_error) if join_error.is_panic() => {
            error!(method = %method, "call task panicked");
            Status::internal("service handler panicked")
        }
        Err(_) => Status::internal("call task was cancelled"),
    };

    let frame = ControlFrame::status(status.clone(), trailer.take().unwrap_or_default());
    let mut sink = shared_sink.lock().await;
    if let Err(e) = sink.send(Message::Text(wire::encode(&frame))).await {
        debug!(error = %e, "failed to write final status");
    }
    let _ = sink.send(Message::Close(None)).await;

    info!(method = %method, code = %status.code, "call closed");
}

struct WsFrameSource {
    source: SplitStream<HyperWebSocket>,
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Result<Option<Frame>, Status> {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Frame::new(data))),
                Some(Ok(Message::Text(text))) => match wire::parse(&text)? {
                    ControlFrame::Eos => return Ok(None),
                    frame => {
                        return Err(Status::internal(format!(
                            "unexpected control frame from caller: {:?}",
                            frame
                        )))
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Status::cancelled("caller closed the stream"))
                }
                Some(Err(e)) => {
                    return Err(Status::internal(format!("transport receive error: {}", e)))
                }
            }
        }
    }
}

struct WsFrameSink {
    sink: Arc<Mutex<SplitSink<HyperWebSocket, Message>>>,
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&self, frame: Frame) -> Result<(), Status> {
        self.sink
            .lock()
            .await
            .send(Message::Binary(frame.into_bytes().to_vec()))
            .await
            .map_err(|e| Status::internal(format!("transport send error: {}", e)))
    }

    async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.sink
            .lock()
            .await
            .send(Message::Text(wire::encode(&ControlFrame::Header {
                metadata,
            })))
            .await
            .map_err(|e| Status::internal(format!("transport send error: {}", e)))
    }
}
