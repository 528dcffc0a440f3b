//! Call streams and per-call context.
//!
//! A call is one logical RPC invocation carrying a stream of opaque frames in
//! each direction. The transport (WebSocket front door, channel-backed fakes
//! in tests) is hidden behind the [`FrameSource`]/[`FrameSink`] seams; the
//! interceptor chain only ever sees a [`ServerCall`].

pub mod wrapper;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{Metadata, Status};

pub use wrapper::{WrappedSink, WrappedSource, WrappedStream};

/// One opaque message unit exchanged during a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(pub Bytes);

impl Frame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

/// Static information about a call, fixed at call entry.
#[derive(Debug, Clone)]
pub struct CallInfo {
    /// Full method name, e.g. "/example.Calculator/add"
    pub method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

/// Immutable per-call context: header metadata plus static call info.
///
/// Cheap to clone; enrichment produces a new value rather than mutating.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub metadata: Arc<Metadata>,
    pub info: Arc<CallInfo>,
}

impl CallContext {
    pub fn new(metadata: Metadata, info: Arc<CallInfo>) -> Self {
        Self {
            metadata: Arc::new(metadata),
            info,
        }
    }

    /// Extract the call context from an inbound call.
    ///
    /// A call whose transport provided no header map at all is a protocol
    /// violation and is rejected before any payment work happens.
    pub fn from_call(call: &ServerCall) -> Result<Self, Status> {
        match &call.metadata {
            Some(metadata) => Ok(Self::new(metadata.clone(), Arc::clone(&call.info))),
            None => Err(Status::invalid_argument("missing metadata")),
        }
    }
}

/// Receiving half of a call stream. Exclusively owned by one task.
///
/// `Ok(None)` is the clean end-of-stream; any `Err` is a transport failure.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn recv(&mut self) -> Result<Option<Frame>, Status>;
}

/// Sending half of a call stream. Internally synchronized so the relay and
/// the server loop can share it.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), Status>;

    /// Transmit response header metadata. Must precede the first data frame;
    /// the transport enforces at most one transmission per call.
    async fn send_header(&self, metadata: Metadata) -> Result<(), Status>;
}

pub type BoxSource = Box<dyn FrameSource>;
pub type SharedSink = Arc<dyn FrameSink>;

/// Trailer metadata slot, written during the call and flushed with the final
/// status frame by the server loop.
#[derive(Debug, Clone, Default)]
pub struct TrailerSlot(Arc<Mutex<Option<Metadata>>>);

impl TrailerSlot {
    pub fn set(&self, metadata: Metadata) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(metadata);
    }

    pub fn take(&self) -> Option<Metadata> {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        slot.take()
    }
}

/// An inbound call as seen by the interceptor chain.
pub struct ServerCall {
    pub info: Arc<CallInfo>,
    /// Transport-provided header metadata; `None` indicates a transport
    /// violation and fails context extraction.
    pub metadata: Option<Metadata>,
    pub source: BoxSource,
    pub sink: SharedSink,
    pub trailer: TrailerSlot,
}

/// One link of the interceptor chain. Implementations either terminate the
/// call with a status or delegate to the next handler unchanged.
#[async_trait]
pub trait CallHandler: Send + Sync {
    async fn handle(&self, call: ServerCall) -> Result<(), Status>;
}


#[cfg(test)]
mod tests {
    use super::support::ScriptedSource;
    use super::*;

    #[tokio::test]
    async fn test_context_extraction_requires_metadata() {
        let (call, _) = support::call_with(None, ScriptedSource::frames(vec![]));
        let err = CallContext::from_call(&call).unwrap_err();
        assert_eq!(err.code, crate::types::StatusCode::InvalidArgument);
        assert_eq!(err.message, "missing metadata");
    }

    #[tokio::test]
    async fn test_context_extraction_does_not_consume_messages() {
        let mut md = Metadata::new();
        md.set("snet-payment-type", "escrow");
        let (mut call, _) = support::call_with(Some(md), ScriptedSource::frames(vec![b"first"]));

        let context = CallContext::from_call(&call).unwrap();
        assert_eq!(context.metadata.get_first("snet-payment-type"), Some("escrow"));

        // The first frame is still on the stream.
        let frame = call.source.recv().await.unwrap().unwrap();
        assert_eq!(frame.0.as_ref(), b"first");
    }

    #[test]
    fn test_trailer_slot() {
        let slot = TrailerSlot::default();
        assert!(slot.take().is_none());
        let mut md = Metadata::new();
        md.set("x-post", "1");
        slot.set(md.clone());
        assert_eq!(slot.take(), Some(md));
        assert!(slot.take().is_none());
    }
}
