//! Downstream service handlers.
//!
//! `ServiceHandler` is the seam between the payment pipeline and whatever
//! actually answers the call: the passthrough proxy for backends that speak
//! the gateway's own framing, or the loopback echo when passthrough is
//! disabled. Translating backends (HTTP, JSON-RPC, subprocess) plug in at the
//! same seam.

pub mod passthrough;
pub mod wire;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stream::{Frame, WrappedStream};
use crate::types::{Metadata, Status};

pub use passthrough::PassthroughHandler;

/// Innermost handler of the interceptor chain: answers the wrapped call.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    async fn handle(&self, stream: WrappedStream) -> Result<(), Status>;
}

/// Read-only service description consumed at construction time.
#[derive(Debug, Clone, Default)]
pub struct ServiceMetadata {
    special_methods: HashSet<String>,
}

impl ServiceMetadata {
    pub fn new(special_methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            special_methods: special_methods.into_iter().collect(),
        }
    }

    /// Whether a method is a model-management call that routes to the
    /// dedicated endpoint.
    pub fn is_special_method(&self, method: &str) -> bool {
        self.special_methods.contains(method)
    }
}

/// Event stream produced by a backend connection's read pump.
#[derive(Debug)]
pub enum BackendEvent {
    /// Response header metadata; arrives before any frame.
    Header(Metadata),
    /// One response frame.
    Frame(Frame),
    /// The backend finished the call: final status plus trailer metadata.
    Closed { status: Status, trailer: Metadata },
}

/// Sending half of a backend connection.
#[async_trait]
pub trait BackendSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), Status>;

    /// Signal "no more frames from the gateway" without tearing down the
    /// connection.
    async fn close_send(&self) -> Result<(), Status>;
}

/// An established outbound call to the backend service.
pub struct BackendStream {
    pub(crate) events: mpsc::Receiver<BackendEvent>,
    pub(crate) sink: Arc<dyn BackendSink>,
    pub(crate) cancel: CancellationToken,
}

impl BackendStream {
    /// Assemble a backend stream from its parts. The passthrough dialer uses
    /// this; tests feed it channel-backed fakes.
    pub fn from_parts(
        events: mpsc::Receiver<BackendEvent>,
        sink: Arc<dyn BackendSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            events,
            sink,
            cancel,
        }
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<BackendEvent>,
        Arc<dyn BackendSink>,
        CancellationToken,
    ) {
        (self.events, self.sink, self.cancel)
    }
}

/// Echo handler used when passthrough is disabled: every received frame is
/// sent straight back until the caller half-closes.
pub struct LoopbackHandler;

#[async_trait]
impl ServiceHandler for LoopbackHandler {
    async fn handle(&self, mut stream: WrappedStream) -> Result<(), Status> {
        while let Some(frame) = stream.recv().await? {
            stream.send(frame).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::support::{call_with, ScriptedSource, SinkEvent};
    use crate::stream::CallContext;

    #[test]
    fn test_special_method_lookup() {
        let metadata = ServiceMetadata::new(vec!["/training.Model/train_model".to_string()]);
        assert!(metadata.is_special_method("/training.Model/train_model"));
        assert!(!metadata.is_special_method("/example.Echo/say"));
    }

    #[tokio::test]
    async fn test_loopback_echoes_all_frames() {
        let (call, events) = call_with(
            Some(Metadata::new()),
            ScriptedSource::frames(vec![b"a", b"b", b"c"]),
        );
        let context = CallContext::from_call(&call).unwrap();
        let stream = WrappedStream::new(call, context, false).await.unwrap();

        LoopbackHandler.handle(stream).await.unwrap();

        let events = events.lock().unwrap();
        let frames: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Frame(f) => Some(f.0.to_vec()),
                _ => None,
            })
            .collect();
        assert_eq!(frames, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
