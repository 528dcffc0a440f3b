//! Stream wrapper: buffered first message, swappable context, header policy.
//!
//! The wrapper is constructed once per call, immediately after context
//! extraction. Construction performs the eager first receive so the payment
//! layer can inspect the call before any frame moves downstream; the buffered
//! result is replayed by the first `recv`, so no consumer ever observes a
//! double receive or a lost frame.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::stream::{BoxSource, CallContext, Frame, ServerCall, SharedSink, TrailerSlot};
use crate::types::{Metadata, Status};

/// Header transmission policy state.
///
/// Headers go out at most once per call. When `suppress_first` is set (price
/// negotiation mode), the first explicit header send carries backend-internal
/// pricing metadata and is dropped; later sends are forwarded. Redundant sends
/// after a transmission are ignored, never an error, because both the relay
/// and a service handler may legitimately try.
#[derive(Debug)]
struct HeaderState {
    suppress_first: bool,
    suppressed: bool,
    sent: bool,
}

/// Receiving half of a wrapped call stream.
pub struct WrappedSource {
    inner: BoxSource,
    /// First receive outcome captured at construction: a frame, or a clean
    /// end-of-stream when the caller half-closed before sending any data.
    buffered: Option<Option<Frame>>,
}

impl WrappedSource {
    pub async fn recv(&mut self) -> Result<Option<Frame>, Status> {
        if let Some(first) = self.buffered.take() {
            return Ok(first);
        }
        self.inner.recv().await
    }
}

/// Sending half of a wrapped call stream.
#[derive(Clone)]
pub struct WrappedSink {
    inner: SharedSink,
    header: Arc<Mutex<HeaderState>>,
    trailer: TrailerSlot,
}

impl WrappedSink {
    pub async fn send(&self, frame: Frame) -> Result<(), Status> {
        self.inner.send(frame).await
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        {
            let mut state = self.header.lock().unwrap_or_else(|e| e.into_inner());
            if state.suppress_first && !state.suppressed {
                state.suppressed = true;
                debug!("dropping first explicit header send (price negotiation)");
                return Ok(());
            }
            if state.sent {
                debug!("response headers already transmitted, ignoring");
                return Ok(());
            }
            state.sent = true;
        }
        self.inner.send_header(metadata).await
    }

    pub fn set_trailer(&self, metadata: Metadata) {
        self.trailer.set(metadata);
    }
}

/// Wrapped inbound call stream handed to the downstream service handler.
///
/// Behaves like the underlying stream except that `context()` returns the
/// possibly-enriched call context and the first `recv` replays the message
/// buffered at construction.
pub struct WrappedStream {
    source: WrappedSource,
    sink: WrappedSink,
    context: ArcSwap<CallContext>,
}

impl std::fmt::Debug for WrappedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedStream").finish_non_exhaustive()
    }
}

impl WrappedStream {
    /// Wrap an inbound call, eagerly receiving its first message.
    ///
    /// A transport failure on that receive fails the call here; no payment
    /// handler is ever invoked for a call whose first message can't be read.
    pub async fn new(
        mut call: ServerCall,
        context: CallContext,
        suppress_first_header: bool,
    ) -> Result<Self, Status> {
        let first = call.source.recv().await?;
        Ok(Self {
            source: WrappedSource {
                inner: call.source,
                buffered: Some(first),
            },
            sink: WrappedSink {
                inner: call.sink,
                header: Arc::new(Mutex::new(HeaderState {
                    suppress_first: suppress_first_header,
                    suppressed: false,
                    sent: false,
                })),
                trailer: call.trailer,
            },
            context: ArcSwap::from_pointee(context),
        })
    }

    /// Current call context; reflects enrichment once it has happened.
    pub fn context(&self) -> Arc<CallContext> {
        self.context.load_full()
    }

    /// Atomically replace the call context. Readers observe either the old or
    /// the new value, never a partial update.
    pub fn swap_context(&self, context: CallContext) {
        self.context.store(Arc::new(context));
    }

    /// The message captured by the eager first receive, if it was a frame.
    pub fn buffered_first(&self) -> Option<&Frame> {
        self.source.buffered.as_ref().and_then(|f| f.as_ref())
    }

    pub async fn recv(&mut self) -> Result<Option<Frame>, Status> {
        self.source.recv().await
    }

    pub async fn send(&self, frame: Frame) -> Result<(), Status> {
        self.sink.send(frame).await
    }

    pub async fn send_header(&self, metadata: Metadata) -> Result<(), Status> {
        self.sink.send_header(metadata).await
    }

    pub fn set_trailer(&self, metadata: Metadata) {
        self.sink.set_trailer(metadata);
    }

    /// Split into receive and send halves for the bidirectional relay.
    pub fn into_split(self) -> (WrappedSource, WrappedSink) {
        (self.source, self.sink)
    }
}
