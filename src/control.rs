//! Operator control fan-out.
//!
//! An operator surface can ask the gateway to stop or resume processing
//! requests; the broadcaster fans that directive out to every subscriber
//! (the admission interceptor, health checks).

use tokio::sync::broadcast;

/// Directive broadcast to request-processing subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingDirective {
    /// Process any request
    Start,
    /// Reject every request until told otherwise
    Stop,
}

/// Fan-out broadcaster for processing directives.
#[derive(Debug, Clone)]
pub struct ControlBroadcaster {
    tx: broadcast::Sender<ProcessingDirective>,
}

impl ControlBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessingDirective> {
        self.tx.subscribe()
    }

    /// Publish a directive to all current subscribers.
    pub fn publish(&self, directive: ProcessingDirective) {
        // A send error only means there is no subscriber yet.
        let _ = self.tx.send(directive);
    }
}

impl Default for ControlBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}
