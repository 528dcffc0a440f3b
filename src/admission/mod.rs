//! Admission control: token-bucket rate limiting plus the global
//! processing-enabled flag.
//!
//! The admission interceptor is the outermost link of the chain: no payment
//! work ever happens for a call it rejects. The flag is updated by a
//! dedicated task subscribed to the operator control broadcaster; that task
//! lives for the whole process and writes nothing else.

pub mod bucket;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use crate::control::{ControlBroadcaster, ProcessingDirective};
use crate::stream::{CallHandler, ServerCall};
use crate::types::Status;

pub use bucket::TokenBucket;

pub struct AdmissionInterceptor {
    limiter: Arc<TokenBucket>,
    processing_enabled: Arc<AtomicBool>,
    inner: Arc<dyn CallHandler>,
}

impl AdmissionInterceptor {
    /// Create the interceptor and spawn its flag-update task.
    pub fn new(
        limiter: Arc<TokenBucket>,
        broadcaster: &ControlBroadcaster,
        inner: Arc<dyn CallHandler>,
    ) -> Self {
        let processing_enabled = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&processing_enabled);
        let mut rx = broadcaster.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(directive) => {
                        let enabled = directive == ProcessingDirective::Start;
                        flag.store(enabled, Ordering::SeqCst);
                        info!(enabled, "request processing directive received");
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            limiter,
            processing_enabled,
            inner,
        }
    }

    /// Handle on the shared flag, for health surfaces and tests.
    pub fn processing_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.processing_enabled)
    }
}

#[async_trait]
impl CallHandler for AdmissionInterceptor {
    async fn handle(&self, call: ServerCall) -> Result<(), Status> {
        if !self.processing_enabled.load(Ordering::SeqCst) {
            return Err(Status::unavailable(
                "no requests are currently being processed, please try again later",
            ));
        }
        if !self.limiter.allow() {
            info!(
                burst = self.limiter.burst(),
                "rate limit reached, too many requests to handle"
            );
            return Err(Status::resource_exhausted(
                "rate limit reached, too many requests to handle",
            ));
        }
        self.inner.handle(call).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::stream::support::{call_with, ScriptedSource};
    use crate::types::{Metadata, StatusCode};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CallHandler for CountingHandler {
        async fn handle(&self, _call: ServerCall) -> Result<(), Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        })
    }

    fn some_call() -> ServerCall {
        let (call, _) = call_with(Some(Metadata::new()), ScriptedSource::frames(vec![]));
        call
    }

    #[tokio::test]
    async fn test_allows_and_delegates() {
        let handler = counting();
        let broadcaster = ControlBroadcaster::new();
        let interceptor = AdmissionInterceptor::new(
            Arc::new(TokenBucket::from_config("", 0)),
            &broadcaster,
            handler.clone(),
        );

        interceptor.handle(some_call()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_call_never_reaches_inner() {
        let handler = counting();
        let broadcaster = ControlBroadcaster::new();
        let interceptor = AdmissionInterceptor::new(
            Arc::new(TokenBucket::new(Some(0.000001), 1)),
            &broadcaster,
            handler.clone(),
        );

        interceptor.handle(some_call()).await.unwrap();
        let err = interceptor.handle(some_call()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::ResourceExhausted);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_paused_gateway_rejects_before_any_work() {
        let handler = counting();
        let broadcaster = ControlBroadcaster::new();
        let interceptor = AdmissionInterceptor::new(
            Arc::new(TokenBucket::from_config("", 0)),
            &broadcaster,
            handler.clone(),
        );
        interceptor.processing_flag().store(false, Ordering::SeqCst);

        let err = interceptor.handle(some_call()).await.unwrap_err();
        assert_eq!(err.code, StatusCode::Unavailable);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flag_follows_broadcast_directives() {
        let handler = counting();
        let broadcaster = ControlBroadcaster::new();
        let interceptor = AdmissionInterceptor::new(
            Arc::new(TokenBucket::from_config("", 0)),
            &broadcaster,
            handler.clone(),
        );
        let flag = interceptor.processing_flag();

        broadcaster.publish(ProcessingDirective::Stop);
        wait_for(|| !flag.load(Ordering::SeqCst)).await;
        assert_eq!(
            interceptor.handle(some_call()).await.unwrap_err().code,
            StatusCode::Unavailable
        );

        broadcaster.publish(ProcessingDirective::Start);
        wait_for(|| flag.load(Ordering::SeqCst)).await;
        interceptor.handle(some_call()).await.unwrap();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    async fn wait_for(predicate: impl Fn() -> bool) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}
