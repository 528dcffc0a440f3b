//! Payment validation orchestrator.
//!
//! Resolves the call context, wraps the stream (eagerly receiving the first
//! message), selects the payment handler, validates the payment, optionally
//! enriches the context with the payer address, runs the downstream handler
//! and settles the payment exactly once, on success, on error and on panic.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::backend::ServiceHandler;
use crate::payment::registry::PaymentHandlerRegistry;
use crate::stream::{CallContext, CallHandler, ServerCall, WrappedStream};
use crate::types::metadata::USER_ADDRESS_HEADER;
use crate::types::Status;

pub struct PaymentValidationInterceptor {
    registry: PaymentHandlerRegistry,
    inner: Arc<dyn ServiceHandler>,
    suppress_first_header: bool,
}

impl PaymentValidationInterceptor {
    pub fn new(
        registry: PaymentHandlerRegistry,
        inner: Arc<dyn ServiceHandler>,
        suppress_first_header: bool,
    ) -> Self {
        Self {
            registry,
            inner,
            suppress_first_header,
        }
    }
}

#[async_trait]
impl CallHandler for PaymentValidationInterceptor {
    async fn handle(&self, call: ServerCall) -> Result<(), Status> {
        let context = CallContext::from_call(&call)?;
        debug!(method = %context.info.method, "new call received");

        // The wrapper performs the eager first receive; a call whose first
        // message can't be read never reaches a payment handler.
        let wrapped = WrappedStream::new(call, context.clone(), self.suppress_first_header).await?;

        let handler = self.registry.select(&context)?;

        let payment = handler.payment(&context).await?;
        debug!(payment = ?payment, "new payment received");

        // Assert the payer address downstream so business logic can trust a
        // gateway-set header instead of a client-set one.
        if let Some(address) = payment.sender_address() {
            let mut metadata = (*context.metadata).clone();
            metadata.set(USER_ADDRESS_HEADER, &address);
            wrapped.swap_context(CallContext::new(metadata, Arc::clone(&context.info)));
        }

        let outcome = AssertUnwindSafe(self.inner.handle(wrapped))
            .catch_unwind()
            .await;

        // Every path below settles exactly once.
        match outcome {
            Err(panic) => {
                let panic_error = Status::internal(format!(
                    "service handler panicked: {}",
                    panic_message(&panic)
                ));
                warn!(error = %panic_error, "service handler panicked, rolling back payment");
                if let Err(settle_error) =
                    handler.complete_after_error(payment, &panic_error).await
                {
                    error!(error = %settle_error, "payment rollback failed after panic");
                }
                // The payment layer must not swallow a service crash; it only
                // gets a chance to roll back financial state first.
                std::panic::resume_unwind(panic);
            }
            Ok(Ok(())) => handler.complete(payment).await,
            Ok(Err(call_error)) => {
                warn!(error = %call_error, "service handler returned error");
                match handler.complete_after_error(payment, &call_error).await {
                    // A failed rollback must be visible to the caller.
                    Err(settle_error) => Err(settle_error),
                    Ok(()) => Err(call_error),
                }
            }
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
