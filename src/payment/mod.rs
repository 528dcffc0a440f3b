//! Payment strategy seam.
//!
//! A payment handler extracts, validates, commits and rolls back a call's
//! payment. The gateway never inspects a payment descriptor beyond its
//! sender-address capability; the cryptographic/escrow bookkeeping lives in
//! handler implementations outside this crate.

pub mod interceptor;
pub mod registry;

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use tracing::debug;

use crate::stream::CallContext;
use crate::types::Status;

pub use interceptor::PaymentValidationInterceptor;
pub use registry::PaymentHandlerRegistry;

/// Opaque payment data returned by a handler's extraction step and passed
/// back to the same handler at settlement.
pub trait PaymentDescriptor: fmt::Debug + Send + Sync {
    /// Sender address capability: handlers that resolve the payer's address
    /// expose it here so the gateway can assert it downstream.
    fn sender_address(&self) -> Option<String> {
        None
    }

    /// Handler-side downcast hook.
    fn as_any(&self) -> &dyn Any;
}

pub type Payment = Box<dyn PaymentDescriptor>;

/// Pluggable payment strategy used by the validation interceptor.
#[async_trait]
pub trait PaymentHandler: Send + Sync + std::fmt::Debug {
    /// Stable identifier matched against the payment-type header.
    fn payment_type(&self) -> &'static str;

    /// Extract payment data from the call context and check its validity in
    /// one step: a handler that returns a descriptor has thereby asserted
    /// the payment is valid.
    async fn payment(&self, context: &CallContext) -> Result<Payment, Status>;

    /// Commit the payment after the call succeeded.
    async fn complete(&self, payment: Payment) -> Result<(), Status>;

    /// Roll back / record the payment after the call failed or panicked.
    async fn complete_after_error(&self, payment: Payment, call_error: &Status)
        -> Result<(), Status>;
}

/// Payment handler that accepts every call without charging.
///
/// Used when the gateway runs with payment gating disabled; settlement is a
/// log line.
#[derive(Debug, Default)]
pub struct NoOpPaymentHandler;

#[derive(Debug)]
struct NoOpPayment;

impl PaymentDescriptor for NoOpPayment {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[async_trait]
impl PaymentHandler for NoOpPaymentHandler {
    fn payment_type(&self) -> &'static str {
        "noop"
    }

    async fn payment(&self, context: &CallContext) -> Result<Payment, Status> {
        debug!(method = %context.info.method, "accepting call without payment");
        Ok(Box::new(NoOpPayment))
    }

    async fn complete(&self, _payment: Payment) -> Result<(), Status> {
        debug!("no-op payment completed");
        Ok(())
    }

    async fn complete_after_error(
        &self,
        _payment: Payment,
        call_error: &Status,
    ) -> Result<(), Status> {
        debug!(error = %call_error, "no-op payment completed after error");
        Ok(())
    }
}
