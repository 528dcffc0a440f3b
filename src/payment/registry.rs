//! Payment handler registry and per-call dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::payment::PaymentHandler;
use crate::stream::CallContext;
use crate::types::metadata::PAYMENT_TYPE_HEADER;
use crate::types::Status;

/// Holds the default payment strategy plus a map of named strategies.
///
/// Built once at startup; read-only for the lifetime of the process.
pub struct PaymentHandlerRegistry {
    default_handler: Arc<dyn PaymentHandler>,
    handlers: HashMap<&'static str, Arc<dyn PaymentHandler>>,
}

impl PaymentHandlerRegistry {
    pub fn new(
        default_handler: Arc<dyn PaymentHandler>,
        additional: Vec<Arc<dyn PaymentHandler>>,
    ) -> Self {
        let mut handlers: HashMap<&'static str, Arc<dyn PaymentHandler>> = HashMap::new();
        handlers.insert(default_handler.payment_type(), Arc::clone(&default_handler));
        info!(
            default_payment_type = default_handler.payment_type(),
            "default payment handler registered"
        );
        for handler in additional {
            info!(payment_type = handler.payment_type(), "payment handler registered");
            handlers.insert(handler.payment_type(), handler);
        }
        Self {
            default_handler,
            handlers,
        }
    }

    /// Select exactly one handler for a call based on its payment-type header.
    ///
    /// Absent or empty header selects the default handler; an unknown value
    /// is a client error naming the header and the offending value. Selection
    /// is pure: no payment validation happens here.
    pub fn select(&self, context: &CallContext) -> Result<Arc<dyn PaymentHandler>, Status> {
        let payment_type = match context.metadata.get_first(PAYMENT_TYPE_HEADER) {
            None | Some("") => {
                debug!(
                    default_payment_type = self.default_handler.payment_type(),
                    "payment type was not set by caller, using default payment handler"
                );
                return Ok(Arc::clone(&self.default_handler));
            }
            Some(payment_type) => payment_type,
        };

        match self.handlers.get(payment_type) {
            Some(handler) => {
                debug!(payment_type, "payment handler selected by type");
                Ok(Arc::clone(handler))
            }
            None => {
                error!(payment_type, "unexpected payment type");
                Err(Status::invalid_argument(format!(
                    "unexpected \"{}\", value: \"{}\"",
                    PAYMENT_TYPE_HEADER, payment_type
                )))
            }
        }
    }
}
