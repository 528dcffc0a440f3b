//! Tollgate - payment-gated RPC gateway for AI services
//!
//! Tollgate sits in front of a backend AI service and mediates every call
//! through an admission/payment pipeline before relaying it:
//!
//! - **Admission**: token-bucket rate limiting plus a global pause flag
//! - **Metering**: per-call stats published asynchronously
//! - **Payment validation**: pluggable strategies selected per call, settled
//!   exactly once on success, error and panic
//! - **Relay**: bidirectional frame proxying to passthrough backends

pub mod admission;
pub mod backend;
pub mod config;
pub mod control;
pub mod metering;
pub mod payment;
pub mod relay;
pub mod server;
pub mod stream;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{GatewayError, Result, Status, StatusCode};
