//! Configuration for tollgate.
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;

use crate::types::{GatewayError, Result};

/// Tollgate - payment-gated RPC gateway for AI services
#[derive(Parser, Debug, Clone)]
#[command(name = "tollgate")]
#[command(about = "Payment-gated RPC gateway - every call pays its way through the gate")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:7000")]
    pub listen: SocketAddr,

    /// Relay calls to the backend service (disable for loopback echo mode)
    #[arg(long, env = "PASSTHROUGH_ENABLED", default_value = "true")]
    pub passthrough_enabled: bool,

    /// Backend service WebSocket URL
    #[arg(long, env = "SERVICE_ENDPOINT", default_value = "ws://localhost:7003")]
    pub service_endpoint: String,

    /// Separate endpoint for model-management calls (optional)
    #[arg(long, env = "TRAINING_ENDPOINT")]
    pub training_endpoint: Option<String>,

    /// Full method names routed to the training endpoint, comma-separated
    #[arg(long, env = "SPECIAL_METHODS", value_delimiter = ',')]
    pub special_methods: Vec<String>,

    /// Organization identifier stamped on call reports
    #[arg(long, env = "ORGANIZATION_ID", default_value = "")]
    pub organization_id: String,

    /// Service identifier stamped on call reports
    #[arg(long, env = "SERVICE_ID", default_value = "")]
    pub service_id: String,

    /// Group identifier stamped on call reports
    #[arg(long, env = "GROUP_ID", default_value = "")]
    pub group_id: String,

    /// Allowed calls per minute; empty or 0 disables rate limiting
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value = "")]
    pub rate_limit_per_minute: String,

    /// Token bucket burst size; 0 means the maximum possible burst
    #[arg(long, env = "BURST_SIZE", default_value = "0")]
    pub burst_size: u32,

    /// Monitoring service endpoint for call reports (optional)
    #[arg(long, env = "MONITORING_ENDPOINT")]
    pub monitoring_endpoint: Option<String>,

    /// Ethereum JSON-RPC endpoint for block number lookups (optional)
    #[arg(long, env = "ETHEREUM_RPC_ENDPOINT")]
    pub ethereum_rpc_endpoint: Option<String>,

    /// Drop the first explicit response-header send of every call
    /// (price negotiation mode)
    #[arg(long, env = "SUPPRESS_FIRST_HEADER", default_value = "false")]
    pub suppress_first_header: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.passthrough_enabled {
            validate_ws_url("service_endpoint", &self.service_endpoint)?;
        }
        if let Some(endpoint) = &self.training_endpoint {
            validate_ws_url("training_endpoint", endpoint)?;
        }
        if !self.rate_limit_per_minute.is_empty()
            && self.rate_limit_per_minute.parse::<f64>().is_err()
        {
            return Err(GatewayError::Config(format!(
                "rate_limit_per_minute is not a number: \"{}\"",
                self.rate_limit_per_minute
            )));
        }
        Ok(())
    }
}

fn validate_ws_url(field: &str, url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(GatewayError::Config(format!(
            "{} must be a ws:// or wss:// URL, got \"{}\"",
            field, url
        )))
    }
}
