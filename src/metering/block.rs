//! Current block number accessor.
//!
//! Metering stamps reports with the chain's current block number so billing
//! can correlate calls with channel state. The accessor is injected and may
//! be absent; its failures are never surfaced to the call.

use async_trait::async_trait;
use serde_json::json;

use crate::types::{GatewayError, Result};

#[async_trait]
pub trait BlockProvider: Send + Sync {
    async fn current_block(&self) -> Result<u64>;
}

/// Block provider backed by an Ethereum JSON-RPC endpoint.
pub struct HttpBlockProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBlockProvider {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl BlockProvider for HttpBlockProvider {
    async fn current_block(&self) -> Result<u64> {
        let response: serde_json::Value = self
            .client
            .post(&self.endpoint)
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "eth_blockNumber",
                "params": [],
                "id": 1,
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let result = response
            .get("result")
            .and_then(|v| v.as_str())
            .ok_or_else(|| GatewayError::Internal("eth_blockNumber: missing result".to_string()))?;

        parse_block_number(result)
    }
}

fn parse_block_number(hex: &str) -> Result<u64> {
    let digits = hex.strip_prefix("0x").unwrap_or(hex);
    u64::from_str_radix(digits, 16)
        .map_err(|e| GatewayError::Internal(format!("invalid block number \"{}\": {}", hex, e)))
}
