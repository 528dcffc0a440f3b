//! Call metadata: a case-insensitive string multimap.
//!
//! Metadata arrives as the HTTP headers of the call's upgrade request and is
//! the carrier for every payment-related key. Header key strings are part of
//! the wire contract and must be preserved byte-for-byte.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::types::Status;

/// Payment type used to pay for an RPC call, e.g. "escrow" or "free-call".
/// Selects the payment handler; absent or empty means the default handler.
pub const PAYMENT_TYPE_HEADER: &str = "snet-payment-type";
/// Sender address asserted by the gateway after payment validation.
/// Injected, never trusted from the client.
pub const USER_ADDRESS_HEADER: &str = "snet-user-address";
/// Client that calls the gateway (e.g. "snet-cli", "snet-dapp", "snet-sdk")
pub const CLIENT_TYPE_HEADER: &str = "snet-client-type";
/// Value is a user address, e.g. "0x94d04332C4f5273feF69c4a52D24f42a3aF1F207"
pub const USER_INFO_HEADER: &str = "snet-user-info";
/// User agent details set on the call
pub const USER_AGENT_HEADER: &str = "user-agent";
/// Escrow payment channel id. Value is a string containing a decimal number.
pub const PAYMENT_CHANNEL_ID_HEADER: &str = "snet-payment-channel-id";
/// The user id of the person making a free call
pub const FREE_CALL_USER_ID_HEADER: &str = "snet-free-call-user-id";
/// Used to check whether a client signature is still valid
pub const CURRENT_BLOCK_NUMBER_HEADER: &str = "snet-current-block-number";

/// Case-insensitive multimap of call metadata.
///
/// Keys are lowercased on insert; a key may carry zero, one or many values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata {
    entries: BTreeMap<String, Vec<String>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Replace all values for a key.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Add one more value for a key.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    /// All values for a key; empty slice when the key is absent.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// First value for a key, if any.
    pub fn get_first(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    /// The exactly-one value for a key.
    ///
    /// Zero or more than one value is a client error, not a server fault.
    pub fn get_single(&self, key: &str) -> Result<&str, Status> {
        let values = self.get_all(key);
        match values {
            [] => Err(Status::invalid_argument(format!("missing \"{}\"", key))),
            [value] => Ok(value),
            _ => Err(Status::invalid_argument(format!(
                "too many values for key \"{}\": {:?}",
                key, values
            ))),
        }
    }

    /// Single value parsed as a decimal number.
    pub fn get_u64(&self, key: &str) -> Result<u64, Status> {
        let value = self.get_single(key)?;
        value.parse::<u64>().map_err(|_| {
            Status::invalid_argument(format!("incorrect format \"{}\": \"{}\"", key, value))
        })
    }

    /// Binary value for a key with the `-bin` suffix, base64-encoded on the wire.
    pub fn get_binary(&self, key: &str) -> Result<Vec<u8>, Status> {
        if !key.ends_with("-bin") {
            return Err(Status::invalid_argument(format!(
                "incorrect binary key name \"{}\"",
                key
            )));
        }
        let value = self.get_single(key)?;
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(|_| {
                Status::invalid_argument(format!("incorrect format \"{}\": \"{}\"", key, value))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Extract metadata from the HTTP headers of an upgrade request.
    ///
    /// Values that are not valid UTF-8 are skipped; the wire contract only
    /// covers string metadata.
    pub fn from_header_map(headers: &hyper::HeaderMap) -> Self {
        let mut metadata = Self::new();
        for (name, value) in headers.iter() {
            if let Ok(v) = value.to_str() {
                metadata.append(name.as_str(), v);
            }
        }
        metadata
    }
}
