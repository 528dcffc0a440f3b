//! Control-frame codec.
//!
//! Data frames travel as Binary WebSocket messages; everything else is a Text
//! message holding one JSON control frame:
//! - `{"kind":"header","metadata":{...}}`: response header metadata
//! - `{"kind":"eos"}`: sender half-close
//! - `{"kind":"status","code":"...","message":"...","metadata":{...}}`: final
//!   call status plus trailer metadata

use serde::{Deserialize, Serialize};

use crate::types::{Metadata, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ControlFrame {
    Header {
        metadata: Metadata,
    },
    Eos,
    Status {
        #[serde(flatten)]
        status: Status,
        #[serde(default, skip_serializing_if = "Metadata::is_empty")]
        metadata: Metadata,
    },
}

impl ControlFrame {
    pub fn status(status: Status, trailer: Metadata) -> Self {
        Self::Status {
            status,
            metadata: trailer,
        }
    }
}

/// Encode a control frame as the Text payload of a WebSocket message.
pub fn encode(frame: &ControlFrame) -> String {
    // ControlFrame serialization cannot fail: all fields are plain maps and
    // strings.
    serde_json::to_string(frame).unwrap_or_default()
}

/// Parse the Text payload of a WebSocket message into a control frame.
pub fn parse(text: &str) -> Result<ControlFrame, Status> {
    serde_json::from_str(text)
        .map_err(|e| Status::internal(format!("malformed control frame: {}", e)))
}
