//! Call status model.
//!
//! Every failure raised on the call path is a `Status` with a machine-readable
//! code and a message. The code strings are part of the wire contract: they
//! travel in the final `status` control frame of every call.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable status code, serialized in kebab-case on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatusCode {
    Ok,
    Cancelled,
    InvalidArgument,
    ResourceExhausted,
    FailedPrecondition,
    Unauthenticated,
    Unavailable,
    Internal,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Cancelled => "cancelled",
            Self::InvalidArgument => "invalid-argument",
            Self::ResourceExhausted => "resource-exhausted",
            Self::FailedPrecondition => "failed-precondition",
            Self::Unauthenticated => "unauthenticated",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call outcome: status code plus human-readable message.
///
/// Constructing one is always well-formed; the "no error" case is expressed
/// through `Result<_, Status>` rather than a sentinel value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The happy-path status written to the wire when a call succeeds.
    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Cancelled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// Fold a wire status back into a call result.
    pub fn into_result(self) -> Result<(), Status> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_strings() {
        assert_eq!(StatusCode::InvalidArgument.as_str(), "invalid-argument");
        assert_eq!(StatusCode::ResourceExhausted.as_str(), "resource-exhausted");
        assert_eq!(
            serde_json::to_string(&StatusCode::Unavailable).unwrap(),
            "\"unavailable\""
        );
    }

    #[test]
    fn test_into_result() {
        assert!(Status::ok().into_result().is_ok());
        let err = Status::internal("boom").into_result().unwrap_err();
        assert_eq!(err.code, StatusCode::Internal);
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_status_round_trip() {
        let status = Status::invalid_argument("missing \"snet-payment-type\"");
        let json = serde_json::to_string(&status).unwrap();
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
    }
}
