//! Errors carried over the wire.

use serde::{Deserialize, Serialize};
use tether_core::{HttpError, PluginError};

/// Classification of an RPC failure.
///
/// Codes this build does not know decode as [`ErrorCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The service does not implement the method.
    MethodNotFound,
    /// Nothing is served on the addressed channel.
    NoService,
    /// The parameters did not decode.
    InvalidParams,
    /// A message could not be encoded or decoded.
    Codec,
    /// The connection is closed.
    Closed,
    /// The failure carries an HTTP status.
    Status,
    /// Unclassified failure.
    #[serde(other)]
    Unknown,
}

/// A failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RpcError {
    /// Failure class.
    pub code: ErrorCode,
    /// Human-readable text.
    pub message: String,
    /// HTTP status, when the remote failure carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

/// Result type for RPC calls.
pub type RpcResult<T> = Result<T, RpcError>;

impl RpcError {
    /// Create an error without a status.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            status: None,
        }
    }

    /// The peer went away.
    #[must_use]
    pub fn closed() -> Self {
        Self::new(ErrorCode::Closed, "connection closed")
    }

    /// Unknown method.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("method not found: {method}"))
    }

    /// Unserved channel.
    #[must_use]
    pub fn no_service(channel: u32) -> Self {
        Self::new(ErrorCode::NoService, format!("no service on channel {channel}"))
    }

    /// Undecodable parameters.
    #[must_use]
    pub fn invalid_params(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidParams, format!("invalid params: {err}"))
    }

    /// Whether the failure was the connection closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.code == ErrorCode::Closed
    }

    /// Convert to an HTTP error. Only errors that carried a status keep it.
    #[must_use]
    pub fn into_http(self) -> HttpError {
        match self.status {
            Some(code) => HttpError::with_message(code, self.message),
            None => HttpError::Internal(self.message),
        }
    }
}

impl From<HttpError> for RpcError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Status { code, .. } => Self {
                code: ErrorCode::Status,
                message: err.to_string(),
                status: Some(code),
            },
            HttpError::Internal(message) => Self::new(ErrorCode::Unknown, message),
        }
    }
}

impl From<PluginError> for RpcError {
    fn from(err: PluginError) -> Self {
        Self::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<RpcError> for PluginError {
    fn from(err: RpcError) -> Self {
        PluginError::Remote(err.message)
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Codec, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_survives_round_trip() {
        let wire = serde_json::to_string(&RpcError::from(HttpError::status(403))).unwrap();
        let back: RpcError = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.into_http(), HttpError::with_message(403, "Forbidden"));
    }

    #[test]
    fn test_unknown_code_becomes_plain_error() {
        let back: RpcError =
            serde_json::from_str(r#"{"code": "quota_exceeded", "message": "slow down"}"#).unwrap();
        assert_eq!(back.code, ErrorCode::Unknown);
        assert_eq!(back.into_http(), HttpError::Internal("slow down".into()));
    }
}
