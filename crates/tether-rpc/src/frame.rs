//! Wire framing.
//!
//! Protocol: 4-byte big-endian length prefix, then a JSON-encoded [`Frame`].

use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::{RpcError, RpcResult};

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One message on a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// A call addressed to a channel served by the receiver.
    Request {
        /// Sender-chosen call id, echoed in the response.
        id: u64,
        /// Receiver-side channel.
        channel: u32,
        /// Method name.
        method: String,
        /// Method parameters.
        #[serde(default)]
        params: serde_json::Value,
    },
    /// The answer to a request.
    Response {
        /// Id of the request being answered.
        id: u64,
        /// Return value on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        /// Failure, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
}

impl Frame {
    /// Build the response frame for a call outcome.
    #[must_use]
    pub fn response(id: u64, outcome: RpcResult<serde_json::Value>) -> Self {
        match outcome {
            Ok(value) => Self::Response {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Self::Response {
                id,
                result: None,
                error: Some(e),
            },
        }
    }

    /// Serialize to a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error if the frame cannot be serialized or exceeds
    /// [`MAX_FRAME_LEN`].
    pub fn encode(&self) -> RpcResult<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(RpcError::new(
                crate::ErrorCode::Codec,
                format!("frame of {} bytes exceeds limit", bytes.len()),
            ));
        }
        Ok(bytes)
    }

    /// Parse a frame payload.
    ///
    /// # Errors
    ///
    /// Returns a codec error on malformed JSON.
    pub fn decode(bytes: &[u8]) -> RpcResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Codec shared by both directions of a connection.
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::Request {
            id: 7,
            channel: 2,
            method: "handler.handle".into(),
            params: serde_json::json!({"path": "/"}),
        };
        let json: serde_json::Value = serde_json::from_slice(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "request");
        assert_eq!(json["channel"], 2);
    }

    #[test]
    fn test_null_result_decodes() {
        let frame = Frame::decode(br#"{"kind": "response", "id": 1, "result": null}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response {
                id: 1,
                result: None,
                error: None
            }
        );
    }

    #[test]
    fn test_garbage_is_codec_error() {
        let err = Frame::decode(b"not json").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::Codec);
    }
}
