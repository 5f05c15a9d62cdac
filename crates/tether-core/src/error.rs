//! Error types shared by hosts and plugins.

use crate::http::status_text;

/// Errors from plugin lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    /// The plugin was used before `enable` succeeded.
    #[error("plugin is not enabled: {0}")]
    NotEnabled(String),

    /// A call to an out-of-process plugin failed.
    #[error("remote plugin call failed: {0}")]
    Remote(String),

    /// The plugin reported a failure of its own.
    #[error("plugin failed: {0}")]
    Failed(String),
}

/// Result type for plugin lifecycle operations.
pub type PluginResult<T> = Result<T, PluginError>;

/// An error surfaced to the HTTP client of a request.
///
/// `Status` carries the numeric code the handler chose. Every other
/// failure is `Internal` and answers with 500.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// An error with an explicit HTTP status.
    #[error("{}", status_message(*code, message))]
    Status {
        /// HTTP status code.
        code: u16,
        /// Error text; empty means the status reason phrase.
        message: String,
    },

    /// Any error without a status.
    #[error("{0}")]
    Internal(String),
}

fn status_message(code: u16, message: &str) -> String {
    if message.is_empty() {
        status_text(code).to_string()
    } else {
        message.to_string()
    }
}

impl HttpError {
    /// Status error using the reason phrase as its text.
    #[must_use]
    pub fn status(code: u16) -> Self {
        Self::Status {
            code,
            message: String::new(),
        }
    }

    /// Status error with explicit text.
    #[must_use]
    pub fn with_message(code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            code,
            message: message.into(),
        }
    }

    /// Error without a status.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP status to answer with.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Status { code, .. } => *code,
            Self::Internal(_) => 500,
        }
    }
}

/// Errors converting to or from the [`Value`](crate::Value) envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The value has a different type than the one requested.
    #[error("expected {expected}, got {found}")]
    TypeMismatch {
        /// Type the receiver wanted.
        expected: &'static str,
        /// Type tag actually present.
        found: &'static str,
    },

    /// A string could not be read as an RFC 3339 timestamp.
    #[error("invalid timestamp {0:?}")]
    InvalidTime(String),

    /// NaN and infinities have no envelope representation.
    #[error("non-finite number cannot be carried")]
    NonFinite,

    /// A number outside the signed 64-bit and finite float ranges.
    #[error("unsupported number: {0}")]
    UnsupportedNumber(String),
}

/// Errors from calling a named function, locally or through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FuncError {
    /// The caller passed the wrong number of arguments.
    #[error("input parameters expected is {expected}, but passed in {actual}")]
    ArgumentCount {
        /// Declared parameter count.
        expected: usize,
        /// Arguments actually passed.
        actual: usize,
    },

    /// The function declares more than two return values.
    #[error("output parameters expected is max of 2, but passed in {0}")]
    TooManyReturns(usize),

    /// The second return value is present but is not an error.
    #[error("2nd return should be an error")]
    SecondReturnNotError,

    /// An argument could not be converted to the parameter type.
    #[error("argument {position}: {source}")]
    Argument {
        /// 1-based argument position.
        position: usize,
        /// Conversion failure.
        source: EnvelopeError,
    },

    /// A return value has no envelope representation.
    #[error("return value: {0}")]
    Envelope(#[from] EnvelopeError),

    /// No function is registered under the key.
    #[error("function not found: {0}")]
    UnknownKey(String),

    /// The function ran and returned an error, passed through verbatim.
    #[error("{0}")]
    Call(String),

    /// The proxied call could not reach the process holding the function.
    #[error("function proxy unavailable: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_uses_reason_phrase_when_empty() {
        assert_eq!(HttpError::status(404).to_string(), "Not Found");
        assert_eq!(HttpError::with_message(403, "nope").to_string(), "nope");
    }

    #[test]
    fn test_internal_error_answers_500() {
        assert_eq!(HttpError::internal("boom").code(), 500);
        assert_eq!(HttpError::status(418).code(), 418);
    }

    #[test]
    fn test_func_error_messages() {
        let err = FuncError::ArgumentCount {
            expected: 1,
            actual: 2,
        };
        assert_eq!(err.to_string(), "input parameters expected is 1, but passed in 2");
        assert_eq!(
            FuncError::TooManyReturns(3).to_string(),
            "output parameters expected is max of 2, but passed in 3"
        );
    }
}
