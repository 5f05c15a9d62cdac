//! SDK error types.

use tether_rpc::HandshakeError;

/// Errors from serving a plugin.
#[derive(Debug, thiserror::Error)]
pub enum SdkError {
    /// The process was not started by a compatible host.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Writing the handshake line failed.
    #[error("plugin stdio failed: {0}")]
    Io(#[from] std::io::Error),

    /// Nothing to serve.
    #[error("no plugins to serve")]
    NoPlugins,

    /// Two plugins share a name.
    #[error("duplicate plugin name: {0}")]
    DuplicatePlugin(String),
}

/// Result type for SDK operations.
pub type SdkResult<T> = Result<T, SdkError>;
