//! Host error types.

use std::path::PathBuf;

use tether_rpc::{HandshakeError, RpcError};

/// Errors from host operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The config file could not be read.
    #[error("failed to read config {path}: {source}")]
    ConfigRead {
        /// Config path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config is invalid.
    #[error("invalid config: {0}")]
    Config(String),

    /// A plugin process could not be connected.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A plugin lifecycle call failed.
    #[error(transparent)]
    Plugin(#[from] tether_core::PluginError),

    /// No plugin with this name is configured or connected.
    #[error("plugin not found: {0}")]
    PluginNotFound(String),
}

/// Result type for host operations.
pub type HostResult<T> = Result<T, HostError>;

/// Why a plugin process could not be connected.
///
/// Every variant leaves the plugin unloaded; the host keeps running.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The executable could not be started.
    #[error("failed to spawn plugin {name}: {source}")]
    Spawn {
        /// Plugin name.
        name: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The plugin's handshake line was rejected.
    #[error("handshake with plugin {name} failed: {reason}")]
    Handshake {
        /// Plugin name.
        name: String,
        /// Rejection reason.
        reason: HandshakeError,
    },

    /// The process closed stdout before completing the handshake.
    #[error("plugin {name} exited before completing the handshake")]
    ExitedEarly {
        /// Plugin name.
        name: String,
    },

    /// No handshake line arrived in time.
    #[error("plugin {name} did not complete the handshake in time")]
    Timeout {
        /// Plugin name.
        name: String,
    },

    /// The plugin refused to dispense its lifecycle service.
    #[error("plugin {name} could not dispense its service: {source}")]
    Dispense {
        /// Plugin name.
        name: String,
        /// Remote failure.
        source: RpcError,
    },
}

impl ConnectError {
    /// Name of the plugin that failed to connect.
    #[must_use]
    pub fn plugin(&self) -> &str {
        match self {
            Self::Spawn { name, .. }
            | Self::Handshake { name, .. }
            | Self::ExitedEarly { name }
            | Self::Timeout { name }
            | Self::Dispense { name, .. } => name,
        }
    }
}

/// Result type for connection attempts.
pub type ConnectResult<T> = Result<T, ConnectError>;
