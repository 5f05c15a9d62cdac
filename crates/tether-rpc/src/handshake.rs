//! Connection handshake.
//!
//! The host passes a magic cookie and the application protocol versions it
//! speaks through the child's environment. The plugin checks the cookie,
//! picks a version, and announces itself with a single text line on stdout
//! before switching that stream to frames:
//!
//! ```text
//! 1|1|stdio
//! ```
//!
//! The fields are the core protocol version, the application protocol
//! version and the transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Version of the framing and broker protocol in this crate.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Environment variable listing the application versions the host accepts.
pub const PROTOCOL_VERSIONS_ENV: &str = "TETHER_PLUGIN_PROTOCOL_VERSIONS";

/// The only transport in use.
pub const TRANSPORT_STDIO: &str = "stdio";

/// Shared secret and version both sides must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Application protocol version.
    pub protocol_version: u32,
    /// Environment variable carrying the cookie.
    pub magic_cookie_key: String,
    /// Expected cookie value.
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            magic_cookie_key: "TETHER_PLUGIN".to_string(),
            magic_cookie_value: "a4c6f1e0b7d94f2a9f3c5e8d1b6a7c20".to_string(),
        }
    }
}

/// Why a handshake failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// The cookie was missing or wrong, which usually means the binary was
    /// started by hand.
    #[error(
        "this binary is a plugin and is not meant to be executed directly; \
         run the program that consumes it instead ({key} is not set correctly)"
    )]
    CookieMismatch {
        /// Cookie variable name.
        key: String,
    },
    /// None of the host's versions match.
    #[error("no supported protocol version: host offers [{offered}], plugin speaks {supported}")]
    UnsupportedVersion {
        /// Versions offered by the host.
        offered: String,
        /// Version the plugin speaks.
        supported: u32,
    },
    /// The announcement line does not parse.
    #[error("malformed handshake line: {0:?}")]
    Malformed(String),
    /// The plugin uses another core protocol.
    #[error("incompatible core protocol version {0}, expected {CORE_PROTOCOL_VERSION}")]
    CoreVersion(u32),
    /// The plugin chose an application version the host did not offer.
    #[error("plugin chose protocol version {got}, expected {expected}")]
    AppVersion {
        /// Version announced by the plugin.
        got: u32,
        /// Version the host speaks.
        expected: u32,
    },
    /// The plugin asked for a transport the host does not speak.
    #[error("unsupported transport {0:?}")]
    Transport(String),
}

impl HandshakeConfig {
    /// Environment for a plugin process.
    #[must_use]
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            (self.magic_cookie_key.clone(), self.magic_cookie_value.clone()),
            (
                PROTOCOL_VERSIONS_ENV.to_string(),
                self.protocol_version.to_string(),
            ),
        ]
    }

    /// Plugin-side check of the inherited environment.
    ///
    /// `lookup` reads a variable, normally [`std::env::var`]. A missing
    /// version list means the host predates version negotiation and the
    /// plugin's own version is assumed.
    ///
    /// # Errors
    ///
    /// Fails on a cookie mismatch or when no offered version matches.
    pub fn verify_env<F>(&self, lookup: F) -> Result<HandshakeLine, HandshakeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if lookup(&self.magic_cookie_key).as_deref() != Some(self.magic_cookie_value.as_str()) {
            return Err(HandshakeError::CookieMismatch {
                key: self.magic_cookie_key.clone(),
            });
        }

        if let Some(offered) = lookup(PROTOCOL_VERSIONS_ENV) {
            let speaks = offered
                .split(',')
                .filter_map(|v| v.trim().parse::<u32>().ok())
                .any(|v| v == self.protocol_version);
            if !speaks {
                return Err(HandshakeError::UnsupportedVersion {
                    offered,
                    supported: self.protocol_version,
                });
            }
        }

        Ok(HandshakeLine::new(self.protocol_version))
    }

    /// Host-side check of the plugin's announcement.
    ///
    /// # Errors
    ///
    /// Fails when the line is malformed or names versions or a transport
    /// the host does not speak.
    pub fn verify_line(&self, line: &str) -> Result<HandshakeLine, HandshakeError> {
        let parsed: HandshakeLine = line.parse()?;
        if parsed.core_version != CORE_PROTOCOL_VERSION {
            return Err(HandshakeError::CoreVersion(parsed.core_version));
        }
        if parsed.app_version != self.protocol_version {
            return Err(HandshakeError::AppVersion {
                got: parsed.app_version,
                expected: self.protocol_version,
            });
        }
        if parsed.transport != TRANSPORT_STDIO {
            return Err(HandshakeError::Transport(parsed.transport));
        }
        Ok(parsed)
    }
}

/// The plugin's announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    /// Core protocol version.
    pub core_version: u32,
    /// Negotiated application version.
    pub app_version: u32,
    /// Transport name.
    pub transport: String,
}

impl HandshakeLine {
    /// Announcement for the current core protocol over stdio.
    #[must_use]
    pub fn new(app_version: u32) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            transport: TRANSPORT_STDIO.to_string(),
        }
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.core_version, self.app_version, self.transport)
    }
}

impl FromStr for HandshakeLine {
    type Err = HandshakeError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let malformed = || HandshakeError::Malformed(line.to_string());
        let mut parts = line.trim().split('|');
        let (Some(core), Some(app), Some(transport), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };
        Ok(Self {
            core_version: core.parse().map_err(|_| malformed())?,
            app_version: app.parse().map_err(|_| malformed())?,
            transport: transport.to_string(),
        })
    }
}
