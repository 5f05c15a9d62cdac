//! Host configuration.
//!
//! Loaded from TOML:
//!
//! ```toml
//! request_grace_secs = 30
//! handshake_timeout_secs = 10
//! call_timeout_secs = 60
//!
//! [supervisor]
//! interval_ms = 2000
//! restart = "automatic"
//!
//! [[plugins]]
//! name = "hello"
//! path = "./target/debug/hello-plugin"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_rpc::HandshakeConfig;

use crate::error::{HostError, HostResult};

/// What the supervisor does with a crashed plugin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Reconnect and reload the plugin (default).
    #[default]
    Automatic,
    /// Mark the plugin disabled and leave it down.
    Disable,
}

/// Crash supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Poll interval in milliseconds.
    pub interval_ms: u64,
    /// Crash policy.
    pub restart: RestartPolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_ms: 2000,
            restart: RestartPolicy::Automatic,
        }
    }
}

impl SupervisorConfig {
    /// Poll interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// One out-of-process plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePluginConfig {
    /// Plugin name; must match what the executable dispenses.
    pub name: String,
    /// Executable path.
    pub path: PathBuf,
    /// Extra arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Install the plugin's middleware into the host chain.
    #[serde(default)]
    pub middleware: bool,
}

impl RemotePluginConfig {
    /// Plugin `name` served by the executable at `path`.
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            middleware: false,
        }
    }

    /// Add arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Install the plugin's middleware.
    #[must_use]
    pub fn with_middleware(mut self) -> Self {
        self.middleware = true;
        self
    }
}

/// Everything the host needs to run out-of-process plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// How long a request context outlives its primary call when a nested
    /// call may still need it.
    pub request_grace_secs: u64,
    /// Maximum wait for a plugin's handshake line.
    pub handshake_timeout_secs: u64,
    /// Bound on a forwarded handler call; 0 disables the bound.
    pub call_timeout_secs: u64,
    /// Crash supervision.
    pub supervisor: SupervisorConfig,
    /// Handshake values shared with plugin binaries.
    pub handshake: HandshakeConfig,
    /// Plugins to connect.
    pub plugins: Vec<RemotePluginConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            request_grace_secs: 30,
            handshake_timeout_secs: 10,
            call_timeout_secs: 60,
            supervisor: SupervisorConfig::default(),
            handshake: HandshakeConfig::default(),
            plugins: Vec::new(),
        }
    }
}

impl HostConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Config`] on syntax errors or invalid values.
    pub fn from_toml_str(content: &str) -> HostResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| HostError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::ConfigRead`] if the file cannot be read, or
    /// [`HostError::Config`] if it does not parse or validate.
    pub fn load(path: impl AsRef<Path>) -> HostResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| HostError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Config`] describing the first problem found.
    pub fn validate(&self) -> HostResult<()> {
        if self.supervisor.interval_ms == 0 {
            return Err(HostError::Config("supervisor.interval_ms must be positive".into()));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(HostError::Config("handshake_timeout_secs must be positive".into()));
        }
        if self.handshake.magic_cookie_key.is_empty() || self.handshake.magic_cookie_value.is_empty() {
            return Err(HostError::Config("handshake cookie must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() {
                return Err(HostError::Config("plugin name must not be empty".into()));
            }
            if !seen.insert(plugin.name.as_str()) {
                return Err(HostError::Config(format!("duplicate plugin name: {}", plugin.name)));
            }
            if plugin.path.as_os_str().is_empty() {
                return Err(HostError::Config(format!("plugin {} has no path", plugin.name)));
            }
        }
        Ok(())
    }

    /// Grace window of delayed context deletion.
    #[must_use]
    pub fn request_grace(&self) -> Duration {
        Duration::from_secs(self.request_grace_secs)
    }

    /// Handshake timeout.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Forwarded call bound, if any.
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    /// Add a plugin.
    #[must_use]
    pub fn with_plugin(mut self, plugin: RemotePluginConfig) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Set the restart policy.
    #[must_use]
    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.supervisor.restart = restart;
        self
    }

    /// Set the supervisor poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.supervisor.interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the delayed deletion grace window.
    #[must_use]
    pub fn with_request_grace(mut self, grace: Duration) -> Self {
        self.request_grace_secs = grace.as_secs();
        self
    }

    /// Set the forwarded call bound in seconds; 0 disables it.
    #[must_use]
    pub fn with_call_timeout_secs(mut self, secs: u64) -> Self {
        self.call_timeout_secs = secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::from_toml_str("").unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.request_grace(), Duration::from_secs(30));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.supervisor.restart, RestartPolicy::Automatic);
        assert_eq!(config.handshake.protocol_version, 1);
    }

    #[test]
    fn test_full_document() {
        let config = HostConfig::from_toml_str(
            r#"
            request_grace_secs = 5
            call_timeout_secs = 0

            [supervisor]
            interval_ms = 250
            restart = "disable"

            [[plugins]]
            name = "hello"
            path = "/opt/plugins/hello"
            args = ["--quiet"]
            middleware = true
            [plugins.env]
            HELLO_GREETING = "hi"
            "#,
        )
        .unwrap();

        assert_eq!(config.request_grace_secs, 5);
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.supervisor.interval(), Duration::from_millis(250));
        assert_eq!(config.supervisor.restart, RestartPolicy::Disable);
        let hello = &config.plugins[0];
        assert_eq!(hello.args, vec!["--quiet"]);
        assert!(hello.middleware);
        assert_eq!(hello.env["HELLO_GREETING"], "hi");
    }

    #[test]
    fn test_validation_failures() {
        let dup = r#"
            [[plugins]]
            name = "a"
            path = "/bin/a"
            [[plugins]]
            name = "a"
            path = "/bin/b"
        "#;
        assert!(matches!(
            HostConfig::from_toml_str(dup),
            Err(HostError::Config(msg)) if msg.contains("duplicate")
        ));
        assert!(HostConfig::from_toml_str("[supervisor]\ninterval_ms = 0").is_err());
        assert!(HostConfig::from_toml_str("restart = 7 = 8").is_err());
        assert!(HostConfig::from_toml_str("[supervisor]\nrestart = \"sometimes\"").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(&path, "handshake_timeout_secs = 3\n").unwrap();
        assert_eq!(HostConfig::load(&path).unwrap().handshake_timeout_secs, 3);

        let missing = HostConfig::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, HostError::ConfigRead { .. }));
    }
}
