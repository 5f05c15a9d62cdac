//! Spawning and connecting plugin processes.
//!
//! Connecting a plugin:
//!
//! 1. Spawn the executable with piped stdio and the handshake environment.
//! 2. Relay its stderr into `tracing`, tagged with the plugin name. JSON
//!    log lines keep the level the plugin logged them at.
//! 3. Read and verify the handshake line from stdout.
//! 4. Switch stdin/stdout to frames and dispense the named lifecycle
//!    service from the root channel.
//!
//! Any failure after the spawn kills and reaps the child, so a plugin
//! either ends up fully connected or leaves nothing behind. Operations on
//! one name are serialized through [`ProcessConnector::lock`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::Duration;

use tether_rpc::proto::{self, DispenseRequest, DispenseResponse};
use tether_rpc::{Connection, HandshakeConfig, ROOT_CHANNEL, RpcClient};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{Level, debug, error, info, trace, warn};

use crate::config::RemotePluginConfig;
use crate::error::{ConnectError, ConnectResult};

/// How long [`PluginProcessHandle::kill`] waits for the child to exit.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest handshake line accepted.
const MAX_HANDSHAKE_LINE: usize = 1024;

/// A connected plugin process.
pub struct PluginProcessHandle {
    name: String,
    pid: Option<u32>,
    child: StdMutex<Option<Child>>,
    connection: Connection,
    lifecycle: RpcClient,
}

impl PluginProcessHandle {
    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS process id, if the platform reported one.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The framed connection over the child's stdio.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Client of the dispensed lifecycle service.
    #[must_use]
    pub fn lifecycle(&self) -> &RpcClient {
        &self.lifecycle
    }

    /// Whether the process is running and its connection open.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if self.connection.is_closed() {
            return false;
        }
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Close the connection, kill the process and reap it.
    pub async fn kill(&self) {
        self.connection.close();
        let child = self.child.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(child) = child {
            reap(&self.name, child).await;
        }
    }
}

impl std::fmt::Debug for PluginProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcessHandle")
            .field("name", &self.name)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

async fn reap(name: &str, mut child: Child) {
    if let Err(e) = child.start_kill() {
        debug!(plugin = %name, error = %e, "Kill signal not delivered; process may have exited");
    }
    match tokio::time::timeout(KILL_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(plugin = %name, %status, "Plugin process reaped"),
        Ok(Err(e)) => warn!(plugin = %name, error = %e, "Failed to reap plugin process"),
        Err(_) => warn!(plugin = %name, "Plugin process did not exit after kill"),
    }
}

/// Spawns plugin processes and owns the table of live ones.
pub struct ProcessConnector {
    handshake: HandshakeConfig,
    handshake_timeout: Duration,
    handles: RwLock<HashMap<String, Arc<PluginProcessHandle>>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ProcessConnector {
    /// Connector using `handshake`, waiting at most `handshake_timeout`
    /// for each plugin's announcement.
    #[must_use]
    pub fn new(handshake: HandshakeConfig, handshake_timeout: Duration) -> Self {
        Self {
            handshake,
            handshake_timeout,
            handles: RwLock::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    /// Serialize state changes of plugin `name`.
    ///
    /// Held across connect, disconnect and crash recovery so two paths
    /// never reconnect the same plugin at once.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(name.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Connect a plugin, replacing any process already connected under
    /// its name.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] when spawn, handshake or dispense fail.
    pub async fn connect(&self, config: &RemotePluginConfig) -> ConnectResult<Arc<PluginProcessHandle>> {
        let _guard = self.lock(&config.name).await;
        self.connect_locked(config).await
    }

    /// [`connect`](Self::connect) for callers already holding
    /// [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectError`] when spawn, handshake or dispense fail.
    pub async fn connect_locked(&self, config: &RemotePluginConfig) -> ConnectResult<Arc<PluginProcessHandle>> {
        self.disconnect_locked(&config.name).await;

        let handle = Arc::new(self.spawn(config).await?);
        self.handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.name.clone(), Arc::clone(&handle));
        info!(plugin = %config.name, pid = ?handle.pid, "Plugin process connected");
        Ok(handle)
    }

    async fn spawn(&self, config: &RemotePluginConfig) -> ConnectResult<PluginProcessHandle> {
        let name = config.name.clone();
        let mut cmd = Command::new(&config.path);
        cmd.args(&config.args)
            .envs(&config.env)
            .envs(self.handshake.env())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ConnectError::Spawn {
            name: name.clone(),
            source,
        })?;
        let pid = child.id();
        debug!(plugin = %name, ?pid, path = %config.path.display(), "Spawned plugin process");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_stderr(name.clone(), stderr));
        }

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            reap(&name, child).await;
            return Err(ConnectError::Spawn {
                name,
                source: std::io::Error::other("plugin stdio was not captured"),
            });
        };

        let mut stdout = BufReader::new(stdout);
        let line = match self.read_handshake(&name, &mut stdout).await {
            Ok(line) => line,
            Err(e) => {
                reap(&name, child).await;
                return Err(e);
            },
        };
        if let Err(reason) = self.handshake.verify_line(&line) {
            reap(&name, child).await;
            return Err(ConnectError::Handshake { name, reason });
        }

        let connection = Connection::new(name.clone(), stdout, stdin);
        let root = connection.broker().dial(ROOT_CHANNEL);
        let request = DispenseRequest { name: name.clone() };
        let dispense = root.call::<_, DispenseResponse>(proto::DISPENSE, &request);
        let failure = match tokio::time::timeout(self.handshake_timeout, dispense).await {
            Ok(Ok(dispensed)) => Ok(dispensed),
            Ok(Err(source)) => Err(ConnectError::Dispense {
                name: name.clone(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout { name: name.clone() }),
        };
        let dispensed = match failure {
            Ok(dispensed) => dispensed,
            Err(e) => {
                connection.close();
                reap(&name, child).await;
                return Err(e);
            },
        };
        let lifecycle = connection.broker().dial(dispensed.channel);

        Ok(PluginProcessHandle {
            name,
            pid,
            child: StdMutex::new(Some(child)),
            connection,
            lifecycle,
        })
    }

    async fn read_handshake<R>(&self, name: &str, stdout: &mut R) -> ConnectResult<String>
    where
        R: tokio::io::AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        // Bounded so a chatty binary cannot make the host buffer unlimited
        // output while waiting for the announcement.
        let mut limited = tokio::io::AsyncReadExt::take(stdout, MAX_HANDSHAKE_LINE as u64);
        let outcome = tokio::time::timeout(self.handshake_timeout, limited.read_line(&mut line)).await;
        match outcome {
            Err(_) => Err(ConnectError::Timeout { name: name.to_string() }),
            Ok(Ok(0)) => Err(ConnectError::ExitedEarly { name: name.to_string() }),
            Ok(Ok(_)) => Ok(line.trim_end().to_string()),
            Ok(Err(e)) => {
                debug!(plugin = %name, error = %e, "Reading handshake failed");
                Err(ConnectError::ExitedEarly { name: name.to_string() })
            },
        }
    }

    /// Kill and forget plugin `name`. Returns whether it was connected.
    pub async fn disconnect(&self, name: &str) -> bool {
        let _guard = self.lock(name).await;
        self.disconnect_locked(name).await
    }

    /// [`disconnect`](Self::disconnect) for callers already holding
    /// [`lock`](Self::lock).
    pub async fn disconnect_locked(&self, name: &str) -> bool {
        let handle = self
            .handles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match handle {
            Some(handle) => {
                handle.kill().await;
                info!(plugin = %name, "Plugin process disconnected");
                true
            },
            None => false,
        }
    }

    /// Disconnect every plugin.
    pub async fn disconnect_all(&self) {
        for name in self.names() {
            self.disconnect(&name).await;
        }
    }

    /// Handle of a connected plugin.
    #[must_use]
    pub fn handle(&self, name: &str) -> Option<Arc<PluginProcessHandle>> {
        self.handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of connected plugins, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Whether `name` is connected and alive.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.handle(name).is_some_and(|h| h.is_alive())
    }
}

impl std::fmt::Debug for ProcessConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessConnector")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("plugins", &self.names())
            .finish_non_exhaustive()
    }
}

async fn relay_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {},
            Ok(Some(line)) => relay_line(&name, &parse_plugin_line(&line)),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %name, error = %e, "Stopped relaying plugin stderr");
                break;
            },
        }
    }
}

/// One line of plugin stderr.
#[derive(Debug, PartialEq)]
struct PluginLogLine {
    level: Level,
    message: String,
    target: Option<String>,
    fields: String,
}

/// Decode a JSON log record as written by `tracing-subscriber`, falling
/// back to the raw text at info level for anything else.
fn parse_plugin_line(line: &str) -> PluginLogLine {
    let raw = || PluginLogLine {
        level: Level::INFO,
        message: line.to_string(),
        target: None,
        fields: String::new(),
    };
    let Ok(serde_json::Value::Object(mut record)) = serde_json::from_str(line) else {
        return raw();
    };
    let Some(level) = record
        .get("level")
        .and_then(serde_json::Value::as_str)
        .and_then(|l| l.parse::<Level>().ok())
    else {
        return raw();
    };

    let mut fields = match record.remove("fields") {
        Some(serde_json::Value::Object(fields)) => fields,
        _ => serde_json::Map::new(),
    };
    let message = match fields.remove("message") {
        Some(serde_json::Value::String(message)) => message,
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let fields = fields
        .iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{key}={s}"),
            other => format!("{key}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ");

    PluginLogLine {
        level,
        message,
        target: record
            .get("target")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string),
        fields,
    }
}

fn relay_line(plugin: &str, line: &PluginLogLine) {
    let target = line.target.as_deref().unwrap_or_default();
    let fields = line.fields.as_str();
    let message = line.message.as_str();
    if line.level == Level::ERROR {
        error!(plugin, plugin_target = target, fields, "{message}");
    } else if line.level == Level::WARN {
        warn!(plugin, plugin_target = target, fields, "{message}");
    } else if line.level == Level::INFO {
        info!(plugin, plugin_target = target, fields, "{message}");
    } else if line.level == Level::DEBUG {
        debug!(plugin, plugin_target = target, fields, "{message}");
    } else {
        trace!(plugin, plugin_target = target, fields, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_line_keeps_level_and_message() {
        let line = parse_plugin_line(
            r#"{"timestamp":"2024-01-15T10:30:00Z","level":"ERROR","fields":{"message":"disk full","path":"/tmp","free":0},"target":"hello_plugin"}"#,
        );
        assert_eq!(line.level, Level::ERROR);
        assert_eq!(line.message, "disk full");
        assert_eq!(line.target.as_deref(), Some("hello_plugin"));
        assert_eq!(line.fields, "free=0 path=/tmp");
    }

    #[test]
    fn test_debug_line_stays_debug() {
        let line = parse_plugin_line(r#"{"level":"DEBUG","fields":{"message":"polling"}}"#);
        assert_eq!(line.level, Level::DEBUG);
        assert_eq!(line.message, "polling");
        assert!(line.target.is_none());
        assert!(line.fields.is_empty());
    }

    #[test]
    fn test_plain_text_falls_back_to_info() {
        let line = parse_plugin_line("thread 'main' panicked at src/main.rs:3:5");
        assert_eq!(line.level, Level::INFO);
        assert_eq!(line.message, "thread 'main' panicked at src/main.rs:3:5");

        // JSON that is not a log record is relayed verbatim too.
        let line = parse_plugin_line(r#"{"level":"loud","fields":{"message":"x"}}"#);
        assert_eq!(line.level, Level::INFO);
        assert_eq!(line.message, r#"{"level":"loud","fields":{"message":"x"}}"#);
    }
}
