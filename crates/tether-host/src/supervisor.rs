//! Crash supervision of plugin processes.
//!
//! [`Supervisor::connect_all`] brings every configured plugin up and hands
//! the adapters to the [`PluginHost`]. [`Supervisor::monitor`] starts the
//! single polling task; each cycle looks for tracked processes that died
//! and applies the [`RestartPolicy`]. A crashed plugin always ends a cycle
//! either reconnected or disabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use tether_core::{Plugin, PluginResult};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterOptions, RemotePlugin};
use crate::config::{HostConfig, RemotePluginConfig, RestartPolicy, SupervisorConfig};
use crate::connector::ProcessConnector;
use crate::correlator::RequestCorrelator;
use crate::error::{HostError, HostResult};

/// The plugin registry the supervisor loads plugins into.
///
/// Implemented by the application; the supervisor never touches its routing
/// table or page store directly.
#[async_trait]
pub trait PluginHost: Send + Sync {
    /// Register and enable `plugin`, declare its routes and, when
    /// `middleware` is set, install its middleware.
    async fn load_plugin(&self, plugin: Arc<dyn Plugin>, middleware: bool) -> PluginResult<()>;

    /// Mark a plugin enabled or disabled in the registry.
    async fn set_enabled(&self, name: &str, enabled: bool);

    /// Registered plugin by name.
    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>>;

    /// Reload the pages a plugin contributes to the site.
    async fn load_single_plugin_pages(&self, name: &str) -> PluginResult<()>;
}

/// Outcome of handling one crashed plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Reconnected and reloaded.
    Restarted,
    /// Marked disabled; the process stays down.
    Disabled,
}

#[derive(Default)]
struct MonitorState {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

struct Inner {
    connector: ProcessConnector,
    host: Arc<dyn PluginHost>,
    correlator: RequestCorrelator,
    plugins: Vec<RemotePluginConfig>,
    config: SupervisorConfig,
    options: AdapterOptions,
    monitor: Mutex<MonitorState>,
    pollers: Arc<AtomicUsize>,
}

/// Counts a running polling task for as long as it lives.
struct PollerGuard(Arc<AtomicUsize>);

impl PollerGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PollerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Connects configured plugins and keeps them alive.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Supervisor for the plugins in `config`, loading them into `host`.
    #[must_use]
    pub fn new(config: &HostConfig, host: Arc<dyn PluginHost>, options: AdapterOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector: ProcessConnector::new(config.handshake.clone(), config.handshake_timeout()),
                host,
                correlator: RequestCorrelator::new(config.request_grace()),
                plugins: config.plugins.clone(),
                config: config.supervisor.clone(),
                options,
                monitor: Mutex::new(MonitorState::default()),
                pollers: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Process table.
    #[must_use]
    pub fn connector(&self) -> &ProcessConnector {
        &self.inner.connector
    }

    /// Request registry shared by every remote plugin.
    #[must_use]
    pub fn correlator(&self) -> &RequestCorrelator {
        &self.inner.correlator
    }

    /// Connect and load every configured plugin.
    ///
    /// Failures are logged per plugin and do not stop the rest. Returns
    /// how many plugins were loaded.
    pub async fn connect_all(&self) -> usize {
        let mut loaded: usize = 0;
        for plugin in &self.inner.plugins {
            match self.connect(&plugin.name).await {
                Ok(()) => loaded = loaded.saturating_add(1),
                Err(e) => error!(plugin = %plugin.name, error = %e, "Failed to load remote plugin"),
            }
        }
        info!(loaded, configured = self.inner.plugins.len(), "Remote plugins connected");
        loaded
    }

    /// Connect and load one configured plugin.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::PluginNotFound`] if `name` is not configured,
    /// or the connect or load failure. A plugin that fails to load is
    /// disconnected again.
    pub async fn connect(&self, name: &str) -> HostResult<()> {
        let config = self.config_of(name)?;
        let _guard = self.inner.connector.lock(name).await;
        self.load_locked(config).await
    }

    fn config_of(&self, name: &str) -> HostResult<&RemotePluginConfig> {
        self.inner
            .plugins
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| HostError::PluginNotFound(name.to_string()))
    }

    async fn load_locked(&self, config: &RemotePluginConfig) -> HostResult<()> {
        let inner = &self.inner;
        let handle = inner.connector.connect_locked(config).await?;
        let adapter = RemotePlugin::new(&handle, inner.correlator.clone(), inner.options.clone());
        if let Err(e) = inner.host.load_plugin(Arc::new(adapter), config.middleware).await {
            inner.connector.disconnect_locked(&config.name).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Start the polling task. Returns `false` if it was already running.
    pub fn monitor(&self) -> bool {
        let mut state = self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner);
        if state.task.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("Supervisor already monitoring");
            return false;
        }

        let cancel = CancellationToken::new();
        let poller = PollerGuard::enter(Arc::clone(&self.inner.pollers));
        let weak = Arc::downgrade(&self.inner);
        state.task = Some(tokio::spawn(poll_loop(
            weak,
            self.inner.config.interval(),
            cancel.clone(),
            poller,
        )));
        state.cancel = Some(cancel);
        info!(interval_ms = self.inner.config.interval_ms, "Supervisor monitoring started");
        true
    }

    /// Whether the polling task is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Number of polling tasks alive right now. Never above one.
    #[must_use]
    pub fn active_pollers(&self) -> usize {
        self.inner.pollers.load(Ordering::Acquire)
    }

    /// Stop the polling task and wait for it to exit.
    pub async fn stop_monitor(&self) {
        let (task, cancel) = {
            let mut state = self.inner.monitor.lock().unwrap_or_else(PoisonError::into_inner);
            (state.task.take(), state.cancel.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor poll task ended abnormally");
            }
            info!("Supervisor monitoring stopped");
        }
    }

    /// Run one polling cycle now.
    ///
    /// Returns what happened to each plugin found dead.
    pub async fn poll_once(&self) -> Vec<(String, Recovery)> {
        let mut recovered = Vec::new();
        for config in &self.inner.plugins {
            let crashed = self
                .inner
                .connector
                .handle(&config.name)
                .is_some_and(|handle| !handle.is_alive());
            if !crashed {
                continue;
            }
            if let Some(outcome) = self.recover(config).await {
                recovered.push((config.name.clone(), outcome));
            }
        }
        recovered
    }

    async fn recover(&self, config: &RemotePluginConfig) -> Option<Recovery> {
        let inner = &self.inner;
        let name = config.name.as_str();
        let _guard = inner.connector.lock(name).await;

        // Another path may have handled it while we waited for the lock.
        let pid = match inner.connector.handle(name) {
            Some(handle) if !handle.is_alive() => handle.pid(),
            _ => return None,
        };
        warn!(plugin = %name, ?pid, "Plugin process crashed");
        inner.connector.disconnect_locked(name).await;

        match inner.config.restart {
            RestartPolicy::Automatic => {
                if let Some(stale) = inner.host.plugin(name)
                    && let Err(e) = stale.disable().await
                {
                    debug!(plugin = %name, error = %e, "Disabling crashed adapter failed");
                }
                match self.reload_locked(config).await {
                    Ok(()) => {
                        info!(plugin = %name, "Plugin restarted after crash");
                        Some(Recovery::Restarted)
                    },
                    Err(e) => {
                        warn!(plugin = %name, error = %e, "Restart failed; disabling plugin");
                        self.disable_plugin(name).await;
                        Some(Recovery::Disabled)
                    },
                }
            },
            RestartPolicy::Disable => {
                self.disable_plugin(name).await;
                info!(plugin = %name, "Crashed plugin disabled by policy");
                Some(Recovery::Disabled)
            },
        }
    }

    async fn reload_locked(&self, config: &RemotePluginConfig) -> HostResult<()> {
        self.load_locked(config).await?;
        if let Err(e) = self.inner.host.load_single_plugin_pages(&config.name).await {
            warn!(plugin = %config.name, error = %e, "Failed to reload plugin pages");
        }
        Ok(())
    }

    async fn disable_plugin(&self, name: &str) {
        self.inner.host.set_enabled(name, false).await;
        if let Some(plugin) = self.inner.host.plugin(name)
            && let Err(e) = plugin.disable().await
        {
            warn!(plugin = %name, error = %e, "Disable hook failed");
        }
    }

    /// Stop monitoring and kill every plugin process. Used at shutdown.
    pub async fn disconnect(&self) {
        self.stop_monitor().await;
        self.inner.connector.disconnect_all().await;
        info!("All remote plugins disconnected");
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.inner.config)
            .field("connector", &self.inner.connector)
            .field("monitoring", &self.is_monitoring())
            .finish_non_exhaustive()
    }
}

async fn poll_loop(inner: Weak<Inner>, period: std::time::Duration, cancel: CancellationToken, _poller: PollerGuard) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {},
        }
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let supervisor = Supervisor { inner };
        for (plugin, outcome) in supervisor.poll_once().await {
            debug!(plugin = %plugin, ?outcome, "Supervisor cycle handled crash");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct NoPlugins;

    #[async_trait]
    impl PluginHost for NoPlugins {
        async fn load_plugin(&self, _plugin: Arc<dyn Plugin>, _middleware: bool) -> PluginResult<()> {
            Ok(())
        }

        async fn set_enabled(&self, _name: &str, _enabled: bool) {}

        fn plugin(&self, _name: &str) -> Option<Arc<dyn Plugin>> {
            None
        }

        async fn load_single_plugin_pages(&self, _name: &str) -> PluginResult<()> {
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        let config = HostConfig::default().with_poll_interval(Duration::from_millis(10));
        Supervisor::new(&config, Arc::new(NoPlugins), AdapterOptions::default())
    }

    #[tokio::test]
    async fn test_monitor_is_singleton() {
        let supervisor = supervisor();
        let (a, b) = tokio::join!(async { supervisor.monitor() }, async { supervisor.monitor() });
        assert!(a ^ b);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(supervisor.active_pollers(), 1);
        assert!(supervisor.is_monitoring());

        supervisor.disconnect().await;
        assert_eq!(supervisor.active_pollers(), 0);
        assert!(!supervisor.is_monitoring());
    }

    #[tokio::test]
    async fn test_monitor_restarts_after_stop() {
        let supervisor = supervisor();
        assert!(supervisor.monitor());
        assert!(!supervisor.monitor());
        supervisor.stop_monitor().await;
        assert!(supervisor.monitor());
        supervisor.stop_monitor().await;
    }

    #[tokio::test]
    async fn test_unknown_plugin_is_not_found() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.connect("ghost").await,
            Err(HostError::PluginNotFound(name)) if name == "ghost"
        ));
        assert!(supervisor.poll_once().await.is_empty());
        assert_eq!(supervisor.connect_all().await, 0);
    }
}
