//! Test harness helpers.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tether_core::Plugin;
use tether_host::{AdapterOptions, RemotePlugin, RemotePluginConfig, RequestCorrelator};
use tether_rpc::proto::{self, DispenseRequest, DispenseResponse};
use tether_rpc::{Connection, ROOT_CHANNEL};
use tracing_subscriber::EnvFilter;

/// Capacity of each direction of an in-process pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Set up test logging with the given filter.
///
/// Safe to call from every test; only the first call installs a
/// subscriber.
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// Set up test logging at warn level.
pub fn setup_test_logging_default() {
    setup_test_logging("warn");
}

/// A plugin served on one end of an in-memory pipe and adapted on the
/// other, with no child process involved.
#[derive(Debug)]
pub struct InProcessPlugin {
    /// Host-side adapter.
    pub remote: Arc<RemotePlugin>,
    /// Correlator shared with the adapter.
    pub correlator: RequestCorrelator,
    /// Host end of the pipe.
    pub host: Connection,
    /// Plugin end of the pipe.
    pub plugin: Connection,
}

impl InProcessPlugin {
    /// Serve `plugin` over a duplex pipe, dispense it by name and wrap it
    /// in a [`RemotePlugin`].
    ///
    /// # Errors
    ///
    /// Fails if the plugin cannot be served or dispensed.
    pub async fn connect(plugin: Arc<dyn Plugin>, options: AdapterOptions) -> anyhow::Result<Self> {
        let name = plugin.name().to_string();
        let (host_io, plugin_io) = tokio::io::duplex(PIPE_CAPACITY);

        let (reader, writer) = tokio::io::split(plugin_io);
        let plugin_side = tether_sdk::serve_connection("host", reader, writer, vec![plugin])?;

        let (reader, writer) = tokio::io::split(host_io);
        let host_side = Connection::new(name.clone(), reader, writer);
        let dispensed: DispenseResponse = host_side
            .broker()
            .dial(ROOT_CHANNEL)
            .call(proto::DISPENSE, &DispenseRequest { name: name.clone() })
            .await?;
        let lifecycle = host_side.broker().dial(dispensed.channel);

        let correlator = RequestCorrelator::default();
        let remote = Arc::new(RemotePlugin::from_connection(
            name,
            host_side.clone(),
            lifecycle,
            correlator.clone(),
            options,
        ));
        Ok(Self {
            remote,
            correlator,
            host: host_side,
            plugin: plugin_side,
        })
    }

    /// Close both ends.
    pub fn close(&self) {
        self.host.close();
        self.plugin.close();
    }
}

/// Config for the `hello-plugin` binary at `path`.
#[must_use]
pub fn hello_plugin_config(path: impl AsRef<Path>) -> RemotePluginConfig {
    RemotePluginConfig::new(crate::HELLO_PLUGIN, path.as_ref())
}

/// Write a host config to a temporary `.toml` file.
///
/// # Panics
///
/// Panics if the file cannot be created or written.
#[must_use]
pub fn test_config_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write to temp file");
    file.flush().expect("Failed to flush temp file");
    file
}
