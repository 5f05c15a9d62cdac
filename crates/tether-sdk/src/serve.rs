//! Serving plugins over the process's stdio.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::Plugin;
use tether_rpc::proto::{self, DispenseRequest, DispenseResponse};
use tether_rpc::{
    Connection, ErrorCode, HandshakeConfig, ROOT_CHANNEL, RpcError, RpcResult, Service, decode, encode,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::error::{SdkError, SdkResult};
use crate::lifecycle::LifecycleServer;

/// Root service: hands out a lifecycle channel per requested plugin.
struct Dispenser {
    connection: Connection,
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

#[async_trait]
impl Service for Dispenser {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        if method != proto::DISPENSE {
            return Err(RpcError::method_not_found(method));
        }
        let req: DispenseRequest = decode(params)?;
        let plugin = self
            .plugins
            .get(&req.name)
            .ok_or_else(|| RpcError::new(ErrorCode::Unknown, format!("unknown plugin: {}", req.name)))?;

        let broker = self.connection.broker();
        let channel = broker.next_id();
        broker.accept_and_serve(
            channel,
            Arc::new(LifecycleServer::new(Arc::clone(plugin), self.connection.clone())),
        );
        debug!(plugin = %req.name, channel, "Dispensed lifecycle service");
        encode(&DispenseResponse { name: req.name, channel })
    }
}

/// Serve `plugins` over an arbitrary byte stream pair.
///
/// Used by [`serve_with`] for stdio and by in-process tests over duplex
/// pipes. The returned connection stays up until the peer goes away.
///
/// # Errors
///
/// Returns [`SdkError::NoPlugins`] for an empty list and
/// [`SdkError::DuplicatePlugin`] when two plugins share a name.
pub fn serve_connection<R, W>(
    peer: impl Into<String>,
    reader: R,
    writer: W,
    plugins: Vec<Arc<dyn Plugin>>,
) -> SdkResult<Connection>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    if plugins.is_empty() {
        return Err(SdkError::NoPlugins);
    }
    let mut by_name = HashMap::with_capacity(plugins.len());
    for plugin in plugins {
        let name = plugin.name().to_string();
        if by_name.insert(name.clone(), plugin).is_some() {
            return Err(SdkError::DuplicatePlugin(name));
        }
    }

    let connection = Connection::new(peer, reader, writer);
    connection.broker().accept_and_serve(
        ROOT_CHANNEL,
        Arc::new(Dispenser {
            connection: connection.clone(),
            plugins: by_name,
        }),
    );
    Ok(connection)
}

/// Serve one plugin with the default handshake until the host goes away.
///
/// # Errors
///
/// See [`serve_with`].
pub async fn serve(plugin: Arc<dyn Plugin>) -> SdkResult<()> {
    serve_with(&HandshakeConfig::default(), vec![plugin]).await
}

/// Serve `plugins` over stdin/stdout until the host goes away.
///
/// Checks the handshake environment first. A binary started by hand fails
/// here with an explanation instead of printing frames to a terminal.
///
/// # Errors
///
/// Returns [`SdkError::Handshake`] if the process was not started by a
/// compatible host, or an I/O error announcing the handshake.
pub async fn serve_with(handshake: &HandshakeConfig, plugins: Vec<Arc<dyn Plugin>>) -> SdkResult<()> {
    let line = handshake.verify_env(|key| std::env::var(key).ok())?;

    // The root service must be in place before the host sees the line.
    let connection = serve_connection("host", tokio::io::stdin(), tokio::io::stdout(), plugins)?;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}")?;
        stdout.flush()?;
    }
    info!(handshake = %line, "Plugin serving");

    connection.closed().await;
    info!("Host closed the connection");
    Ok(())
}
