//! The lifecycle service of one dispensed plugin.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{Plugin, Request, Toolkit};
use tether_rpc::proto::{self, EnableRequest, EnableResponse, MiddlewareRequest, lifecycle};
use tether_rpc::{Connection, FuncMapperServer, RpcError, RpcResult, Service, ServiceSet, decode, encode};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::handler::{HandlerService, PluginFuncLookup, run_middleware};
use crate::proxies::{RemoteLogger, RemoteRenderer, RemoteRouter, RemoteSite};
use crate::state::PluginState;

/// Serves the [`Plugin`] contract of one plugin to the host.
pub struct LifecycleServer {
    plugin: Arc<dyn Plugin>,
    connection: Connection,
    state: Arc<PluginState>,
    callbacks: Mutex<Option<u32>>,
}

impl LifecycleServer {
    /// Lifecycle service for `plugin` on `connection`.
    #[must_use]
    pub fn new(plugin: Arc<dyn Plugin>, connection: Connection) -> Self {
        Self {
            plugin,
            connection,
            state: Arc::new(PluginState::default()),
            callbacks: Mutex::new(None),
        }
    }

    /// Dial the host toolkit, serve the plugin callbacks and enable.
    ///
    /// Both channel ids cross in this one round trip: the host's arrives
    /// in the request, ours leaves in the response.
    async fn enable(&self, host_channel: u32) -> RpcResult<EnableResponse> {
        let mut callbacks = self.callbacks.lock().await;
        let broker = self.connection.broker();
        if let Some(previous) = callbacks.take() {
            debug!(plugin = %self.plugin.name(), channel = previous, "Re-enabling; closing previous callbacks");
            broker.close(previous);
            self.state.clear_routes();
        }

        let host = broker.dial(host_channel);
        let toolkit = Toolkit {
            log: Arc::new(RemoteLogger::new(host.clone())),
            mux: Arc::new(RemoteRouter::new(host.clone(), Arc::clone(&self.state))),
            site: Arc::new(RemoteSite::new(host.clone())),
            render: Arc::new(RemoteRenderer::new(host.clone(), Arc::clone(&self.state))),
        };

        let channel = broker.next_id();
        let services = ServiceSet::new()
            .with(
                proto::plugin::HANDLER,
                HandlerService::new(Arc::clone(&self.state), host),
            )
            .with(
                proto::plugin::FUNCS,
                FuncMapperServer::new(PluginFuncLookup::new(Arc::clone(&self.state), Arc::clone(&self.plugin))),
            );
        broker.accept_and_serve(channel, Arc::new(services));

        if let Err(e) = self.plugin.enable(toolkit).await {
            broker.close(channel);
            return Err(e.into());
        }
        *callbacks = Some(channel);
        info!(plugin = %self.plugin.name(), host_channel, channel, "Plugin enabled");
        Ok(EnableResponse { broker_id: channel })
    }

    async fn disable(&self) -> RpcResult<()> {
        let outcome = self.plugin.disable().await;
        if let Some(channel) = self.callbacks.lock().await.take() {
            self.connection.broker().close(channel);
        }
        self.state.clear_routes();
        outcome?;
        info!(plugin = %self.plugin.name(), "Plugin disabled");
        Ok(())
    }
}

#[async_trait]
impl Service for LifecycleServer {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        match method {
            lifecycle::NAME => encode(&self.plugin.name()),
            lifecycle::VERSION => encode(&self.plugin.version().await?),
            lifecycle::ENABLE => {
                let req: EnableRequest = decode(params)?;
                encode(&self.enable(req.broker_id).await?)
            },
            lifecycle::DISABLE => encode(&self.disable().await?),
            lifecycle::ROUTES => encode(&self.plugin.routes().await?),
            lifecycle::ASSETS => encode(&self.plugin.assets().await?),
            lifecycle::SETTINGS => encode(&self.plugin.settings().await?),
            lifecycle::GRANT_REQUESTS => encode(&self.plugin.grant_requests().await?),
            lifecycle::FUNC_MAP => encode(&self.plugin.func_map(&Request::default()).keys()),
            lifecycle::MIDDLEWARE_COUNT => encode(&self.plugin.middleware().await?.len()),
            lifecycle::MIDDLEWARE => {
                let req: MiddlewareRequest = decode(params)?;
                let chain = self.plugin.middleware().await?;
                encode(&run_middleware(&self.state, &chain, req).await)
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
