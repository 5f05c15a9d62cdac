//! Out-of-process plugins behind the ordinary [`Plugin`] contract.
//!
//! The plugin registry holds a [`RemotePlugin`] exactly like an in-process
//! plugin. Every trait call becomes a lifecycle RPC; `enable` additionally
//! exchanges callback channels so the plugin can reach the host toolkit and
//! the host can forward requests to the plugin.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tether_core::{
    Assets, Flow, FuncMap, GrantRequest, HttpError, Middleware, Plugin, PluginError, PluginResult, Request,
    RequestId, ResponseWriter, Setting, Toolkit,
};
use tether_rpc::proto::{
    self, EnableRequest, EnableResponse, FuncScope, MiddlewareRequest, MiddlewareResponse, lifecycle,
};
use tether_rpc::{Connection, FuncMapperServer, RpcClient, ServiceSet, remote_func_map};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::bridge::{FuncSource, HandlerBridge, RouterServer};
use crate::config::HostConfig;
use crate::connector::PluginProcessHandle;
use crate::correlator::{ContextGuard, RequestContext, RequestCorrelator};
use crate::services::{HostFuncLookup, LoggerServer, RendererServer, SiteServer};

/// Per-host settings applied to every remote plugin.
#[derive(Clone, Default)]
pub struct AdapterOptions {
    /// Builds the host function table handed to plugin handlers.
    pub funcs: Option<FuncSource>,
    /// Bound on a forwarded handler call.
    pub call_timeout: Option<Duration>,
}

impl AdapterOptions {
    /// Options taken from the host config.
    #[must_use]
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            funcs: None,
            call_timeout: config.call_timeout(),
        }
    }

    /// Set the host function table source.
    #[must_use]
    pub fn with_funcs<F>(mut self, source: F) -> Self
    where
        F: Fn(&Request) -> FuncMap + Send + Sync + 'static,
    {
        self.funcs = Some(Arc::new(source));
        self
    }

    /// Set the forwarded call bound.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for AdapterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterOptions")
            .field("funcs", &self.funcs.is_some())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

/// What an enabled plugin is bound to.
struct Binding {
    toolkit: Toolkit,
    host_channel: u32,
}

/// A plugin running in another process.
pub struct RemotePlugin {
    name: String,
    connection: Connection,
    lifecycle: RpcClient,
    correlator: RequestCorrelator,
    bridge: Arc<HandlerBridge>,
    binding: Mutex<Option<Binding>>,
    func_keys: RwLock<Vec<String>>,
}

impl RemotePlugin {
    /// Adapter over a connected plugin process.
    #[must_use]
    pub fn new(handle: &PluginProcessHandle, correlator: RequestCorrelator, options: AdapterOptions) -> Self {
        Self::from_connection(
            handle.name(),
            handle.connection().clone(),
            handle.lifecycle().clone(),
            correlator,
            options,
        )
    }

    /// Adapter over any connection whose peer serves the lifecycle service
    /// behind `lifecycle`.
    #[must_use]
    pub fn from_connection(
        name: impl Into<String>,
        connection: Connection,
        lifecycle: RpcClient,
        correlator: RequestCorrelator,
        options: AdapterOptions,
    ) -> Self {
        let name = name.into();
        let bridge = Arc::new(HandlerBridge::new(
            name.clone(),
            correlator.clone(),
            options.funcs,
            options.call_timeout,
        ));
        Self {
            name,
            connection,
            lifecycle,
            correlator,
            bridge,
            binding: Mutex::new(None),
            func_keys: RwLock::new(Vec::new()),
        }
    }

    /// Request forwarding state of this plugin.
    #[must_use]
    pub fn bridge(&self) -> &Arc<HandlerBridge> {
        &self.bridge
    }

    /// Whether the connection to the process is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    async fn call<R: serde::de::DeserializeOwned>(&self, method: &str) -> PluginResult<R> {
        Ok(self.lifecycle.call(method, &()).await?)
    }

    /// Tear down a binding: forget routes, stop forwarding, close the host
    /// toolkit channel.
    async fn unbind(&self, binding: Binding) {
        for (method, path) in self.bridge.take_routes() {
            binding.toolkit.mux.remove(&method, &path).await;
        }
        self.bridge.detach();
        self.connection.broker().close(binding.host_channel);
    }
}

impl std::fmt::Debug for RemotePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemotePlugin")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Plugin for RemotePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> PluginResult<String> {
        self.call(lifecycle::VERSION).await
    }

    async fn enable(&self, toolkit: Toolkit) -> PluginResult<()> {
        let mut binding = self.binding.lock().await;
        if let Some(previous) = binding.take() {
            debug!(plugin = %self.name, "Re-enabling; dropping previous binding");
            self.unbind(previous).await;
        }

        let broker = self.connection.broker();
        let host_channel = broker.next_id();
        let services = ServiceSet::new()
            .with(
                proto::host::ROUTER,
                RouterServer::new(Arc::clone(&self.bridge), Arc::clone(&toolkit.mux), self.correlator.clone()),
            )
            .with(proto::host::LOGGER, LoggerServer::new(Arc::clone(&toolkit.log)))
            .with(
                proto::host::SITE,
                SiteServer::new(Arc::clone(&toolkit.site), self.correlator.clone()),
            )
            .with(
                proto::host::RENDERER,
                RendererServer::new(Arc::clone(&toolkit.render), self.correlator.clone(), Arc::clone(&self.bridge)),
            )
            .with(
                proto::host::FUNCS,
                FuncMapperServer::new(HostFuncLookup::new(self.correlator.clone())),
            );
        broker.accept_and_serve(host_channel, Arc::new(services));

        let enabled: EnableResponse = match self
            .lifecycle
            .call(lifecycle::ENABLE, &EnableRequest { broker_id: host_channel })
            .await
        {
            Ok(enabled) => enabled,
            Err(e) => {
                broker.close(host_channel);
                for (method, path) in self.bridge.take_routes() {
                    toolkit.mux.remove(&method, &path).await;
                }
                return Err(e.into());
            },
        };
        self.bridge.attach(broker.dial(enabled.broker_id));

        match self.call::<Vec<String>>(lifecycle::FUNC_MAP).await {
            Ok(keys) => *self.func_keys.write().unwrap_or_else(PoisonError::into_inner) = keys,
            Err(e) => warn!(plugin = %self.name, error = %e, "Could not list plugin functions"),
        }

        *binding = Some(Binding { toolkit, host_channel });
        info!(plugin = %self.name, host_channel, plugin_channel = enabled.broker_id, "Remote plugin enabled");
        Ok(())
    }

    async fn disable(&self) -> PluginResult<()> {
        let binding = self.binding.lock().await.take();
        let outcome = self.lifecycle.call::<_, ()>(lifecycle::DISABLE, &()).await;
        if let Some(binding) = binding {
            self.unbind(binding).await;
        }
        self.bridge.detach();
        self.func_keys.write().unwrap_or_else(PoisonError::into_inner).clear();

        match outcome {
            Ok(()) => {
                info!(plugin = %self.name, "Remote plugin disabled");
                Ok(())
            },
            // A dead process is as disabled as it gets.
            Err(e) if e.is_closed() => {
                debug!(plugin = %self.name, "Disabled plugin whose connection is closed");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn routes(&self) -> PluginResult<()> {
        if self.bridge.client().is_none() {
            return Err(PluginError::NotEnabled(self.name.clone()));
        }
        self.call(lifecycle::ROUTES).await
    }

    async fn assets(&self) -> PluginResult<Assets> {
        self.call(lifecycle::ASSETS).await
    }

    async fn settings(&self) -> PluginResult<Vec<Setting>> {
        self.call(lifecycle::SETTINGS).await
    }

    async fn grant_requests(&self) -> PluginResult<Vec<GrantRequest>> {
        self.call(lifecycle::GRANT_REQUESTS).await
    }

    async fn middleware(&self) -> PluginResult<Vec<Arc<dyn Middleware>>> {
        let count: usize = self.call(lifecycle::MIDDLEWARE_COUNT).await?;
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Arc::new(RemoteMiddleware {
            plugin: self.name.clone(),
            lifecycle: self.lifecycle.clone(),
            correlator: self.correlator.clone(),
        })])
    }

    fn func_map(&self, req: &Request) -> FuncMap {
        let Some(client) = self.bridge.client() else {
            return FuncMap::new();
        };
        let keys = self.func_keys.read().unwrap_or_else(PoisonError::into_inner).clone();
        // Global-scope stubs do not resolve by id.
        let request_id = req.request_id().cloned().unwrap_or_else(RequestId::unscoped);
        remote_func_map(&client, &request_id, keys, FuncScope::Global)
    }
}

/// The plugin's whole middleware chain as one host middleware.
struct RemoteMiddleware {
    plugin: String,
    lifecycle: RpcClient,
    correlator: RequestCorrelator,
}

#[async_trait]
impl Middleware for RemoteMiddleware {
    async fn handle(&self, req: &mut Request, w: &ResponseWriter) -> Result<Flow, HttpError> {
        // The forwarded handler call reuses this id.
        let request_id = req.ensure_request_id();
        let call = MiddlewareRequest {
            request_id: request_id.clone(),
            method: req.method.clone(),
            path: req.path.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
        };
        let context = self.correlator.save(
            request_id.clone(),
            RequestContext::new(req.clone(), w.clone(), FuncMap::new()),
        );
        let mut guard = ContextGuard::new(self.correlator.clone(), request_id, context);
        let outcome = self
            .lifecycle
            .call::<_, MiddlewareResponse>(lifecycle::MIDDLEWARE, &call)
            .await;
        guard.finish();
        drop(guard);

        let response = outcome.map_err(|e| {
            warn!(plugin = %self.plugin, error = %e, "Remote middleware failed");
            HttpError::internal(e.to_string())
        })?;
        apply_middleware(response, w)
    }
}

/// Decide how the host chain continues after the plugin's middleware ran.
fn apply_middleware(response: MiddlewareResponse, w: &ResponseWriter) -> Result<Flow, HttpError> {
    if !response.error.is_empty() {
        let code = if response.status >= 400 { response.status } else { 500 };
        return Err(HttpError::with_message(code, response.error));
    }

    w.merge_headers(&response.headers);
    if !response.body.is_empty() {
        w.write_header(if response.status == 0 { 200 } else { response.status });
        w.write(&response.body);
        return Ok(Flow::Halt);
    }
    if response.status != 0 && response.status != 200 {
        w.write_header(response.status);
        return Ok(Flow::Halt);
    }
    Ok(Flow::Next)
}

#[cfg(test)]
mod tests {
    use tether_core::Headers;

    use super::*;

    fn response(status: u16, body: &str) -> MiddlewareResponse {
        MiddlewareResponse {
            status,
            error: String::new(),
            body: body.as_bytes().to_vec(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_middleware_continues_when_nothing_written() {
        let w = ResponseWriter::new();
        assert_eq!(apply_middleware(response(0, ""), &w).unwrap(), Flow::Next);
        assert_eq!(apply_middleware(response(200, ""), &w).unwrap(), Flow::Next);
        assert!(!w.is_committed());
    }

    #[test]
    fn test_middleware_halts_on_body_or_status() {
        let w = ResponseWriter::new();
        assert_eq!(apply_middleware(response(0, "blocked"), &w).unwrap(), Flow::Halt);
        assert_eq!(w.status(), 200);
        assert_eq!(w.snapshot().body_text(), "blocked");

        let w = ResponseWriter::new();
        assert_eq!(apply_middleware(response(302, ""), &w).unwrap(), Flow::Halt);
        assert_eq!(w.status(), 302);
    }

    #[test]
    fn test_middleware_headers_pass_through() {
        let w = ResponseWriter::new();
        let mut resp = response(0, "");
        resp.headers.set("X-Seen-By", "hello");
        assert_eq!(apply_middleware(resp, &w).unwrap(), Flow::Next);
        assert_eq!(w.snapshot().headers.get("x-seen-by"), Some("hello"));
    }

    #[test]
    fn test_middleware_error_text() {
        let w = ResponseWriter::new();
        let mut resp = response(401, "");
        resp.error = "login first".into();
        assert_eq!(
            apply_middleware(resp, &w).unwrap_err(),
            HttpError::with_message(401, "login first")
        );
    }
}
