//! Host toolkit services served to a plugin.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{LogLevel, Logger, Renderer, RequestId, SecureSite};
use tether_rpc::proto::{
    FuncScope, GrantQuery, LogRequest, NeighborGrantQuery, PluginQuery, RenderKind, RenderRequest, RequestRef,
    SetNeighborGrant, UserLoginRequest,
};
use tether_rpc::{FuncLookup, FuncTable, RpcError, RpcResult, Service, decode, encode, remote_func_map};
use tracing::{debug, error, info, warn};

use crate::bridge::{HandlerBridge, lease};
use crate::correlator::RequestCorrelator;

/// `logger.*`.
pub struct LoggerServer {
    logger: Arc<dyn Logger>,
}

impl LoggerServer {
    /// Forward plugin log lines to `logger`.
    #[must_use]
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

#[async_trait]
impl Service for LoggerServer {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        match method {
            "log" => {
                let line: LogRequest = decode(params)?;
                self.logger.log(line.level, &line.message);
                encode(&())
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// [`Logger`] writing through `tracing`, tagged with the plugin name.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    plugin: String,
}

impl TracingLogger {
    /// Logger for `plugin`.
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        Self { plugin: plugin.into() }
    }
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(plugin = %self.plugin, "{message}"),
            LogLevel::Info => info!(plugin = %self.plugin, "{message}"),
            LogLevel::Warn => warn!(plugin = %self.plugin, "{message}"),
            LogLevel::Error => error!(plugin = %self.plugin, "{message}"),
        }
    }
}

/// `site.*`.
pub struct SiteServer {
    site: Arc<dyn SecureSite>,
    correlator: RequestCorrelator,
}

impl SiteServer {
    /// Serve `site`, resolving request-scoped calls through `correlator`.
    #[must_use]
    pub fn new(site: Arc<dyn SecureSite>, correlator: RequestCorrelator) -> Self {
        Self { site, correlator }
    }
}

#[async_trait]
impl Service for SiteServer {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        match method {
            "authorized" => {
                let q: GrantQuery = decode(params)?;
                encode(&self.site.authorized(&q.grant).await)
            },
            "neighbor_plugin_grant_list" => {
                let q: PluginQuery = decode(params)?;
                encode(&self.site.neighbor_plugin_grant_list(&q.plugin).await?)
            },
            "neighbor_plugin_granted" => {
                let q: NeighborGrantQuery = decode(params)?;
                encode(&self.site.neighbor_plugin_granted(&q.plugin, &q.grant).await?)
            },
            "set_neighbor_plugin_grant" => {
                let q: SetNeighborGrant = decode(params)?;
                self.site
                    .set_neighbor_plugin_grant(&q.plugin, &q.grant, q.granted)
                    .await?;
                encode(&())
            },
            "load_single_plugin_pages" => {
                let q: PluginQuery = decode(params)?;
                self.site.load_single_plugin_pages(&q.plugin).await?;
                encode(&())
            },
            "user_login" => {
                let q: UserLoginRequest = decode(params)?;
                let context = lease(&self.correlator, &q.request_id)?;
                self.site.user_login(&context.request, &q.username).await?;
                encode(&())
            },
            "authenticated_user" => {
                let q: RequestRef = decode(params)?;
                let context = lease(&self.correlator, &q.request_id)?;
                encode(&self.site.authenticated_user(&context.request).await?)
            },
            "title" => encode(&self.site.title().await?),
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// `renderer.*`.
///
/// Templates may call the plugin's own functions. The keys arrive with the
/// call and become stubs reaching back into the plugin's `funcs.do`.
pub struct RendererServer {
    renderer: Arc<dyn Renderer>,
    correlator: RequestCorrelator,
    bridge: Arc<HandlerBridge>,
}

impl RendererServer {
    /// Serve `renderer` for the plugin behind `bridge`.
    #[must_use]
    pub fn new(renderer: Arc<dyn Renderer>, correlator: RequestCorrelator, bridge: Arc<HandlerBridge>) -> Self {
        Self {
            renderer,
            correlator,
            bridge,
        }
    }
}

#[async_trait]
impl Service for RendererServer {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        if method != "render" {
            return Err(RpcError::method_not_found(method));
        }
        let req: RenderRequest = decode(params)?;
        let context = lease(&self.correlator, &req.request_id)?;
        let funcs = match self.bridge.client() {
            Some(client) => remote_func_map(&client, &req.request_id, req.func_keys, FuncScope::Request),
            None => tether_core::FuncMap::new(),
        };

        let (w, r) = (&context.response, &context.request);
        match req.kind {
            RenderKind::Page { template } => self.renderer.page(w, r, &template, funcs, req.vars).await?,
            RenderKind::Content { content } => self.renderer.page_content(w, r, &content, funcs, req.vars).await?,
            RenderKind::Error { content, status } => {
                self.renderer
                    .error(w, r, &content, status, funcs, req.vars)
                    .await?;
            },
        }
        encode(&())
    }
}

/// Resolves `funcs.do` calls from the plugin against the host tables
/// stored per request.
#[derive(Debug, Clone)]
pub struct HostFuncLookup {
    correlator: RequestCorrelator,
}

impl HostFuncLookup {
    /// Lookup over `correlator`.
    #[must_use]
    pub fn new(correlator: RequestCorrelator) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl FuncLookup for HostFuncLookup {
    async fn lookup(&self, request_id: &RequestId, scope: FuncScope) -> Option<FuncTable> {
        match scope {
            FuncScope::Request => {
                let context = self.correlator.lease(request_id)?;
                let funcs = context.funcs.clone();
                Some(FuncTable::new(funcs).with_lease(context))
            },
            // The host keeps no global table for plugins.
            FuncScope::Global => None,
        }
    }
}
