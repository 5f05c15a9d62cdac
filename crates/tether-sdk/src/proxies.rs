//! Host toolkit proxies handed to the plugin at enable time.
//!
//! Each proxy implements the same trait the host's real service does, so
//! plugin code cannot tell it runs in another process. Request-scoped
//! calls send the request id the host assigned; the host resolves it to
//! the live request.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{
    FuncMap, Grant, GrantRequest, Handler, HttpError, LogLevel, Logger, Renderer, Request, RequestId, ResponseWriter,
    Router, SecureSite, Vars,
};
use tether_rpc::proto::{
    ErrorRequest, GrantQuery, LogRequest, NeighborGrantQuery, ParamRequest, PluginQuery, RenderKind, RenderRequest,
    RequestRef, RouteRequest, SetNeighborGrant, UserLoginRequest, host,
};
use tether_rpc::{RpcClient, RpcError};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::state::PluginState;

fn bridged(req: &Request) -> Result<&RequestId, HttpError> {
    req.request_id()
        .ok_or_else(|| HttpError::internal("request did not arrive through the host bridge"))
}

/// `logger.*`.
///
/// [`Logger::log`] is synchronous; lines are queued and sent in order by a
/// background task that lives as long as the logger.
pub struct RemoteLogger {
    tx: mpsc::UnboundedSender<LogRequest>,
}

impl RemoteLogger {
    /// Logger sending through `client`. Must be created inside a runtime.
    #[must_use]
    pub fn new(client: RpcClient) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogRequest>();
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = client.call::<_, ()>(host::LOGGER_LOG, &line).await {
                    if e.is_closed() {
                        break;
                    }
                    debug!(error = %e, "Host rejected log line");
                }
            }
        });
        Self { tx }
    }
}

impl Logger for RemoteLogger {
    fn log(&self, level: LogLevel, message: &str) {
        let line = LogRequest {
            level,
            message: message.to_string(),
        };
        if self.tx.send(line).is_err() {
            debug!("Log forwarder stopped; dropping line");
        }
    }
}

/// `router.*`.
///
/// Declared handlers stay in this process; the host only learns the method
/// and pattern and forwards matching requests back.
pub struct RemoteRouter {
    host: RpcClient,
    state: Arc<PluginState>,
}

impl RemoteRouter {
    pub(crate) fn new(host: RpcClient, state: Arc<PluginState>) -> Self {
        Self { host, state }
    }
}

#[async_trait]
impl Router for RemoteRouter {
    async fn handle(&self, method: &str, path: &str, handler: Handler) {
        self.state.add_route(method, path, handler);
        let route = RouteRequest {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
        };
        if let Err(e) = self.host.call::<_, ()>(host::ROUTER_HANDLE, &route).await {
            warn!(method = %route.method, path = %route.path, error = %e, "Host refused route");
        }
    }

    async fn remove(&self, method: &str, path: &str) {
        self.state.remove_route(method, path);
    }

    async fn param(&self, req: &Request, name: &str) -> String {
        let local = || req.params.get(name).cloned().unwrap_or_default();
        let Some(id) = req.request_id() else {
            return local();
        };
        let query = ParamRequest {
            request_id: id.clone(),
            name: name.to_string(),
        };
        match self.host.call::<_, String>(host::ROUTER_PARAM, &query).await {
            Ok(value) => value,
            Err(e) => {
                debug!(request_id = %id, param = %name, error = %e, "Param lookup fell back to local match");
                local()
            },
        }
    }

    async fn error(&self, status: u16, w: &ResponseWriter, req: &Request) {
        let Some(id) = req.request_id() else {
            w.write_header(status);
            return;
        };
        let call = ErrorRequest {
            request_id: id.clone(),
            status,
        };
        if let Err(e) = self.host.call::<_, ()>(host::ROUTER_ERROR, &call).await {
            warn!(request_id = %id, status, error = %e, "Host error page failed");
            w.write_header(status);
        }
    }
}

/// `site.*`.
pub struct RemoteSite {
    host: RpcClient,
}

impl RemoteSite {
    pub(crate) fn new(host: RpcClient) -> Self {
        Self { host }
    }
}

#[async_trait]
impl SecureSite for RemoteSite {
    async fn authorized(&self, grant: &Grant) -> bool {
        let query = GrantQuery { grant: grant.clone() };
        match self.host.call(host::SITE_AUTHORIZED, &query).await {
            Ok(granted) => granted,
            Err(e) => {
                warn!(grant = %grant, error = %e, "Grant check failed; treating as denied");
                false
            },
        }
    }

    async fn neighbor_plugin_grant_list(&self, plugin: &str) -> Result<Vec<GrantRequest>, HttpError> {
        let query = PluginQuery {
            plugin: plugin.to_string(),
        };
        self.host
            .call(host::SITE_GRANT_LIST, &query)
            .await
            .map_err(RpcError::into_http)
    }

    async fn neighbor_plugin_granted(&self, plugin: &str, grant: &Grant) -> Result<bool, HttpError> {
        let query = NeighborGrantQuery {
            plugin: plugin.to_string(),
            grant: grant.clone(),
        };
        self.host
            .call(host::SITE_GRANTED, &query)
            .await
            .map_err(RpcError::into_http)
    }

    async fn set_neighbor_plugin_grant(&self, plugin: &str, grant: &Grant, granted: bool) -> Result<(), HttpError> {
        let call = SetNeighborGrant {
            plugin: plugin.to_string(),
            grant: grant.clone(),
            granted,
        };
        self.host
            .call(host::SITE_SET_GRANT, &call)
            .await
            .map_err(RpcError::into_http)
    }

    async fn load_single_plugin_pages(&self, plugin: &str) -> Result<(), HttpError> {
        let query = PluginQuery {
            plugin: plugin.to_string(),
        };
        self.host
            .call(host::SITE_LOAD_PAGES, &query)
            .await
            .map_err(RpcError::into_http)
    }

    async fn user_login(&self, req: &Request, username: &str) -> Result<(), HttpError> {
        let call = UserLoginRequest {
            request_id: bridged(req)?.clone(),
            username: username.to_string(),
        };
        self.host
            .call(host::SITE_USER_LOGIN, &call)
            .await
            .map_err(RpcError::into_http)
    }

    async fn authenticated_user(&self, req: &Request) -> Result<String, HttpError> {
        let query = RequestRef {
            request_id: bridged(req)?.clone(),
        };
        self.host
            .call(host::SITE_AUTHENTICATED_USER, &query)
            .await
            .map_err(RpcError::into_http)
    }

    async fn title(&self) -> Result<String, HttpError> {
        self.host
            .call(host::SITE_TITLE, &())
            .await
            .map_err(RpcError::into_http)
    }
}

/// `renderer.*`.
///
/// The template runs on the host and writes the host's real response. The
/// plugin's functions stay registered here under the request id until the
/// render returns, so template calls can reach back through `funcs.do`.
pub struct RemoteRenderer {
    host: RpcClient,
    state: Arc<PluginState>,
}

impl RemoteRenderer {
    pub(crate) fn new(host: RpcClient, state: Arc<PluginState>) -> Self {
        Self { host, state }
    }

    async fn render(&self, req: &Request, kind: RenderKind, funcs: FuncMap, vars: Vars) -> Result<(), HttpError> {
        let request_id = bridged(req)?.clone();
        let func_keys = funcs.keys();
        let _registered = self.state.register_render_funcs(request_id.clone(), funcs);
        let call = RenderRequest {
            request_id,
            kind,
            func_keys,
            vars,
        };
        self.host
            .call(host::RENDERER_RENDER, &call)
            .await
            .map_err(RpcError::into_http)
    }
}

#[async_trait]
impl Renderer for RemoteRenderer {
    async fn page(
        &self,
        _w: &ResponseWriter,
        req: &Request,
        template: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        let kind = RenderKind::Page {
            template: template.to_string(),
        };
        self.render(req, kind, funcs, vars).await
    }

    async fn page_content(
        &self,
        _w: &ResponseWriter,
        req: &Request,
        content: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        let kind = RenderKind::Content {
            content: content.to_string(),
        };
        self.render(req, kind, funcs, vars).await
    }

    async fn error(
        &self,
        _w: &ResponseWriter,
        req: &Request,
        content: &str,
        status: u16,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        let kind = RenderKind::Error {
            content: content.to_string(),
            status,
        };
        self.render(req, kind, funcs, vars).await
    }
}
