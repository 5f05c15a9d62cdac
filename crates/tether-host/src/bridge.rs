//! Forwarding HTTP requests into a plugin process.
//!
//! The host router never sees plugin handlers. When the plugin declares a
//! route, [`RouterServer`] registers a forwarder built by
//! [`HandlerBridge::forwarder`]. The forwarder parks the live request in
//! the [`RequestCorrelator`], calls `handler.handle` on the plugin, and
//! replays the recorded outcome onto the real response.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tether_core::{FuncMap, Handler, HttpError, Request, RequestId, ResponseWriter, Router, handler};
use tether_rpc::proto::{self, ErrorRequest, HandleRequest, HandleResponse, ParamRequest, RouteRequest};
use tether_rpc::{ErrorCode, RpcClient, RpcError, RpcResult, Service, decode, encode};
use tracing::{debug, warn};

use crate::correlator::{ContextGuard, ContextLease, RequestContext, RequestCorrelator};

/// Builds the host function table for a request.
pub type FuncSource = Arc<dyn Fn(&Request) -> FuncMap + Send + Sync>;

/// Error for nested calls whose request is no longer tracked.
pub(crate) fn missing_context(id: &RequestId) -> RpcError {
    RpcError::new(ErrorCode::Unknown, format!("no request context for {id}"))
}

/// Lease the context of a nested call.
pub(crate) fn lease(correlator: &RequestCorrelator, id: &RequestId) -> RpcResult<ContextLease> {
    correlator.lease(id).ok_or_else(|| missing_context(id))
}

/// Request forwarding for one plugin.
pub struct HandlerBridge {
    plugin: String,
    correlator: RequestCorrelator,
    handler: RwLock<Option<RpcClient>>,
    funcs: Option<FuncSource>,
    call_timeout: Option<Duration>,
    routes: Mutex<Vec<(String, String)>>,
}

impl HandlerBridge {
    /// Bridge for `plugin`. Forwarders answer 503 until a handler client is
    /// attached.
    #[must_use]
    pub fn new(
        plugin: impl Into<String>,
        correlator: RequestCorrelator,
        funcs: Option<FuncSource>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            correlator,
            handler: RwLock::new(None),
            funcs,
            call_timeout,
            routes: Mutex::new(Vec::new()),
        }
    }

    /// Route forwarded calls to the plugin's callback channel.
    pub fn attach(&self, client: RpcClient) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    /// Stop forwarding.
    pub fn detach(&self) {
        self.handler.write().unwrap_or_else(PoisonError::into_inner).take();
    }

    /// Client of the plugin's callback channel, if attached.
    #[must_use]
    pub fn client(&self) -> Option<RpcClient> {
        self.handler.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Remember a route registered on the plugin's behalf.
    pub fn record_route(&self, method: &str, path: &str) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = (method.to_ascii_uppercase(), path.to_string());
        if !routes.contains(&route) {
            routes.push(route);
        }
    }

    /// Routes registered so far, clearing the record.
    pub fn take_routes(&self) -> Vec<(String, String)> {
        std::mem::take(&mut *self.routes.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Host handler forwarding `method` `path` to the plugin.
    #[must_use]
    pub fn forwarder(self: &Arc<Self>, method: &str, path: &str) -> Handler {
        let bridge = Arc::clone(self);
        let method = method.to_ascii_uppercase();
        let path = path.to_string();
        handler(move |req: Request, w: ResponseWriter| {
            let bridge = Arc::clone(&bridge);
            let method = method.clone();
            let path = path.clone();
            async move { bridge.forward(&method, &path, req, &w).await }
        })
    }

    /// Forward one request and replay the plugin's response onto `w`.
    ///
    /// # Errors
    ///
    /// Returns the plugin's error, keeping its status when it carried one.
    /// Answers 503 when the plugin is not attached and 504 when the call
    /// outlives the configured timeout.
    pub async fn forward(&self, method: &str, path: &str, mut req: Request, w: &ResponseWriter) -> Result<(), HttpError> {
        let Some(client) = self.client() else {
            return Err(HttpError::with_message(
                503,
                format!("plugin {} is not available", self.plugin),
            ));
        };

        let request_id = req.ensure_request_id();
        let funcs = self.funcs.as_ref().map(|source| source(&req)).unwrap_or_default();
        let call = HandleRequest {
            request_id: request_id.clone(),
            method: method.to_string(),
            path: path.to_string(),
            full_path: req.path.clone(),
            headers: req.headers.clone(),
            body: req.body.clone(),
            func_keys: funcs.keys(),
        };

        let context = self
            .correlator
            .save(request_id.clone(), RequestContext::new(req, w.clone(), funcs));
        let mut guard = ContextGuard::new(self.correlator.clone(), request_id.clone(), context);

        let pending = client.call::<_, HandleResponse>(proto::plugin::HANDLER_HANDLE, &call);
        let outcome = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, pending).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        plugin = %self.plugin,
                        request_id = %request_id,
                        timeout_secs = limit.as_secs(),
                        "Plugin handler timed out"
                    );
                    return Err(HttpError::with_message(504, "plugin handler timed out"));
                },
            },
            None => pending.await,
        };
        guard.finish();
        drop(guard);

        let response = outcome.map_err(|e| {
            debug!(plugin = %self.plugin, request_id = %request_id, error = %e, "Forwarded call failed");
            e.into_http()
        })?;
        replay(response, w)
    }
}

impl std::fmt::Debug for HandlerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBridge")
            .field("plugin", &self.plugin)
            .field("attached", &self.client().is_some())
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

/// Apply a plugin handler's recorded response.
///
/// Error text wins over everything else. A bare error status is surfaced
/// as a status error so the host renders its own error page. If a nested
/// call already wrote the real response, the recorded one is dropped.
fn replay(response: HandleResponse, w: &ResponseWriter) -> Result<(), HttpError> {
    if !response.error.is_empty() {
        w.merge_headers(&response.headers);
        let code = if response.status >= 400 { response.status } else { 500 };
        return Err(HttpError::with_message(code, response.error));
    }

    if response.status >= 400 && response.body.is_empty() {
        w.merge_headers(&response.headers);
        return Err(HttpError::status(response.status));
    }

    if w.is_committed() {
        return Ok(());
    }

    w.merge_headers(&response.headers);
    w.write_header(if response.status == 0 { 200 } else { response.status });
    if !response.body.is_empty() {
        w.write(&response.body);
    }
    Ok(())
}

/// `router.*` as served to the plugin.
pub struct RouterServer {
    bridge: Arc<HandlerBridge>,
    router: Arc<dyn Router>,
    correlator: RequestCorrelator,
}

impl RouterServer {
    /// Serve route declarations and nested router calls.
    #[must_use]
    pub fn new(bridge: Arc<HandlerBridge>, router: Arc<dyn Router>, correlator: RequestCorrelator) -> Self {
        Self {
            bridge,
            router,
            correlator,
        }
    }
}

#[async_trait]
impl Service for RouterServer {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        match method {
            "handle" => {
                let route: RouteRequest = decode(params)?;
                let handler = self.bridge.forwarder(&route.method, &route.path);
                self.router.handle(&route.method, &route.path, handler).await;
                self.bridge.record_route(&route.method, &route.path);
                debug!(plugin = %self.bridge.plugin, method = %route.method, path = %route.path, "Registered plugin route");
                encode(&())
            },
            "param" => {
                let req: ParamRequest = decode(params)?;
                let context = lease(&self.correlator, &req.request_id)?;
                encode(&self.router.param(&context.request, &req.name).await)
            },
            "error" => {
                let req: ErrorRequest = decode(params)?;
                let context = lease(&self.correlator, &req.request_id)?;
                self.router.error(req.status, &context.response, &context.request).await;
                encode(&())
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }
}
