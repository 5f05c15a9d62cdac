//! Plugin callbacks served to the host: forwarded requests and function
//! tables.

use std::sync::Arc;

use async_trait::async_trait;
use tether_core::{Flow, Headers, Middleware, Plugin, Request, RequestId, ResponseWriter, match_route};
use tether_rpc::proto::{FuncScope, HandleRequest, HandleResponse, MiddlewareRequest, MiddlewareResponse};
use tether_rpc::{FuncLookup, FuncTable, RpcClient, RpcError, RpcResult, Service, decode, encode, remote_func_map};
use tracing::debug;

use crate::state::{MIDDLEWARE_VALUES_GRACE, PluginState};

/// `handler.*`: runs declared routes against an in-memory recorder.
pub struct HandlerService {
    state: Arc<PluginState>,
    host: RpcClient,
}

impl HandlerService {
    pub(crate) fn new(state: Arc<PluginState>, host: RpcClient) -> Self {
        Self { state, host }
    }

    async fn handle(&self, req: HandleRequest) -> HandleResponse {
        let Some(handler) = self.state.handler(&req.method, &req.path) else {
            debug!(request_id = %req.request_id, method = %req.method, path = %req.path, "No handler for forwarded route");
            return HandleResponse {
                status: 404,
                ..HandleResponse::default()
            };
        };

        let funcs = remote_func_map(&self.host, &req.request_id, req.func_keys, FuncScope::Request);
        let values = self.state.take_middleware_values(&req.request_id);
        let mut request = rebuild(&req.method, &req.full_path, req.headers, req.body, req.request_id).with_funcs(funcs);
        request.values = values;
        if let Some(params) = match_route(&req.path, request.path_only()) {
            request.params = params;
        }

        let recorder = ResponseWriter::new();
        let outcome = handler(request, recorder.clone()).await;
        let recorded = recorder.snapshot();
        match outcome {
            Ok(()) => HandleResponse {
                status: recorded.status_or_ok(),
                error: String::new(),
                body: recorded.body,
                headers: recorded.headers,
            },
            // No partial body alongside an error.
            Err(e) => HandleResponse {
                status: e.code(),
                error: e.to_string(),
                body: Vec::new(),
                headers: recorded.headers,
            },
        }
    }
}

#[async_trait]
impl Service for HandlerService {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        match method {
            "handle" => {
                let req: HandleRequest = decode(params)?;
                encode(&self.handle(req).await)
            },
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

/// Rebuild a forwarded request on this side of the bridge.
pub(crate) fn rebuild(method: &str, path: &str, headers: Headers, body: Vec<u8>, id: RequestId) -> Request {
    let mut request = Request::new(method, path).with_body(body).with_request_id(id);
    request.headers = headers;
    request
}

/// Run `chain` in order against a recorder until one step halts.
///
/// When the whole chain passes, values it attached to the request are kept
/// in `state` for the handler serving the same request id.
pub(crate) async fn run_middleware(
    state: &Arc<PluginState>,
    chain: &[Arc<dyn Middleware>],
    req: MiddlewareRequest,
) -> MiddlewareResponse {
    let id = req.request_id.clone();
    let mut request = rebuild(&req.method, &req.path, req.headers, req.body, req.request_id);
    let recorder = ResponseWriter::new();
    let mut halted = false;
    for step in chain {
        match step.handle(&mut request, &recorder).await {
            Ok(Flow::Next) => {},
            Ok(Flow::Halt) => {
                halted = true;
                break;
            },
            Err(e) => {
                return MiddlewareResponse {
                    status: e.code(),
                    error: e.to_string(),
                    ..MiddlewareResponse::default()
                };
            },
        }
    }
    if !halted && !request.values.is_empty() {
        debug!(request_id = %id, values = request.values.len(), "Keeping middleware values for the handler");
        state.stash_middleware_values(id, request.values, MIDDLEWARE_VALUES_GRACE);
    }
    let recorded = recorder.snapshot();
    MiddlewareResponse {
        status: recorded.status.unwrap_or(0),
        error: String::new(),
        body: recorded.body,
        headers: recorded.headers,
    }
}

/// Resolves host calls into the plugin's function tables.
///
/// Request scope finds the table of a render in flight; global scope asks
/// the plugin for its table.
pub(crate) struct PluginFuncLookup {
    state: Arc<PluginState>,
    plugin: Arc<dyn Plugin>,
}

impl PluginFuncLookup {
    pub(crate) fn new(state: Arc<PluginState>, plugin: Arc<dyn Plugin>) -> Self {
        Self { state, plugin }
    }
}

#[async_trait]
impl FuncLookup for PluginFuncLookup {
    async fn lookup(&self, request_id: &RequestId, scope: FuncScope) -> Option<FuncTable> {
        match scope {
            FuncScope::Request => self.state.render_funcs(request_id).map(FuncTable::new),
            FuncScope::Global => {
                let req = Request::default().with_request_id(request_id.clone());
                Some(FuncTable::new(self.plugin.func_map(&req)))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tether_core::{HttpError, handler};
    use tether_rpc::Connection;

    use super::*;

    fn detached_host() -> (RpcClient, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(ours);
        let conn = Connection::new("host", reader, writer);
        (conn.broker().dial(1), theirs)
    }

    fn forwarded(method: &str, pattern: &str, path: &str) -> HandleRequest {
        HandleRequest {
            request_id: RequestId::generate(),
            method: method.into(),
            path: pattern.into(),
            full_path: path.into(),
            headers: Headers::new(),
            body: Vec::new(),
            func_keys: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (host, _peer) = detached_host();
        let service = HandlerService::new(Arc::new(PluginState::default()), host);
        let resp = service.handle(forwarded("GET", "/missing", "/missing")).await;
        assert_eq!(resp.status, 404);
        assert!(resp.error.is_empty());
    }

    #[tokio::test]
    async fn test_handler_output_is_recorded() {
        let (host, _peer) = detached_host();
        let state = Arc::new(PluginState::default());
        state.add_route(
            "GET",
            "/name/{name}",
            handler(|req: Request, w: ResponseWriter| async move {
                w.set_header("X-Name", req.params.get("name").cloned().unwrap_or_default());
                w.write(format!("hello: {}", req.params["name"]).as_bytes());
                Ok(())
            }),
        );
        let service = HandlerService::new(state, host);

        let resp = service.handle(forwarded("get", "/name/{name}", "/name/foo?x=1")).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"hello: foo");
        assert_eq!(resp.headers.get("x-name"), Some("foo"));
    }

    #[tokio::test]
    async fn test_handler_errors_carry_status_and_drop_body() {
        let (host, _peer) = detached_host();
        let state = Arc::new(PluginState::default());
        state.add_route(
            "GET",
            "/teapot",
            handler(|_, w: ResponseWriter| async move {
                w.write(b"partial");
                Err(HttpError::with_message(418, "short and stout"))
            }),
        );
        state.add_route(
            "GET",
            "/broken",
            handler(|_, _| async { Err(HttpError::internal("boom")) }),
        );
        let service = HandlerService::new(state, host);

        let resp = service.handle(forwarded("GET", "/teapot", "/teapot")).await;
        assert_eq!((resp.status, resp.error.as_str()), (418, "short and stout"));
        assert!(resp.body.is_empty());

        let resp = service.handle(forwarded("GET", "/broken", "/broken")).await;
        assert_eq!((resp.status, resp.error.as_str()), (500, "boom"));
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle(&self, req: &mut Request, w: &ResponseWriter) -> Result<Flow, tether_core::HttpError> {
            if let Some(token) = req.headers.get("x-token").map(str::to_string) {
                req.set_value("token", token);
                return Ok(Flow::Next);
            }
            w.write_header(401);
            w.write(b"token required");
            Ok(Flow::Halt)
        }
    }

    #[tokio::test]
    async fn test_middleware_chain_records_halt() {
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Deny)];
        let req = MiddlewareRequest {
            request_id: RequestId::generate(),
            method: "GET".into(),
            path: "/".into(),
            headers: Headers::new(),
            body: Vec::new(),
        };
        let state = Arc::new(PluginState::default());
        let resp = run_middleware(&state, &chain, req.clone()).await;
        assert_eq!(resp.status, 401);
        assert_eq!(resp.body, b"token required");

        let mut allowed = req;
        allowed.headers.set("X-Token", "t");
        let resp = run_middleware(&state, &chain, allowed).await;
        assert_eq!(resp.status, 0);
        assert!(resp.body.is_empty());
    }

    #[tokio::test]
    async fn test_middleware_values_reach_the_handler_of_the_same_request() {
        let (host, _peer) = detached_host();
        let state = Arc::new(PluginState::default());
        state.add_route(
            "GET",
            "/private",
            handler(|req: Request, w: ResponseWriter| async move {
                let token = req.value("token").and_then(tether_core::Value::as_str).unwrap_or("none");
                w.write(format!("token: {token}").as_bytes());
                Ok(())
            }),
        );
        let service = HandlerService::new(Arc::clone(&state), host);

        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Deny)];
        let mut filtered = MiddlewareRequest {
            request_id: RequestId::generate(),
            method: "GET".into(),
            path: "/private".into(),
            headers: Headers::new(),
            body: Vec::new(),
        };
        filtered.headers.set("X-Token", "secret");
        run_middleware(&state, &chain, filtered.clone()).await;

        let mut forwarded = forwarded("GET", "/private", "/private");
        let other = service.handle(forwarded.clone()).await;
        assert_eq!(other.body, b"token: none");

        forwarded.request_id = filtered.request_id;
        let resp = service.handle(forwarded.clone()).await;
        assert_eq!(resp.body, b"token: secret");

        // Values are handed over once.
        let again = service.handle(forwarded).await;
        assert_eq!(again.body, b"token: none");
    }
}
