//! Method names and message bodies.
//!
//! Three kinds of service cross a connection:
//!
//! - the root service on channel 0 (plugin side), answering `dispense`
//! - the lifecycle service per dispensed plugin (plugin side), with
//!   unprefixed methods
//! - the two callback sets exchanged during `enable`: the host toolkit
//!   (`router.*`, `logger.*`, `site.*`, `renderer.*`, `funcs.*`) and the
//!   plugin callbacks (`handler.*`, `funcs.*`)

use serde::{Deserialize, Serialize};
use tether_core::{Grant, Headers, LogLevel, RequestId, Value, Vars, base64_bytes};

/// Root service method.
pub const DISPENSE: &str = "dispense";

/// Lifecycle service methods.
pub mod lifecycle {
    /// Plugin name.
    pub const NAME: &str = "name";
    /// Plugin version.
    pub const VERSION: &str = "version";
    /// Exchange callback channels and enable.
    pub const ENABLE: &str = "enable";
    /// Disable.
    pub const DISABLE: &str = "disable";
    /// Re-declare routes.
    pub const ROUTES: &str = "routes";
    /// Asset declarations and embedded files.
    pub const ASSETS: &str = "assets";
    /// Settings schema.
    pub const SETTINGS: &str = "settings";
    /// Requested grants.
    pub const GRANT_REQUESTS: &str = "grant_requests";
    /// Keys of the plugin's global function table.
    pub const FUNC_MAP: &str = "func_map";
    /// Number of middleware the plugin installs.
    pub const MIDDLEWARE_COUNT: &str = "middleware_count";
    /// Run the plugin's middleware against one request.
    pub const MIDDLEWARE: &str = "middleware";
}

/// Host toolkit methods, served by the host on the enable channel.
pub mod host {
    /// Prefix of router methods.
    pub const ROUTER: &str = "router";
    /// Prefix of logger methods.
    pub const LOGGER: &str = "logger";
    /// Prefix of secure-site methods.
    pub const SITE: &str = "site";
    /// Prefix of renderer methods.
    pub const RENDERER: &str = "renderer";
    /// Prefix of the host function table.
    pub const FUNCS: &str = "funcs";

    /// `router.handle`: declare a route.
    pub const ROUTER_HANDLE: &str = "router.handle";
    /// `router.param`: read a path parameter of the stored request.
    pub const ROUTER_PARAM: &str = "router.param";
    /// `router.error`: write an error page to the stored response.
    pub const ROUTER_ERROR: &str = "router.error";
    /// `logger.log`.
    pub const LOGGER_LOG: &str = "logger.log";
    /// `site.authorized`.
    pub const SITE_AUTHORIZED: &str = "site.authorized";
    /// `site.neighbor_plugin_grant_list`.
    pub const SITE_GRANT_LIST: &str = "site.neighbor_plugin_grant_list";
    /// `site.neighbor_plugin_granted`.
    pub const SITE_GRANTED: &str = "site.neighbor_plugin_granted";
    /// `site.set_neighbor_plugin_grant`.
    pub const SITE_SET_GRANT: &str = "site.set_neighbor_plugin_grant";
    /// `site.load_single_plugin_pages`.
    pub const SITE_LOAD_PAGES: &str = "site.load_single_plugin_pages";
    /// `site.user_login`.
    pub const SITE_USER_LOGIN: &str = "site.user_login";
    /// `site.authenticated_user`.
    pub const SITE_AUTHENTICATED_USER: &str = "site.authenticated_user";
    /// `site.title`.
    pub const SITE_TITLE: &str = "site.title";
    /// `renderer.render`.
    pub const RENDERER_RENDER: &str = "renderer.render";
    /// `funcs.do`.
    pub const FUNCS_DO: &str = super::FUNCS_DO;
}

/// Plugin callback methods, served by the plugin on the enable channel.
pub mod plugin {
    /// Prefix of the handler service.
    pub const HANDLER: &str = "handler";
    /// Prefix of the plugin function table.
    pub const FUNCS: &str = "funcs";
    /// `handler.handle`: run a declared route.
    pub const HANDLER_HANDLE: &str = "handler.handle";
    /// `funcs.do`.
    pub const FUNCS_DO: &str = super::FUNCS_DO;
}

/// Unprefixed method of a function table service.
pub const DO: &str = "do";

/// A function table call as seen from the peer, on either side.
pub const FUNCS_DO: &str = "funcs.do";

/// Ask for the lifecycle service of a named plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseRequest {
    /// Plugin name.
    pub name: String,
}

/// Where the dispensed lifecycle service lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseResponse {
    /// Plugin name.
    pub name: String,
    /// Plugin-side channel of its lifecycle service.
    pub channel: u32,
}

/// Enable, carrying the host toolkit channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableRequest {
    /// Host-side channel serving the toolkit.
    pub broker_id: u32,
}

/// Enable answer, carrying the plugin callback channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnableResponse {
    /// Plugin-side channel serving handlers and functions.
    pub broker_id: u32,
}

/// A request forwarded to a plugin handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRequest {
    /// Correlation id for nested calls.
    pub request_id: RequestId,
    /// Declared route method.
    pub method: String,
    /// Declared route pattern, used to find the handler.
    pub path: String,
    /// Actual request path, including the query.
    pub full_path: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Headers,
    /// Request body.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Keys of the host function table stored for this request.
    #[serde(default)]
    pub func_keys: Vec<String>,
}

/// What the plugin handler produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleResponse {
    /// Written status, 0 when none was written.
    pub status: u16,
    /// Handler error text, empty on success.
    #[serde(default)]
    pub error: String,
    /// Response body.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Response headers.
    #[serde(default)]
    pub headers: Headers,
}

/// Route declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// HTTP method.
    pub method: String,
    /// Path pattern.
    pub path: String,
}

/// Read a path parameter of a bridged request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Parameter name.
    pub name: String,
}

/// Write an error page for a bridged request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// Status to render.
    pub status: u16,
}

/// A log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRequest {
    /// Level.
    pub level: LogLevel,
    /// Text.
    pub message: String,
}

/// `site.authorized`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantQuery {
    /// Grant to check.
    pub grant: Grant,
}

/// `site.neighbor_plugin_grant_list` and `site.load_single_plugin_pages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginQuery {
    /// Neighbor plugin name.
    pub plugin: String,
}

/// `site.neighbor_plugin_granted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborGrantQuery {
    /// Neighbor plugin name.
    pub plugin: String,
    /// Grant to check.
    pub grant: Grant,
}

/// `site.set_neighbor_plugin_grant`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetNeighborGrant {
    /// Neighbor plugin name.
    pub plugin: String,
    /// Grant to change.
    pub grant: Grant,
    /// New state.
    pub granted: bool,
}

/// `site.user_login`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLoginRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// User to log in.
    pub username: String,
}

/// Requests that only name a bridged request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRef {
    /// Correlation id.
    pub request_id: RequestId,
}

/// What a render call renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderKind {
    /// A named template.
    Page {
        /// Template name.
        template: String,
    },
    /// Inline template content.
    Content {
        /// Template source.
        content: String,
    },
    /// An error page.
    Error {
        /// Template source.
        content: String,
        /// Status to write.
        status: u16,
    },
}

/// `renderer.render`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// What to render.
    #[serde(flatten)]
    pub kind: RenderKind,
    /// Keys of the plugin functions the template may call back.
    #[serde(default)]
    pub func_keys: Vec<String>,
    /// Template variables.
    #[serde(default)]
    pub vars: Vars,
}

/// Which function table a `do` call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuncScope {
    /// The table stored for one request.
    Request,
    /// The owner's global table.
    Global,
}

/// Call one function of a remote table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuncDoRequest {
    /// Request whose table to use. Ignored for [`FuncScope::Global`].
    pub request_id: RequestId,
    /// Function key.
    pub key: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Table selector.
    pub scope: FuncScope,
}

/// Result of a `do` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FuncDoResponse {
    /// Returned value, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Call failure text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Run the plugin's middleware against a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareRequest {
    /// Correlation id.
    pub request_id: RequestId,
    /// HTTP method.
    pub method: String,
    /// Full path.
    pub path: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Headers,
    /// Request body.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// What the middleware did. Status 0 means it wrote nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiddlewareResponse {
    /// Written status, 0 when none was written.
    pub status: u16,
    /// Middleware error text, empty on success.
    #[serde(default)]
    pub error: String,
    /// Response body.
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    /// Response headers.
    #[serde(default)]
    pub headers: Headers,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_request_body_is_base64() {
        let req = HandleRequest {
            request_id: RequestId::new("r1"),
            method: "POST".into(),
            path: "/form".into(),
            full_path: "/form?x=1".into(),
            headers: Headers::new(),
            body: b"a=b".to_vec(),
            func_keys: vec!["now".into()],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["body"], "YT1i");
        assert_eq!(json["request_id"], "r1");
    }

    #[test]
    fn test_render_kind_is_flattened() {
        let req = RenderRequest {
            request_id: RequestId::new("r1"),
            kind: RenderKind::Error {
                content: "oops".into(),
                status: 404,
            },
            func_keys: vec![],
            vars: Vars::new(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "error");
        assert_eq!(json["status"], 404);

        let back: RenderRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_handle_response_defaults() {
        let resp: HandleResponse = serde_json::from_str(r#"{"status": 0}"#).unwrap();
        assert_eq!(resp, HandleResponse::default());
    }
}
