//! Mock host services.
//!
//! Together they behave like a small site: [`MockRouter`] dispatches
//! requests through middleware and routes, [`MockRenderer`] expands
//! `{{name}}` variables and `{{call key}}` functions, and
//! [`MockPluginHost`] is the registry a [`Supervisor`](tether_host::Supervisor)
//! loads plugins into.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tether_core::{
    FuncMap, Grant, GrantRequest, Handler, HttpError, LogLevel, Logger, Middleware, Plugin, PluginResult,
    RecordedResponse, Renderer, Request, ResponseWriter, Router, SecureSite, Toolkit, Value, Vars, Flow,
    match_route, status_text,
};
use tether_host::PluginHost;

/// Captures plugin log lines.
#[derive(Debug, Default)]
pub struct MockLogger {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl MockLogger {
    /// Create an empty logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything logged so far.
    #[must_use]
    pub fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether any message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|(_, message)| message.contains(needle))
    }
}

impl Logger for MockLogger {
    fn log(&self, level: LogLevel, message: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((level, message.to_string()));
    }
}

struct Route {
    method: String,
    pattern: String,
    handler: Handler,
}

/// In-memory routing table with a middleware chain.
#[derive(Default)]
pub struct MockRouter {
    routes: RwLock<Vec<Route>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    errors: Mutex<Vec<u16>>,
}

impl MockRouter {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registered `(method, pattern)` pairs.
    #[must_use]
    pub fn routes(&self) -> Vec<(String, String)> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|r| (r.method.clone(), r.pattern.clone()))
            .collect()
    }

    /// Whether `method` `pattern` is registered.
    #[must_use]
    pub fn has_route(&self, method: &str, pattern: &str) -> bool {
        let method = method.to_ascii_uppercase();
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.method == method && r.pattern == pattern)
    }

    /// Install middleware in front of every route.
    pub fn push_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(middleware);
    }

    /// Remove all middleware.
    pub fn clear_middleware(&self) {
        self.middleware.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Statuses passed to [`Router::error`] so far.
    #[must_use]
    pub fn error_pages(&self) -> Vec<u16> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn find(&self, method: &str, path: &str) -> Option<(Handler, BTreeMap<String, String>)> {
        let method = method.to_ascii_uppercase();
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.method == method)
            .find_map(|r| match_route(&r.pattern, path).map(|params| (Arc::clone(&r.handler), params)))
    }

    /// Serve one request and return what was written.
    pub async fn dispatch(&self, mut req: Request) -> RecordedResponse {
        let w = ResponseWriter::new();
        let chain = self.middleware.read().unwrap_or_else(PoisonError::into_inner).clone();
        for step in chain {
            match step.handle(&mut req, &w).await {
                Ok(Flow::Next) => {},
                Ok(Flow::Halt) => return w.snapshot(),
                Err(e) => {
                    write_error(&w, &e);
                    return w.snapshot();
                },
            }
        }

        let Some((handler, params)) = self.find(&req.method, req.path_only()) else {
            write_error(&w, &HttpError::status(404));
            return w.snapshot();
        };
        req.params = params;
        if let Err(e) = handler(req, w.clone()).await {
            write_error(&w, &e);
        }
        w.snapshot()
    }
}

fn write_error(w: &ResponseWriter, e: &HttpError) {
    w.write_header(e.code());
    w.write(e.to_string().as_bytes());
}

impl std::fmt::Debug for MockRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRouter")
            .field("routes", &self.routes())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Router for MockRouter {
    async fn handle(&self, method: &str, path: &str, handler: Handler) {
        let method = method.to_ascii_uppercase();
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        routes.retain(|r| !(r.method == method && r.pattern == path));
        routes.push(Route {
            method,
            pattern: path.to_string(),
            handler,
        });
    }

    async fn remove(&self, method: &str, path: &str) {
        let method = method.to_ascii_uppercase();
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|r| !(r.method == method && r.pattern == path));
    }

    async fn param(&self, req: &Request, name: &str) -> String {
        req.params.get(name).cloned().unwrap_or_default()
    }

    async fn error(&self, status: u16, w: &ResponseWriter, _req: &Request) {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner).push(status);
        w.write_header(status);
        w.write(format!("{status} {}", status_text(status)).as_bytes());
    }
}

/// Site access backed by in-memory grant tables.
#[derive(Debug)]
pub struct MockSecureSite {
    title: String,
    granted: Mutex<HashSet<Grant>>,
    neighbors: Mutex<HashMap<String, Vec<GrantRequest>>>,
    neighbor_grants: Mutex<HashMap<(String, Grant), bool>>,
    logins: Mutex<Vec<String>>,
    page_loads: Mutex<Vec<String>>,
}

impl Default for MockSecureSite {
    fn default() -> Self {
        Self {
            title: "Test Site".to_string(),
            granted: Mutex::default(),
            neighbors: Mutex::default(),
            neighbor_grants: Mutex::default(),
            logins: Mutex::default(),
            page_loads: Mutex::default(),
        }
    }
}

impl MockSecureSite {
    /// Create a site titled "Test Site" with no grants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the site title.
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Grant the calling plugin `grant`.
    #[must_use]
    pub fn with_grant(self, grant: &str) -> Self {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(Grant::new(grant));
        self
    }

    /// Register another plugin and the grants it asks for.
    #[must_use]
    pub fn with_neighbor(self, plugin: &str, requests: Vec<GrantRequest>) -> Self {
        self.neighbors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.to_string(), requests);
        self
    }

    /// Usernames logged in so far.
    #[must_use]
    pub fn logins(&self) -> Vec<String> {
        self.logins.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Plugins whose pages were reloaded.
    #[must_use]
    pub fn page_loads(&self) -> Vec<String> {
        self.page_loads.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn neighbor_exists(&self, plugin: &str) -> Result<(), HttpError> {
        if self
            .neighbors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(plugin)
        {
            Ok(())
        } else {
            Err(HttpError::with_message(404, format!("plugin not found: {plugin}")))
        }
    }
}

#[async_trait]
impl SecureSite for MockSecureSite {
    async fn authorized(&self, grant: &Grant) -> bool {
        self.granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(grant)
    }

    async fn neighbor_plugin_grant_list(&self, plugin: &str) -> Result<Vec<GrantRequest>, HttpError> {
        self.neighbors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(plugin)
            .cloned()
            .ok_or_else(|| HttpError::with_message(404, format!("plugin not found: {plugin}")))
    }

    async fn neighbor_plugin_granted(&self, plugin: &str, grant: &Grant) -> Result<bool, HttpError> {
        self.neighbor_exists(plugin)?;
        Ok(self
            .neighbor_grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(plugin.to_string(), grant.clone()))
            .copied()
            .unwrap_or(false))
    }

    async fn set_neighbor_plugin_grant(&self, plugin: &str, grant: &Grant, granted: bool) -> Result<(), HttpError> {
        self.neighbor_exists(plugin)?;
        self.neighbor_grants
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((plugin.to_string(), grant.clone()), granted);
        Ok(())
    }

    async fn load_single_plugin_pages(&self, plugin: &str) -> Result<(), HttpError> {
        self.page_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plugin.to_string());
        Ok(())
    }

    async fn user_login(&self, _req: &Request, username: &str) -> Result<(), HttpError> {
        self.logins
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(username.to_string());
        Ok(())
    }

    async fn authenticated_user(&self, req: &Request) -> Result<String, HttpError> {
        req.headers
            .get("x-user")
            .map(str::to_string)
            .ok_or_else(|| HttpError::status(401))
    }

    async fn title(&self) -> Result<String, HttpError> {
        Ok(self.title.clone())
    }
}

/// Renders `{{name}}` from vars and `{{call key}}` through the function
/// table.
#[derive(Debug, Default)]
pub struct MockRenderer {
    templates: HashMap<String, String>,
}

impl MockRenderer {
    /// Create a renderer with no named templates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named template.
    #[must_use]
    pub fn with_template(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.templates.insert(name.into(), content.into());
        self
    }

    /// Expand `content`.
    ///
    /// # Errors
    ///
    /// Fails on an unterminated tag or when a called function fails.
    pub async fn expand(&self, content: &str, funcs: &FuncMap, vars: &Vars) -> Result<String, HttpError> {
        let mut out = String::with_capacity(content.len());
        let mut rest = content;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start.saturating_add(2)..];
            let end = after
                .find("}}")
                .ok_or_else(|| HttpError::internal("unterminated template tag"))?;
            let tag = after[..end].trim();
            if let Some(key) = tag.strip_prefix("call ") {
                let returned = funcs
                    .call(key.trim(), Vec::new())
                    .await
                    .map_err(|e| HttpError::internal(e.to_string()))?;
                out.push_str(&display(returned.as_ref().unwrap_or(&Value::Null)));
            } else if let Some(value) = vars.get(tag) {
                out.push_str(&display(value));
            }
            rest = &after[end.saturating_add(2)..];
        }
        out.push_str(rest);
        Ok(out)
    }

    async fn write(
        &self,
        w: &ResponseWriter,
        content: &str,
        funcs: &FuncMap,
        vars: &Vars,
    ) -> Result<(), HttpError> {
        let rendered = self.expand(content, funcs, vars).await?;
        w.set_header("Content-Type", "text/html; charset=utf-8");
        w.write(rendered.as_bytes());
        Ok(())
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_json().to_string(),
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    async fn page(
        &self,
        w: &ResponseWriter,
        _req: &Request,
        template: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        let content = self
            .templates
            .get(template)
            .ok_or_else(|| HttpError::internal(format!("template not found: {template}")))?;
        self.write(w, content, &funcs, &vars).await
    }

    async fn page_content(
        &self,
        w: &ResponseWriter,
        _req: &Request,
        content: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        self.write(w, content, &funcs, &vars).await
    }

    async fn error(
        &self,
        w: &ResponseWriter,
        _req: &Request,
        content: &str,
        status: u16,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError> {
        w.write_header(status);
        self.write(w, content, &funcs, &vars).await
    }
}

/// The concrete mocks behind one [`Toolkit`].
#[derive(Debug, Clone)]
pub struct MockToolkit {
    /// Logger.
    pub log: Arc<MockLogger>,
    /// Router.
    pub router: Arc<MockRouter>,
    /// Site access.
    pub site: Arc<MockSecureSite>,
    /// Renderer.
    pub render: Arc<MockRenderer>,
}

impl Default for MockToolkit {
    fn default() -> Self {
        Self::new(MockSecureSite::new(), MockRenderer::new())
    }
}

impl MockToolkit {
    /// Toolkit over `site` and `render` with a fresh logger and router.
    #[must_use]
    pub fn new(site: MockSecureSite, render: MockRenderer) -> Self {
        Self {
            log: Arc::new(MockLogger::new()),
            router: Arc::new(MockRouter::new()),
            site: Arc::new(site),
            render: Arc::new(render),
        }
    }

    /// The toolkit handed to plugins.
    #[must_use]
    pub fn toolkit(&self) -> Toolkit {
        Toolkit {
            log: Arc::clone(&self.log) as Arc<dyn Logger>,
            mux: Arc::clone(&self.router) as Arc<dyn Router>,
            site: Arc::clone(&self.site) as Arc<dyn SecureSite>,
            render: Arc::clone(&self.render) as Arc<dyn Renderer>,
        }
    }
}

struct Registered {
    plugin: Arc<dyn Plugin>,
    enabled: bool,
}

/// Plugin registry over a [`MockToolkit`].
pub struct MockPluginHost {
    mocks: MockToolkit,
    plugins: RwLock<HashMap<String, Registered>>,
    page_loads: Mutex<Vec<String>>,
}

impl MockPluginHost {
    /// Registry handing `mocks` to every plugin it loads.
    #[must_use]
    pub fn new(mocks: MockToolkit) -> Self {
        Self {
            mocks,
            plugins: RwLock::default(),
            page_loads: Mutex::default(),
        }
    }

    /// The mocks plugins are bound to.
    #[must_use]
    pub fn mocks(&self) -> &MockToolkit {
        &self.mocks
    }

    /// Whether `name` is registered and enabled.
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(|r| r.enabled)
    }

    /// Plugins whose pages were reloaded, in order.
    #[must_use]
    pub fn page_loads(&self) -> Vec<String> {
        self.page_loads.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl std::fmt::Debug for MockPluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("MockPluginHost")
            .field("plugins", &names)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl PluginHost for MockPluginHost {
    async fn load_plugin(&self, plugin: Arc<dyn Plugin>, middleware: bool) -> PluginResult<()> {
        plugin.enable(self.mocks.toolkit()).await?;
        plugin.routes().await?;
        if middleware {
            for step in plugin.middleware().await? {
                self.mocks.router.push_middleware(step);
            }
        }
        self.plugins.write().unwrap_or_else(PoisonError::into_inner).insert(
            plugin.name().to_string(),
            Registered {
                plugin,
                enabled: true,
            },
        );
        Ok(())
    }

    async fn set_enabled(&self, name: &str, enabled: bool) {
        if let Some(registered) = self
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(name)
        {
            registered.enabled = enabled;
        }
        if !enabled {
            self.mocks.router.clear_middleware();
        }
    }

    fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|r| Arc::clone(&r.plugin))
    }

    async fn load_single_plugin_pages(&self, name: &str) -> PluginResult<()> {
        self.page_loads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tether_core::handler;

    use super::*;

    #[tokio::test]
    async fn test_router_dispatches_with_params() {
        let router = MockRouter::new();
        router
            .handle(
                "get",
                "/name/{name}",
                handler(|req: Request, w: ResponseWriter| async move {
                    w.write(format!("hi {}", req.params["name"]).as_bytes());
                    Ok(())
                }),
            )
            .await;

        let resp = router.dispatch(Request::new("GET", "/name/ann?x=1")).await;
        assert_eq!(resp.status_or_ok(), 200);
        assert_eq!(resp.body_text(), "hi ann");

        let resp = router.dispatch(Request::new("GET", "/nope")).await;
        assert_eq!(resp.status, Some(404));

        router.remove("GET", "/name/{name}").await;
        assert!(router.routes().is_empty());
    }

    #[tokio::test]
    async fn test_renderer_expands_vars_and_calls() {
        let renderer = MockRenderer::new();
        let funcs = FuncMap::new().with_fn("twelve", || 12i64);
        let mut vars = Vars::new();
        vars.insert("name".into(), Value::from("ann"));

        let out = renderer
            .expand("Hi {{name}}, {{call twelve}}{{missing}}!", &funcs, &vars)
            .await
            .unwrap();
        assert_eq!(out, "Hi ann, 12!");
        assert!(renderer.expand("{{oops", &funcs, &vars).await.is_err());
    }

    #[tokio::test]
    async fn test_site_neighbor_grants() {
        let site = MockSecureSite::new().with_neighbor("other", vec![GrantRequest::new("a:read", "why")]);
        let grant = Grant::new("a:read");
        assert!(!site.neighbor_plugin_granted("other", &grant).await.unwrap());
        site.set_neighbor_plugin_grant("other", &grant, true).await.unwrap();
        assert!(site.neighbor_plugin_granted("other", &grant).await.unwrap());
        assert_eq!(site.neighbor_plugin_grant_list("ghost").await.unwrap_err().code(), 404);
    }
}
