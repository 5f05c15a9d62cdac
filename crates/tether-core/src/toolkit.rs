//! Host services available to an enabled plugin.
//!
//! An in-process plugin receives the host's real implementations. An
//! out-of-process plugin receives RPC proxies with the same traits, so
//! plugin code is identical in both cases.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::HttpError;
use crate::funcs::FuncMap;
use crate::http::{Request, ResponseWriter};
use crate::plugin::{Grant, GrantRequest};
use crate::value::Value;

/// Template variables.
pub type Vars = BTreeMap<String, Value>;

/// Future returned by a route handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HttpError>>;

/// A route handler.
pub type Handler = Arc<dyn Fn(Request, ResponseWriter) -> HandlerFuture + Send + Sync>;

/// Box an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request, ResponseWriter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HttpError>> + Send + 'static,
{
    Arc::new(move |req, w| Box::pin(f(req, w)))
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// Plugin logging sink.
pub trait Logger: Send + Sync {
    /// Record a message.
    fn log(&self, level: LogLevel, message: &str);

    /// Record at debug level.
    fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message);
    }

    /// Record at info level.
    fn info(&self, message: &str) {
        self.log(LogLevel::Info, message);
    }

    /// Record at warn level.
    fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message);
    }

    /// Record at error level.
    fn error(&self, message: &str) {
        self.log(LogLevel::Error, message);
    }
}

/// The HTTP routing table.
#[async_trait]
pub trait Router: Send + Sync {
    /// Register `handler` for `method` and `path`. Path segments of the form
    /// `{name}` are parameters.
    async fn handle(&self, method: &str, path: &str, handler: Handler);

    /// Remove the route for `method` and `path`.
    async fn remove(&self, method: &str, path: &str);

    /// Value of a path parameter of `req`, or empty.
    async fn param(&self, req: &Request, name: &str) -> String;

    /// Answer `req` with the site's error page for `status`.
    async fn error(&self, status: u16, w: &ResponseWriter, req: &Request);
}

/// Grant-checked access to site data.
///
/// Decisions are made by the host; this is only the calling surface.
#[async_trait]
pub trait SecureSite: Send + Sync {
    /// Whether the calling plugin holds `grant`.
    async fn authorized(&self, grant: &Grant) -> bool;

    /// Grants requested by another plugin.
    async fn neighbor_plugin_grant_list(&self, plugin: &str) -> Result<Vec<GrantRequest>, HttpError>;

    /// Whether another plugin holds `grant`.
    async fn neighbor_plugin_granted(&self, plugin: &str, grant: &Grant) -> Result<bool, HttpError>;

    /// Approve or revoke a grant for another plugin.
    async fn set_neighbor_plugin_grant(
        &self,
        plugin: &str,
        grant: &Grant,
        granted: bool,
    ) -> Result<(), HttpError>;

    /// Re-enable a plugin and reload its routes.
    async fn load_single_plugin_pages(&self, plugin: &str) -> Result<(), HttpError>;

    /// Start a session for `username` on the response of `req`.
    async fn user_login(&self, req: &Request, username: &str) -> Result<(), HttpError>;

    /// Username of the session on `req`.
    async fn authenticated_user(&self, req: &Request) -> Result<String, HttpError>;

    /// Site title.
    async fn title(&self) -> Result<String, HttpError>;
}

/// Page rendering.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render a named template into `w`.
    async fn page(
        &self,
        w: &ResponseWriter,
        req: &Request,
        template: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError>;

    /// Render inline template content into `w`.
    async fn page_content(
        &self,
        w: &ResponseWriter,
        req: &Request,
        content: &str,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError>;

    /// Render an error page with `status`.
    async fn error(
        &self,
        w: &ResponseWriter,
        req: &Request,
        content: &str,
        status: u16,
        funcs: FuncMap,
        vars: Vars,
    ) -> Result<(), HttpError>;
}

/// Host services handed to a plugin at enable time.
#[derive(Clone)]
pub struct Toolkit {
    /// Logging.
    pub log: Arc<dyn Logger>,
    /// Routing.
    pub mux: Arc<dyn Router>,
    /// Grant-checked site access.
    pub site: Arc<dyn SecureSite>,
    /// Rendering.
    pub render: Arc<dyn Renderer>,
}

impl fmt::Debug for Toolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Toolkit").finish_non_exhaustive()
    }
}
