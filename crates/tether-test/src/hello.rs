//! The reference plugin used by the end-to-end tests.
//!
//! Every route exercises one part of the bridge:
//!
//! | Route | Exercises |
//! |---|---|
//! | `GET /` | plain forwarding |
//! | `GET /name/{name}` | path parameters |
//! | `GET /param/{name}` | nested `router.param` |
//! | `POST /form` | request bodies |
//! | `GET /headers` | status and headers |
//! | `GET /status` | status-carrying errors |
//! | `GET /fail` | errors without a status |
//! | `GET /error` | nested `router.error` writing the real response |
//! | `GET /funcs/{name}` | calling host functions |
//! | `GET /render` | rendering with plugin functions |
//! | `GET /title`, `GET /whoami`, `POST /login/{user}`, `GET /authorized` | site calls |
//! | `GET /private/token` | values set by plugin middleware |
//! | `GET /slow?ms=N` | call timeouts |
//! | `GET /crash` | process death (only with [`HelloPlugin::with_crash_route`]) |

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tether_core::{
    Asset, Assets, EmbeddedFile, Flow, FuncMap, Grant, GrantRequest, HttpError, Middleware, Plugin, PluginError,
    PluginResult, Request, ResponseWriter, Setting, SettingType, Toolkit, Value, Vars, handler,
};

/// Name the plugin registers under.
pub const HELLO_PLUGIN: &str = "hello";

/// Version the plugin reports.
pub const HELLO_VERSION: &str = "1.0.0";

/// A small plugin answering greetings.
#[derive(Debug, Default)]
pub struct HelloPlugin {
    toolkit: RwLock<Option<Toolkit>>,
    crash_route: bool,
}

impl HelloPlugin {
    /// Create the plugin.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Also serve `GET /crash`, which exits the process.
    #[must_use]
    pub fn with_crash_route(mut self) -> Self {
        self.crash_route = true;
        self
    }

    fn toolkit(&self) -> PluginResult<Toolkit> {
        self.toolkit
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| PluginError::NotEnabled(HELLO_PLUGIN.to_string()))
    }
}

fn crash() -> Result<(), HttpError> {
    tracing::warn!("Crash requested; exiting");
    std::process::exit(3)
}

fn text(w: &ResponseWriter, body: impl AsRef<str>) {
    w.write(body.as_ref().as_bytes());
}

#[async_trait]
impl Plugin for HelloPlugin {
    fn name(&self) -> &str {
        HELLO_PLUGIN
    }

    async fn version(&self) -> PluginResult<String> {
        Ok(HELLO_VERSION.to_string())
    }

    async fn enable(&self, toolkit: Toolkit) -> PluginResult<()> {
        toolkit.log.info("hello plugin enabled");
        *self.toolkit.write().unwrap_or_else(PoisonError::into_inner) = Some(toolkit);
        Ok(())
    }

    async fn disable(&self) -> PluginResult<()> {
        if let Some(toolkit) = self.toolkit.write().unwrap_or_else(PoisonError::into_inner).take() {
            toolkit.log.info("hello plugin disabled");
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    async fn routes(&self) -> PluginResult<()> {
        let toolkit = self.toolkit()?;
        let mux = Arc::clone(&toolkit.mux);

        mux.handle(
            "GET",
            "/",
            handler(|_, w: ResponseWriter| async move {
                text(&w, "hello world");
                Ok(())
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/name/{name}",
            handler(|req: Request, w: ResponseWriter| async move {
                let name = req.params.get("name").cloned().unwrap_or_default();
                text(&w, format!("hello: {name}"));
                Ok(())
            }),
        )
        .await;

        let router = Arc::clone(&toolkit.mux);
        mux.handle(
            "GET",
            "/param/{name}",
            handler(move |req: Request, w: ResponseWriter| {
                let router = Arc::clone(&router);
                async move {
                    let name = router.param(&req, "name").await;
                    text(&w, format!("param: {name}"));
                    Ok(())
                }
            }),
        )
        .await;

        mux.handle(
            "POST",
            "/form",
            handler(|req: Request, w: ResponseWriter| async move {
                text(&w, format!("got: {}", String::from_utf8_lossy(&req.body)));
                Ok(())
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/headers",
            handler(|_, w: ResponseWriter| async move {
                w.set_header("X-Hello", "world");
                w.write_header(201);
                text(&w, "created");
                Ok(())
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/status",
            handler(|_, _| async { Err(HttpError::with_message(418, "I'm a teapot")) }),
        )
        .await;

        mux.handle(
            "GET",
            "/fail",
            handler(|_, _| async { Err(HttpError::internal("hello failed")) }),
        )
        .await;

        let router = Arc::clone(&toolkit.mux);
        mux.handle(
            "GET",
            "/error",
            handler(move |req: Request, w: ResponseWriter| {
                let router = Arc::clone(&router);
                async move {
                    router.error(404, &w, &req).await;
                    Ok(())
                }
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/funcs/{name}",
            handler(|req: Request, w: ResponseWriter| async move {
                let name = req.params.get("name").cloned().unwrap_or_default();
                let returned = req
                    .funcs()
                    .call(&name, Vec::new())
                    .await
                    .map_err(|e| HttpError::internal(e.to_string()))?;
                let shown = returned
                    .as_ref()
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_default();
                text(&w, shown);
                Ok::<(), HttpError>(())
            }),
        )
        .await;

        let render = Arc::clone(&toolkit.render);
        mux.handle(
            "GET",
            "/render",
            handler(move |req: Request, w: ResponseWriter| {
                let render = Arc::clone(&render);
                async move {
                    let mut vars = Vars::new();
                    vars.insert("name".into(), Value::from("hello"));
                    let funcs = FuncMap::new().with_fn("one_two", || "12");
                    render
                        .page_content(&w, &req, "Hi {{name}} {{call one_two}}", funcs, vars)
                        .await
                }
            }),
        )
        .await;

        let site = Arc::clone(&toolkit.site);
        mux.handle(
            "GET",
            "/title",
            handler(move |_, w: ResponseWriter| {
                let site = Arc::clone(&site);
                async move {
                    text(&w, site.title().await?);
                    Ok::<(), HttpError>(())
                }
            }),
        )
        .await;

        let site = Arc::clone(&toolkit.site);
        mux.handle(
            "GET",
            "/whoami",
            handler(move |req: Request, w: ResponseWriter| {
                let site = Arc::clone(&site);
                async move {
                    text(&w, site.authenticated_user(&req).await?);
                    Ok::<(), HttpError>(())
                }
            }),
        )
        .await;

        let site = Arc::clone(&toolkit.site);
        mux.handle(
            "POST",
            "/login/{user}",
            handler(move |req: Request, w: ResponseWriter| {
                let site = Arc::clone(&site);
                async move {
                    let user = req.params.get("user").cloned().unwrap_or_default();
                    site.user_login(&req, &user).await?;
                    w.write_header(204);
                    Ok::<(), HttpError>(())
                }
            }),
        )
        .await;

        let site = Arc::clone(&toolkit.site);
        mux.handle(
            "GET",
            "/authorized",
            handler(move |req: Request, w: ResponseWriter| {
                let site = Arc::clone(&site);
                async move {
                    let grant = Grant::new(req.query("grant").unwrap_or("site.title:read"));
                    text(&w, site.authorized(&grant).await.to_string());
                    Ok(())
                }
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/private/token",
            handler(|req: Request, w: ResponseWriter| async move {
                let token = req.value("token").and_then(Value::as_str).unwrap_or("none");
                text(&w, format!("token: {token}"));
                Ok(())
            }),
        )
        .await;

        mux.handle(
            "GET",
            "/slow",
            handler(|req: Request, w: ResponseWriter| async move {
                let ms = req.query("ms").and_then(|v| v.parse().ok()).unwrap_or(500);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                text(&w, "slow");
                Ok(())
            }),
        )
        .await;

        if self.crash_route {
            mux.handle(
                "GET",
                "/crash",
                handler(|_, _| async { crash() }),
            )
            .await;
        }

        toolkit.log.debug("hello routes declared");
        Ok(())
    }

    async fn assets(&self) -> PluginResult<Assets> {
        Ok(Assets {
            assets: vec![Asset {
                path: "hello.css".to_string(),
                filetype: "stylesheet".to_string(),
                location: "head".to_string(),
                inline: true,
            }],
            files: vec![EmbeddedFile {
                name: "hello.css".to_string(),
                content: b".hello { color: teal; }".to_vec(),
            }],
        })
    }

    async fn settings(&self) -> PluginResult<Vec<Setting>> {
        Ok(vec![
            Setting::new("greeting")
                .with_description("Word used to greet visitors")
                .with_default("hello"),
            Setting::new("api_key").with_kind(SettingType::Password),
        ])
    }

    async fn grant_requests(&self) -> PluginResult<Vec<GrantRequest>> {
        Ok(vec![GrantRequest::new("site.title:read", "Show the site title in greetings")])
    }

    async fn middleware(&self) -> PluginResult<Vec<Arc<dyn Middleware>>> {
        Ok(vec![Arc::new(PrivateGate)])
    }

    fn func_map(&self, _req: &Request) -> FuncMap {
        FuncMap::new()
            .with_fn("one_two", || "12")
            .with_fn("greet", |name: String| format!("hello {name}"))
    }
}

/// Guards `/private` paths behind an `X-Token` header, hands the token on to
/// handlers and tags everything it lets through.
#[derive(Debug)]
struct PrivateGate;

#[async_trait]
impl Middleware for PrivateGate {
    async fn handle(&self, req: &mut Request, w: &ResponseWriter) -> Result<Flow, HttpError> {
        if let Some(token) = req.headers.get("x-token").map(str::to_string) {
            req.set_value("token", token);
        } else if req.path_only().starts_with("/private") {
            w.write_header(401);
            text(w, "token required");
            return Ok(Flow::Halt);
        }
        w.set_header("X-Seen-By", HELLO_PLUGIN);
        Ok(Flow::Next)
    }
}
