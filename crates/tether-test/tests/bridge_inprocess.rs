//! The full plugin contract over an in-memory pipe.
//!
//! The host side is a [`RemotePlugin`](tether_host::RemotePlugin) bound to
//! mock services; the plugin side is the SDK serving [`HelloPlugin`].

use std::sync::Arc;
use std::time::Duration;

use tether_core::{FuncMap, Plugin, Request, Value};
use tether_host::AdapterOptions;
use tether_test::{
    HELLO_PLUGIN, HELLO_VERSION, HelloPlugin, InProcessPlugin, MockRenderer, MockSecureSite, MockToolkit,
    setup_test_logging_default,
};

async fn enabled(options: AdapterOptions) -> (InProcessPlugin, MockToolkit) {
    setup_test_logging_default();
    let mocks = MockToolkit::new(
        MockSecureSite::new()
            .with_title("Tether Site")
            .with_grant("site.title:read"),
        MockRenderer::new(),
    );
    let hello = InProcessPlugin::connect(Arc::new(HelloPlugin::new()), options)
        .await
        .unwrap();
    hello.remote.enable(mocks.toolkit()).await.unwrap();
    hello.remote.routes().await.unwrap();
    (hello, mocks)
}

async fn get(mocks: &MockToolkit, path: &str) -> tether_core::RecordedResponse {
    mocks.router.dispatch(Request::new("GET", path)).await
}

#[tokio::test]
async fn test_metadata_crosses_the_bridge() {
    let (hello, _mocks) = enabled(AdapterOptions::default()).await;
    let remote = &hello.remote;

    assert_eq!(remote.name(), HELLO_PLUGIN);
    assert_eq!(remote.version().await.unwrap(), HELLO_VERSION);

    let settings = remote.settings().await.unwrap();
    assert_eq!(settings.len(), 2);
    assert_eq!(settings[0].default, "hello");

    let grants = remote.grant_requests().await.unwrap();
    assert_eq!(grants[0].grant.as_str(), "site.title:read");

    let assets = remote.assets().await.unwrap();
    assert_eq!(assets.assets[0].path, "hello.css");
    assert_eq!(assets.files[0].content, b".hello { color: teal; }");
}

#[tokio::test]
async fn test_declared_routes_are_forwarded() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;
    assert!(mocks.router.has_route("GET", "/name/{name}"));
    assert!(!mocks.router.has_route("GET", "/crash"));

    let resp = get(&mocks, "/").await;
    assert_eq!(resp.status_or_ok(), 200);
    assert_eq!(resp.body_text(), "hello world");

    let resp = get(&mocks, "/name/ann?greet=1").await;
    assert_eq!(resp.body_text(), "hello: ann");

    let resp = mocks
        .router
        .dispatch(Request::new("POST", "/form").with_body("a=1"))
        .await;
    assert_eq!(resp.body_text(), "got: a=1");

    let resp = get(&mocks, "/headers").await;
    assert_eq!(resp.status, Some(201));
    assert_eq!(resp.headers.get("x-hello"), Some("world"));
    assert_eq!(resp.body_text(), "created");
}

#[tokio::test]
async fn test_handler_errors_keep_their_status() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;

    let resp = get(&mocks, "/status").await;
    assert_eq!(resp.status, Some(418));
    assert_eq!(resp.body_text(), "I'm a teapot");

    let resp = get(&mocks, "/fail").await;
    assert_eq!(resp.status, Some(500));
    assert_eq!(resp.body_text(), "hello failed");
}

#[tokio::test]
async fn test_nested_router_calls_reach_the_live_request() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;

    let resp = get(&mocks, "/param/bob").await;
    assert_eq!(resp.body_text(), "param: bob");

    // The host error page is written straight onto the real response.
    let resp = get(&mocks, "/error").await;
    assert_eq!(resp.status, Some(404));
    assert_eq!(resp.body_text(), "404 Not Found");
    assert_eq!(mocks.router.error_pages(), vec![404]);
}

#[tokio::test]
async fn test_site_calls() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;

    assert_eq!(get(&mocks, "/title").await.body_text(), "Tether Site");
    assert_eq!(get(&mocks, "/authorized").await.body_text(), "true");
    assert_eq!(get(&mocks, "/authorized?grant=site.users:write").await.body_text(), "false");

    let resp = mocks
        .router
        .dispatch(Request::new("GET", "/whoami").with_header("X-User", "ann"))
        .await;
    assert_eq!(resp.body_text(), "ann");
    assert_eq!(get(&mocks, "/whoami").await.status, Some(401));

    let resp = mocks.router.dispatch(Request::new("POST", "/login/ann")).await;
    assert_eq!(resp.status, Some(204));
    assert_eq!(mocks.site.logins(), vec!["ann"]);
}

#[tokio::test]
async fn test_handlers_call_host_functions() {
    let options = AdapterOptions::default().with_funcs(|req: &Request| {
        let path = req.path_only().to_string();
        FuncMap::new()
            .with_fn("host_name", || "mock host")
            .with_fn("request_path", move || path.clone())
    });
    let (hello, mocks) = enabled(options).await;

    assert_eq!(get(&mocks, "/funcs/host_name").await.body_text(), "mock host");
    assert_eq!(get(&mocks, "/funcs/request_path").await.body_text(), "/funcs/request_path");
    assert_eq!(get(&mocks, "/funcs/missing").await.status, Some(500));

    // Contexts of finished requests do not linger.
    assert!(hello.correlator.is_empty());
}

#[tokio::test]
async fn test_render_calls_back_into_plugin_functions() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;

    let resp = get(&mocks, "/render").await;
    assert_eq!(resp.status_or_ok(), 200);
    assert_eq!(resp.body_text(), "Hi hello 12");
    assert_eq!(resp.headers.get("content-type"), Some("text/html; charset=utf-8"));
}

#[tokio::test]
async fn test_plugin_function_table() {
    let (hello, _mocks) = enabled(AdapterOptions::default()).await;

    let funcs = hello.remote.func_map(&Request::default());
    let mut keys = funcs.keys();
    keys.sort();
    assert_eq!(keys, vec!["greet", "one_two"]);

    let greeting = funcs.call("greet", vec![Value::from("ann")]).await.unwrap();
    assert_eq!(greeting, Some(Value::from("hello ann")));
    assert!(funcs.call("greet", Vec::new()).await.is_err());
}

#[tokio::test]
async fn test_plugin_middleware_runs_in_host_chain() {
    let (hello, mocks) = enabled(AdapterOptions::default()).await;
    let chain = hello.remote.middleware().await.unwrap();
    assert_eq!(chain.len(), 1);
    for step in chain {
        mocks.router.push_middleware(step);
    }

    let resp = get(&mocks, "/private/data").await;
    assert_eq!(resp.status, Some(401));
    assert_eq!(resp.body_text(), "token required");

    let resp = get(&mocks, "/").await;
    assert_eq!(resp.body_text(), "hello world");
    assert_eq!(resp.headers.get("x-seen-by"), Some(HELLO_PLUGIN));

    let resp = mocks
        .router
        .dispatch(Request::new("GET", "/private/data").with_header("X-Token", "t"))
        .await;
    assert_eq!(resp.status, Some(404));
}

#[tokio::test]
async fn test_middleware_values_reach_the_plugin_handler() {
    let (hello, mocks) = enabled(AdapterOptions::default()).await;
    for step in hello.remote.middleware().await.unwrap() {
        mocks.router.push_middleware(step);
    }

    let resp = mocks
        .router
        .dispatch(Request::new("GET", "/private/token").with_header("X-Token", "t"))
        .await;
    assert_eq!(resp.status_or_ok(), 200);
    assert_eq!(resp.body_text(), "token: t");

    // Without the middleware in the chain the handler sees nothing.
    mocks.router.clear_middleware();
    let resp = get(&mocks, "/private/token").await;
    assert_eq!(resp.body_text(), "token: none");
    assert!(hello.correlator.is_empty());
}

#[tokio::test]
async fn test_slow_handler_times_out() {
    let options = AdapterOptions::default().with_call_timeout(Some(Duration::from_millis(100)));
    let (_hello, mocks) = enabled(options).await;

    let resp = get(&mocks, "/slow?ms=2000").await;
    assert_eq!(resp.status, Some(504));

    let resp = get(&mocks, "/slow?ms=1").await;
    assert_eq!(resp.body_text(), "slow");
}

#[tokio::test]
async fn test_plugin_logs_reach_the_host_logger() {
    let (_hello, mocks) = enabled(AdapterOptions::default()).await;

    // Log lines are forwarded in the background.
    for _ in 0..100 {
        if mocks.log.contains("hello routes declared") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(mocks.log.contains("hello plugin enabled"));
    assert!(mocks.log.contains("hello routes declared"));
}

#[tokio::test]
async fn test_disable_and_reenable() {
    let (hello, mocks) = enabled(AdapterOptions::default()).await;

    hello.remote.disable().await.unwrap();
    assert!(mocks.router.routes().is_empty());
    assert_eq!(get(&mocks, "/").await.status, Some(404));
    assert!(hello.remote.func_map(&Request::default()).is_empty());

    hello.remote.enable(mocks.toolkit()).await.unwrap();
    hello.remote.routes().await.unwrap();
    assert_eq!(get(&mocks, "/").await.body_text(), "hello world");
}

#[tokio::test]
async fn test_closed_connection_fails_requests() {
    let (hello, mocks) = enabled(AdapterOptions::default()).await;
    hello.close();

    assert!(!hello.remote.is_connected());
    assert_eq!(get(&mocks, "/").await.status, Some(500));
    assert!(hello.remote.version().await.is_err());
    // Disabling a plugin whose connection is gone still succeeds.
    hello.remote.disable().await.unwrap();
}

#[tokio::test]
async fn test_routes_before_enable_is_rejected() {
    setup_test_logging_default();
    let hello = InProcessPlugin::connect(Arc::new(HelloPlugin::new()), AdapterOptions::default())
        .await
        .unwrap();
    assert!(hello.remote.routes().await.is_err());
}
