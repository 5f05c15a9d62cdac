//! Crash recovery of the `hello-plugin` binary.

use std::sync::Arc;
use std::time::Duration;

use tether_core::Request;
use tether_host::{AdapterOptions, HostConfig, PluginHost, Recovery, RestartPolicy, Supervisor};
use tether_test::{HELLO_PLUGIN, MockPluginHost, MockToolkit, hello_plugin_config, setup_test_logging_default};

const HELLO_BIN: &str = env!("CARGO_BIN_EXE_hello-plugin");

fn supervised(config: &HostConfig) -> (Supervisor, Arc<MockPluginHost>) {
    setup_test_logging_default();
    let host = Arc::new(MockPluginHost::new(MockToolkit::default()));
    let supervisor = Supervisor::new(
        config,
        Arc::clone(&host) as Arc<dyn PluginHost>,
        AdapterOptions::from_config(config),
    );
    (supervisor, host)
}

async fn crash(host: &MockPluginHost) {
    let resp = host.mocks().router.dispatch(Request::new("GET", "/crash")).await;
    assert_eq!(resp.status, Some(500));
}

/// Poll until a dead process is noticed; exit is not instantaneous.
async fn poll_until_recovered(supervisor: &Supervisor) -> Vec<(String, Recovery)> {
    for _ in 0..100 {
        let recovered = supervisor.poll_once().await;
        if !recovered.is_empty() {
            return recovered;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("crash was never detected");
}

#[tokio::test]
async fn test_crashed_plugin_is_restarted() {
    let config = HostConfig::default().with_plugin(hello_plugin_config(HELLO_BIN));
    let (supervisor, host) = supervised(&config);
    assert_eq!(supervisor.connect_all().await, 1);
    let first_pid = supervisor.connector().handle(HELLO_PLUGIN).unwrap().pid();

    // Nothing to do while the process is healthy.
    assert!(supervisor.poll_once().await.is_empty());

    crash(&host).await;
    let recovered = poll_until_recovered(&supervisor).await;
    assert_eq!(recovered, vec![(HELLO_PLUGIN.to_string(), Recovery::Restarted)]);

    let handle = supervisor.connector().handle(HELLO_PLUGIN).unwrap();
    assert!(handle.is_alive());
    assert_ne!(handle.pid(), first_pid);
    assert!(host.is_enabled(HELLO_PLUGIN));
    assert_eq!(host.page_loads(), vec![HELLO_PLUGIN]);

    let resp = host.mocks().router.dispatch(Request::new("GET", "/name/again")).await;
    assert_eq!(resp.body_text(), "hello: again");

    supervisor.disconnect().await;
}

#[tokio::test]
async fn test_crashed_plugin_is_disabled_by_policy() {
    let config = HostConfig::default()
        .with_plugin(hello_plugin_config(HELLO_BIN))
        .with_restart(RestartPolicy::Disable);
    let (supervisor, host) = supervised(&config);
    supervisor.connect_all().await;

    crash(&host).await;
    let recovered = poll_until_recovered(&supervisor).await;
    assert_eq!(recovered, vec![(HELLO_PLUGIN.to_string(), Recovery::Disabled)]);

    assert!(!host.is_enabled(HELLO_PLUGIN));
    assert!(!supervisor.connector().is_connected(HELLO_PLUGIN));
    assert!(host.page_loads().is_empty());
    let resp = host.mocks().router.dispatch(Request::new("GET", "/")).await;
    assert_eq!(resp.status, Some(404));

    // A disabled plugin is not polled again.
    assert!(supervisor.poll_once().await.is_empty());
}

#[tokio::test]
async fn test_failed_restart_disables_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let binary = dir.path().join("hello-plugin");
    std::fs::copy(HELLO_BIN, &binary).unwrap();

    let config = HostConfig::default().with_plugin(hello_plugin_config(&binary));
    let (supervisor, host) = supervised(&config);
    assert_eq!(supervisor.connect_all().await, 1);

    std::fs::remove_file(&binary).unwrap();
    crash(&host).await;
    let recovered = poll_until_recovered(&supervisor).await;
    assert_eq!(recovered, vec![(HELLO_PLUGIN.to_string(), Recovery::Disabled)]);
    assert!(!host.is_enabled(HELLO_PLUGIN));
}

#[tokio::test]
async fn test_monitor_recovers_in_background() {
    let config = HostConfig::default()
        .with_plugin(hello_plugin_config(HELLO_BIN))
        .with_poll_interval(Duration::from_millis(50));
    let (supervisor, host) = supervised(&config);
    supervisor.connect_all().await;

    assert!(supervisor.monitor());
    assert!(!supervisor.monitor());
    assert_eq!(supervisor.active_pollers(), 1);

    crash(&host).await;
    for _ in 0..100 {
        if !host.page_loads().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(host.page_loads(), vec![HELLO_PLUGIN]);

    let resp = host.mocks().router.dispatch(Request::new("GET", "/")).await;
    assert_eq!(resp.body_text(), "hello world");

    supervisor.disconnect().await;
    assert!(!supervisor.is_monitoring());
    assert_eq!(supervisor.active_pollers(), 0);
}
