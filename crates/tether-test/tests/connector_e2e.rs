//! Spawning, handshake and dispense failures.

use std::time::Duration;

use tether_host::{ConnectError, ProcessConnector, RemotePluginConfig};
use tether_rpc::{HandshakeConfig, HandshakeError};
use tether_test::{HELLO_PLUGIN, hello_plugin_config, setup_test_logging_default};

const HELLO_BIN: &str = env!("CARGO_BIN_EXE_hello-plugin");

fn connector() -> ProcessConnector {
    setup_test_logging_default();
    ProcessConnector::new(HandshakeConfig::default(), Duration::from_secs(5))
}

#[tokio::test]
async fn test_connect_and_disconnect() {
    let connector = connector();
    let handle = connector.connect(&hello_plugin_config(HELLO_BIN)).await.unwrap();

    assert_eq!(handle.name(), HELLO_PLUGIN);
    assert!(handle.pid().is_some());
    assert!(handle.is_alive());
    assert_eq!(connector.names(), vec![HELLO_PLUGIN]);

    assert!(connector.disconnect(HELLO_PLUGIN).await);
    assert!(!handle.is_alive());
    assert!(!connector.disconnect(HELLO_PLUGIN).await);
}

#[tokio::test]
async fn test_reconnect_replaces_process() {
    let connector = connector();
    let first = connector.connect(&hello_plugin_config(HELLO_BIN)).await.unwrap();
    let second = connector.connect(&hello_plugin_config(HELLO_BIN)).await.unwrap();

    assert!(!first.is_alive());
    assert!(second.is_alive());
    assert_eq!(connector.names().len(), 1);
    connector.disconnect_all().await;
    assert!(!connector.is_connected(HELLO_PLUGIN));
}

#[tokio::test]
async fn test_missing_executable() {
    let err = connector()
        .connect(&RemotePluginConfig::new(HELLO_PLUGIN, "/nonexistent/hello-plugin"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Spawn { .. }), "{err}");
    assert_eq!(err.plugin(), HELLO_PLUGIN);
}

#[tokio::test]
async fn test_cookie_mismatch_exits_before_handshake() {
    let handshake = HandshakeConfig {
        magic_cookie_value: "not-the-cookie".to_string(),
        ..HandshakeConfig::default()
    };
    let connector = ProcessConnector::new(handshake, Duration::from_secs(5));
    let err = connector.connect(&hello_plugin_config(HELLO_BIN)).await.unwrap_err();
    assert!(matches!(err, ConnectError::ExitedEarly { .. }), "{err}");
    assert!(connector.names().is_empty());
}

#[tokio::test]
async fn test_unknown_plugin_name_fails_dispense() {
    let connector = connector();
    let err = connector
        .connect(&RemotePluginConfig::new("goodbye", HELLO_BIN))
        .await
        .unwrap_err();
    match err {
        ConnectError::Dispense { name, source } => {
            assert_eq!(name, "goodbye");
            assert!(source.message.contains("unknown plugin: goodbye"), "{source}");
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(!connector.is_connected("goodbye"));
}

#[tokio::test]
async fn test_non_plugin_output_is_rejected() {
    let err = connector()
        .connect(&RemotePluginConfig::new("echo", "echo").with_args(["hello there"]))
        .await
        .unwrap_err();
    match err {
        ConnectError::Handshake { reason, .. } => assert!(matches!(reason, HandshakeError::Malformed(_))),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_silent_process_times_out() {
    let connector = ProcessConnector::new(HandshakeConfig::default(), Duration::from_millis(200));
    let err = connector
        .connect(&RemotePluginConfig::new("sleeper", "sleep").with_args(["10"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Timeout { .. }), "{err}");
}
