//! The `hello` reference plugin as a standalone plugin binary.
//!
//! Started by a tether host, never by hand.

use std::sync::Arc;

use tether_telemetry::{LogConfig, setup_logging};
use tether_test::HelloPlugin;

#[tokio::main]
async fn main() {
    if let Err(e) = setup_logging(&LogConfig::for_plugin()) {
        eprintln!("hello-plugin: logging disabled: {e}");
    }

    if let Err(e) = tether_sdk::serve(Arc::new(HelloPlugin::new().with_crash_route())).await {
        eprintln!("hello-plugin: {e}");
        std::process::exit(1);
    }
}
