//! Tether Test - shared test utilities for tether.
//!
//! Mock host services, the `hello` reference plugin, and helpers to run a
//! plugin in-process over a pipe or out-of-process through the
//! `hello-plugin` binary built by this crate.
//!
//! ```rust,ignore
//! use tether_test::{HelloPlugin, InProcessPlugin, MockToolkit};
//!
//! #[tokio::test]
//! async fn test_greeting() {
//!     let mocks = MockToolkit::default();
//!     let hello = InProcessPlugin::connect(Arc::new(HelloPlugin::new()), AdapterOptions::default())
//!         .await
//!         .unwrap();
//!     hello.remote.enable(mocks.toolkit()).await.unwrap();
//!     hello.remote.routes().await.unwrap();
//!
//!     let resp = mocks.router.dispatch(Request::new("GET", "/name/ann")).await;
//!     assert_eq!(resp.body_text(), "hello: ann");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod harness;
pub mod hello;
pub mod mocks;

pub use harness::*;
pub use hello::{HELLO_PLUGIN, HELLO_VERSION, HelloPlugin};
pub use mocks::*;
