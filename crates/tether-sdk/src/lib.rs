//! Plugin side of tether.
//!
//! A plugin binary implements [`tether_core::Plugin`] and hands it to
//! [`serve`]:
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     tether_sdk::serve(Arc::new(MyPlugin::default())).await?;
//!     Ok(())
//! }
//! ```
//!
//! The host passes a cookie through the environment. [`serve`] checks it,
//! prints the handshake line and then speaks frames on stdin/stdout until
//! the host closes the pipe. Nothing else may write to stdout; log to
//! stderr, which the host relays.
//!
//! At enable time the plugin receives proxies for the host toolkit
//! ([`RemoteLogger`], [`RemoteRouter`], [`RemoteSite`],
//! [`RemoteRenderer`]) and serves its own route handlers and function table
//! back to the host.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod proxies;
pub mod serve;

mod state;

pub use error::{SdkError, SdkResult};
pub use handler::HandlerService;
pub use lifecycle::LifecycleServer;
pub use proxies::{RemoteLogger, RemoteRenderer, RemoteRouter, RemoteSite};
pub use serve::{serve, serve_connection, serve_with};
