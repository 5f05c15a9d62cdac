//! Host side of tether.
//!
//! Runs plugins as child processes while the rest of the host keeps
//! treating them as ordinary [`tether_core::Plugin`]s:
//!
//! - [`ProcessConnector`]: spawn, handshake, dispense, kill
//! - [`RemotePlugin`]: the [`Plugin`](tether_core::Plugin) contract over a
//!   plugin connection, wiring callback channels at enable time
//! - [`HandlerBridge`]: forwards routed requests and replays the plugin's
//!   recorded response
//! - [`RequestCorrelator`]: in-flight request state for nested callbacks
//! - [`Supervisor`]: connects everything and handles crashes per
//!   [`RestartPolicy`]
//!
//! # Example
//!
//! ```rust,ignore
//! let config = HostConfig::load("tether.toml")?;
//! let supervisor = Supervisor::new(&config, registry, AdapterOptions::from_config(&config));
//! supervisor.connect_all().await;
//! supervisor.monitor();
//! // ...
//! supervisor.disconnect().await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod correlator;
pub mod error;
pub mod services;
pub mod supervisor;

pub use adapter::{AdapterOptions, RemotePlugin};
pub use bridge::{FuncSource, HandlerBridge, RouterServer};
pub use config::{HostConfig, RemotePluginConfig, RestartPolicy, SupervisorConfig};
pub use connector::{PluginProcessHandle, ProcessConnector};
pub use correlator::{ContextLease, DEFAULT_GRACE, RequestContext, RequestCorrelator};
pub use error::{ConnectError, ConnectResult, HostError, HostResult};
pub use services::{HostFuncLookup, LoggerServer, RendererServer, SiteServer, TracingLogger};
pub use supervisor::{PluginHost, Recovery, Supervisor};
