//! Multiplexed bidirectional RPC for tether plugins.
//!
//! One [`Connection`] carries every call between a host and one plugin
//! process, in both directions:
//!
//! - [`frame`]: 4-byte big-endian length prefix plus a JSON [`Frame`]
//! - [`Connection`]: writer and reader tasks, concurrent in-flight calls,
//!   dispatch of inbound requests to locally served [`Service`]s
//! - [`Broker`]: numbered sub-services either side can start and the peer
//!   can dial back, which is how callbacks are wired during enable
//! - [`handshake`]: the cookie and version check performed before framing
//! - [`proto`]: method names and message bodies of every service
//! - [`funcs`]: the `Do` service and stubs behind proxied template helpers
//!
//! # Channels
//!
//! Channel 0 is the root service of the plugin process. All other channel
//! numbers are allocated by the side that serves them and are only
//! meaningful to that side's registry.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod broker;
pub mod connection;
pub mod error;
pub mod frame;
pub mod funcs;
pub mod handshake;
pub mod proto;
pub mod service;

pub use broker::{Broker, RpcClient};
pub use connection::Connection;
pub use error::{ErrorCode, RpcError, RpcResult};
pub use frame::Frame;
pub use funcs::{FuncLookup, FuncMapperServer, FuncTable, RemoteFunc, remote_func_map};
pub use handshake::{CORE_PROTOCOL_VERSION, HandshakeConfig, HandshakeError, HandshakeLine};
pub use service::{Service, ServiceSet, decode, encode};

/// Channel of the plugin process's root service.
pub const ROOT_CHANNEL: u32 = 0;
