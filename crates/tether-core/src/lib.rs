//! Capability contract shared by tether hosts and plugins.
//!
//! A plugin looks the same to the host whether it runs in-process or in a
//! separate OS process. This crate defines that shared surface:
//!
//! - [`Plugin`]: lifecycle and capability listing (routes, assets, settings,
//!   grant requests, middleware, function map)
//! - [`Toolkit`]: the host services handed to a plugin at enable time
//!   ([`Logger`], [`Router`], [`SecureSite`], [`Renderer`])
//! - [`Request`] / [`ResponseWriter`]: HTTP-shaped request and response
//!   handles that survive a trip across the process boundary
//! - [`Value`]: the tagged envelope carrying dynamic function arguments and
//!   return values
//! - [`FuncMap`]: named callables plus the argument-count-checked caller
//!
//! # Error Model
//!
//! Handler and site failures are [`HttpError`]s. A status-carrying error
//! keeps its numeric code wherever it travels; anything else renders as a
//! 500.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod error;
pub mod funcs;
pub mod http;
pub mod plugin;
pub mod toolkit;
pub mod value;

pub use error::{EnvelopeError, FuncError, HttpError, PluginError, PluginResult};
pub use funcs::{Callable, FuncMap, FuncOutput, IntoFunc, Returned, TypedFunc, call_func};
pub use http::{Headers, RecordedResponse, Request, RequestId, ResponseWriter, match_route, status_text};
pub use plugin::{
    Asset, Assets, EmbeddedFile, Flow, Grant, GrantRequest, Middleware, Plugin, Setting,
    SettingType, base64_bytes,
};
pub use toolkit::{
    Handler, HandlerFuture, LogLevel, Logger, Renderer, Router, SecureSite, Toolkit, Vars,
    handler,
};
pub use value::{FromValue, IntoValue, Value};
