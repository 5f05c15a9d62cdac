//! HTTP-shaped request and response handles.
//!
//! The real HTTP server is outside this crate. These types carry exactly the
//! parts of an exchange that cross the process boundary: method, path,
//! headers and body on the way in; status, headers and body on the way out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::funcs::FuncMap;
use crate::value::Value;

/// Opaque identifier of one in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Placeholder carried by calls that belong to no request, such as
    /// global function tables.
    #[must_use]
    pub fn unscoped() -> Self {
        Self(String::new())
    }

    /// Whether this is the [`unscoped`](Self::unscoped) placeholder.
    #[must_use]
    pub fn is_unscoped(&self) -> bool {
        self.0.is_empty()
    }

    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Header multimap with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    /// Create an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(&self, name: &str) -> Option<String> {
        self.0.keys().find(|k| k.eq_ignore_ascii_case(name)).cloned()
    }

    /// First value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// All values of `name`.
    #[must_use]
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or_default()
    }

    /// Replace every value of `name` with `value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(existing) = self.key_of(&name) {
            self.0.remove(&existing);
        }
        self.0.insert(name, vec![value.into()]);
    }

    /// Append a value to `name`.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = self.key_of(&name).unwrap_or(name);
        self.0.entry(key).or_default().push(value.into());
    }

    /// Remove `name` entirely.
    pub fn remove(&mut self, name: &str) {
        if let Some(existing) = self.key_of(name) {
            self.0.remove(&existing);
        }
    }

    /// Copy every header of `other` over this set, replacing same-named keys.
    pub fn merge(&mut self, other: &Headers) {
        for (name, values) in &other.0 {
            if let Some(existing) = self.key_of(name) {
                self.0.remove(&existing);
            }
            self.0.insert(name.clone(), values.clone());
        }
    }

    /// Iterate `(name, values)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Whether no headers are set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// An incoming request.
///
/// `params` is filled by the router that matched the request. `values`
/// carry whatever middleware attached for the handlers further down the
/// chain. `request_id` is set once the request touches a bridge; `funcs` only
/// on requests reconstructed on the far side of one.
#[derive(Debug, Clone, Default)]
pub struct Request {
    /// Upper-case HTTP method.
    pub method: String,
    /// Full request path, including any query string.
    pub path: String,
    /// Request headers.
    pub headers: Headers,
    /// Raw request body.
    pub body: Vec<u8>,
    /// Path parameters extracted by the router.
    pub params: BTreeMap<String, String>,
    /// Request-scoped values set by middleware.
    pub values: BTreeMap<String, Value>,
    request_id: Option<RequestId>,
    funcs: FuncMap,
}

impl Request {
    /// Create a request with an empty body.
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.add(name, value);
        self
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a path parameter.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Tag with the identifier used to correlate nested calls.
    #[must_use]
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Attach a request-scoped value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_value(key, value);
        self
    }

    /// Attach a request-scoped value in place.
    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Request-scoped value set by middleware.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Correlation identifier, assigning a fresh one on first use.
    pub fn ensure_request_id(&mut self) -> RequestId {
        self.request_id.get_or_insert_with(RequestId::generate).clone()
    }

    /// Attach the per-request function table.
    #[must_use]
    pub fn with_funcs(mut self, funcs: FuncMap) -> Self {
        self.funcs = funcs;
        self
    }

    /// Correlation identifier, if this request touched a bridge.
    #[must_use]
    pub fn request_id(&self) -> Option<&RequestId> {
        self.request_id.as_ref()
    }

    /// Per-request function table.
    #[must_use]
    pub fn funcs(&self) -> &FuncMap {
        &self.funcs
    }

    /// Path without the query string.
    #[must_use]
    pub fn path_only(&self) -> &str {
        self.path.split_once('?').map_or(self.path.as_str(), |(p, _)| p)
    }

    /// Raw value of a query parameter. No percent-decoding is applied.
    #[must_use]
    pub fn query(&self, name: &str) -> Option<&str> {
        let (_, query) = self.path.split_once('?')?;
        query.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }
}

/// Snapshot of what has been written to a [`ResponseWriter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordedResponse {
    /// Status code, if one was written.
    pub status: Option<u16>,
    /// Response headers.
    pub headers: Headers,
    /// Response body.
    pub body: Vec<u8>,
}

impl RecordedResponse {
    /// Status code, defaulting to 200.
    #[must_use]
    pub fn status_or_ok(&self) -> u16 {
        self.status.unwrap_or(200)
    }

    /// Body as UTF-8, lossily.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Shared handle to a response under construction.
///
/// Cloning yields another handle to the same response. The first status
/// written wins; writing body bytes without a status implies 200.
#[derive(Debug, Clone, Default)]
pub struct ResponseWriter {
    inner: Arc<Mutex<RecordedResponse>>,
}

impl ResponseWriter {
    /// Create an empty response.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut RecordedResponse) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Replace a header value.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.with(|r| r.headers.set(name, value));
    }

    /// Append a header value.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        self.with(|r| r.headers.add(name, value));
    }

    /// Copy headers over the current set.
    pub fn merge_headers(&self, headers: &Headers) {
        self.with(|r| r.headers.merge(headers));
    }

    /// Write the status code. Ignored once a status has been written.
    pub fn write_header(&self, status: u16) {
        self.with(|r| {
            r.status.get_or_insert(status);
        });
    }

    /// Append body bytes.
    pub fn write(&self, bytes: &[u8]) {
        self.with(|r| {
            r.status.get_or_insert(200);
            r.body.extend_from_slice(bytes);
        });
    }

    /// Whether a status or body has been written.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.with(|r| r.status.is_some())
    }

    /// Current status, defaulting to 200.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.with(|r| r.status_or_ok())
    }

    /// Copy of everything written so far.
    #[must_use]
    pub fn snapshot(&self) -> RecordedResponse {
        self.with(|r| r.clone())
    }
}

/// Reason phrase for a status code.
#[must_use]
pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        418 => "I'm a teapot",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// Match `path` against a route pattern with `{name}` segments.
///
/// Returns the captured parameters, or `None` if the path does not fit.
/// Leading and trailing slashes are ignored; a parameter never matches an
/// empty segment.
#[must_use]
pub fn match_route(pattern: &str, path: &str) -> Option<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut wanted = pattern.trim_matches('/').split('/');
    let mut given = path.trim_matches('/').split('/');
    loop {
        match (wanted.next(), given.next()) {
            (None, None) => return Some(params),
            (Some(want), Some(got)) => {
                if let Some(name) = want.strip_prefix('{').and_then(|w| w.strip_suffix('}')) {
                    if got.is_empty() {
                        return None;
                    }
                    params.insert(name.to_string(), got.to_string());
                } else if want != got {
                    return None;
                }
            },
            _ => return None,
        }
    }
}
