//! Function tables across the process boundary.
//!
//! Functions never travel. The side that owns a table serves
//! [`FuncMapperServer`]; the other side holds [`RemoteFunc`] stubs, one
//! per key, that issue `funcs.do` with the key and the enveloped arguments.
//! Both host and plugin use the same pair, with a different
//! [`FuncLookup`] deciding where tables come from.

use async_trait::async_trait;
use tether_core::{Callable, FuncError, FuncMap, RequestId, Value};
use tracing::debug;

use crate::broker::RpcClient;
use crate::error::{RpcError, RpcResult};
use crate::proto::{self, FuncDoRequest, FuncDoResponse, FuncScope};
use crate::service::{Service, decode, encode};

/// A resolved function table.
///
/// `lease` is held for the duration of the call, which lets the owner keep
/// per-request state alive while the call runs.
pub struct FuncTable {
    /// The functions.
    pub funcs: FuncMap,
    _lease: Option<Box<dyn Send + Sync>>,
}

impl FuncTable {
    /// A table without a lease.
    #[must_use]
    pub fn new(funcs: FuncMap) -> Self {
        Self { funcs, _lease: None }
    }

    /// Hold `lease` until the call completes.
    #[must_use]
    pub fn with_lease(mut self, lease: impl Send + Sync + 'static) -> Self {
        self._lease = Some(Box::new(lease));
        self
    }
}

/// Resolves the table a `do` call addresses.
#[async_trait]
pub trait FuncLookup: Send + Sync + 'static {
    /// Table for `request_id` in `scope`, or `None` if there is none.
    async fn lookup(&self, request_id: &RequestId, scope: FuncScope) -> Option<FuncTable>;
}

/// Serves `do` over a [`FuncLookup`].
pub struct FuncMapperServer<L> {
    lookup: L,
}

impl<L: FuncLookup> FuncMapperServer<L> {
    /// Serve the tables `lookup` resolves.
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl<L: FuncLookup> Service for FuncMapperServer<L> {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        if method != proto::DO {
            return Err(RpcError::method_not_found(method));
        }
        let req: FuncDoRequest = decode(params)?;

        let Some(table) = self.lookup.lookup(&req.request_id, req.scope).await else {
            debug!(request_id = %req.request_id, key = %req.key, "No function table for call");
            return encode(&FuncDoResponse {
                value: None,
                error: Some(format!("no function table for request {}", req.request_id)),
            });
        };

        let outcome = table.funcs.call(&req.key, req.args).await.and_then(|value| {
            if let Some(value) = &value {
                value.validate()?;
            }
            Ok(value)
        });
        let response = match outcome {
            Ok(value) => FuncDoResponse { value, error: None },
            Err(e) => FuncDoResponse {
                value: None,
                error: Some(e.to_string()),
            },
        };
        drop(table);
        encode(&response)
    }
}

/// Stub for one function of a remote table.
pub struct RemoteFunc {
    client: RpcClient,
    request_id: RequestId,
    key: String,
    scope: FuncScope,
}

impl RemoteFunc {
    /// Stub calling `key` through `client`.
    #[must_use]
    pub fn new(client: RpcClient, request_id: RequestId, key: impl Into<String>, scope: FuncScope) -> Self {
        Self {
            client,
            request_id,
            key: key.into(),
            scope,
        }
    }
}

#[async_trait]
impl Callable for RemoteFunc {
    async fn call(&self, args: Vec<Value>) -> Result<Option<Value>, FuncError> {
        let req = FuncDoRequest {
            request_id: self.request_id.clone(),
            key: self.key.clone(),
            args,
            scope: self.scope,
        };
        let resp: FuncDoResponse = self
            .client
            .call(proto::FUNCS_DO, &req)
            .await
            .map_err(|e| FuncError::Transport(e.to_string()))?;
        match resp.error {
            Some(e) => Err(FuncError::Call(e)),
            None => Ok(resp.value),
        }
    }
}

/// Stubs for `keys`, all reaching the table behind `client`.
#[must_use]
pub fn remote_func_map<I, S>(client: &RpcClient, request_id: &RequestId, keys: I, scope: FuncScope) -> FuncMap
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut map = FuncMap::new();
    for key in keys {
        let key = key.into();
        let stub = RemoteFunc::new(client.clone(), request_id.clone(), key.clone(), scope);
        map.insert(key, std::sync::Arc::new(stub));
    }
    map
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Connection, ServiceSet};

    struct Tables {
        global: FuncMap,
        leases: Arc<AtomicUsize>,
    }

    struct Lease(Arc<AtomicUsize>);

    impl Drop for Lease {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FuncLookup for Arc<Tables> {
        async fn lookup(&self, request_id: &RequestId, scope: FuncScope) -> Option<FuncTable> {
            match scope {
                FuncScope::Global => Some(FuncTable::new(self.global.clone())),
                FuncScope::Request if request_id.as_str() == "known" => {
                    self.leases.fetch_add(1, Ordering::SeqCst);
                    let funcs = FuncMap::new().with_fn("who", || "request".to_string());
                    Some(FuncTable::new(funcs).with_lease(Lease(Arc::clone(&self.leases))))
                },
                FuncScope::Request => None,
            }
        }
    }

    fn tables() -> Arc<Tables> {
        Arc::new(Tables {
            global: FuncMap::new()
                .with_fn("add", |a: i64, b: i64| a.saturating_add(b))
                .with_fn("ratio", || Value::Float(f64::NAN))
                .with_fn("fail", || -> Result<String, String> { Err("boom".into()) }),
            leases: Arc::new(AtomicUsize::new(0)),
        })
    }

    async fn client_for(tables: Arc<Tables>) -> RpcClient {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let owner = Connection::new("caller", ar, aw);
        let caller = Connection::new("owner", br, bw);

        let id = owner.broker().next_id();
        owner.broker().accept_and_serve(
            id,
            Arc::new(ServiceSet::new().with(proto::host::FUNCS, FuncMapperServer::new(tables))),
        );
        caller.broker().dial(id)
    }

    #[tokio::test]
    async fn test_remote_call_matches_local_call() {
        let tables = tables();
        let client = client_for(Arc::clone(&tables)).await;
        let stubs = remote_func_map(&client, &RequestId::new("x"), ["add", "fail", "missing"], FuncScope::Global);

        let args = vec![Value::Int(2), Value::Int(40)];
        let local = tables.global.call("add", args.clone()).await.unwrap();
        let remote = stubs.call("add", args).await.unwrap();
        assert_eq!(local, remote);
        assert_eq!(remote, Some(Value::Int(42)));

        let err = stubs.call("fail", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");

        let err = stubs.call("add", vec![Value::Int(1)]).await.unwrap_err();
        assert_eq!(err.to_string(), "input parameters expected is 2, but passed in 1");

        let err = stubs.call("missing", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "function not found: missing");
    }

    #[tokio::test]
    async fn test_non_finite_return_is_an_envelope_error() {
        let client = client_for(tables()).await;
        let stubs = remote_func_map(&client, &RequestId::new("x"), ["ratio"], FuncScope::Global);

        let err = stubs.call("ratio", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "return value: non-finite number cannot be carried");
    }

    #[tokio::test]
    async fn test_request_scope_takes_and_releases_lease() {
        let tables = tables();
        let client = client_for(Arc::clone(&tables)).await;

        let known = remote_func_map(&client, &RequestId::new("known"), ["who"], FuncScope::Request);
        assert_eq!(known.call("who", vec![]).await.unwrap(), Some(Value::String("request".into())));
        assert_eq!(tables.leases.load(Ordering::SeqCst), 0);

        let unknown = remote_func_map(&client, &RequestId::new("gone"), ["who"], FuncScope::Request);
        let err = unknown.call("who", vec![]).await.unwrap_err();
        assert!(matches!(err, FuncError::Call(msg) if msg.contains("gone")));
    }
}
