//! Locally served RPC services.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{RpcError, RpcResult};

/// A set of methods reachable on one channel.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handle one call.
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value>;
}

/// Decode call parameters.
///
/// # Errors
///
/// Returns [`ErrorCode::InvalidParams`](crate::ErrorCode::InvalidParams) when
/// the parameters do not match `T`.
pub fn decode<T: DeserializeOwned>(params: serde_json::Value) -> RpcResult<T> {
    serde_json::from_value(params).map_err(RpcError::invalid_params)
}

/// Encode a return value.
///
/// # Errors
///
/// Returns a codec error if `value` cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> RpcResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Several services sharing one channel, addressed as `prefix.method`.
#[derive(Default)]
pub struct ServiceSet {
    services: HashMap<String, Arc<dyn Service>>,
}

impl ServiceSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service under `prefix`.
    #[must_use]
    pub fn with(mut self, prefix: impl Into<String>, service: impl Service) -> Self {
        self.services.insert(prefix.into(), Arc::new(service));
        self
    }
}

#[async_trait]
impl Service for ServiceSet {
    async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
        let Some((prefix, rest)) = method.split_once('.') else {
            return Err(RpcError::method_not_found(method));
        };
        let service = self
            .services
            .get(prefix)
            .ok_or_else(|| RpcError::method_not_found(method))?;
        service.call(rest, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
            Ok(serde_json::json!({"method": method, "params": params}))
        }
    }

    #[tokio::test]
    async fn test_prefix_routing() {
        let set = ServiceSet::new().with("echo", Echo);
        let out = set.call("echo.ping", serde_json::json!(1)).await.unwrap();
        assert_eq!(out["method"], "ping");

        let err = set.call("other.ping", serde_json::Value::Null).await.unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::MethodNotFound);

        let err = set.call("noprefix", serde_json::Value::Null).await.unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::MethodNotFound);
    }

    #[test]
    fn test_decode_reports_invalid_params() {
        let err = decode::<u32>(serde_json::json!("x")).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::InvalidParams);
    }
}
