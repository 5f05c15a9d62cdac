//! Channel brokering.
//!
//! A broker hands out channel ids for services one side wants the other to
//! call. The id travels inside an ordinary call (for example the `enable`
//! request), and the peer dials it to get a client.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::Connection;
use crate::error::RpcResult;
use crate::service::Service;

/// Allocates and serves channels on one connection.
#[derive(Clone)]
pub struct Broker {
    conn: Connection,
}

impl Broker {
    pub(crate) fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Reserve a fresh channel id on this side.
    #[must_use]
    pub fn next_id(&self) -> u32 {
        self.conn.allocate_channel()
    }

    /// Serve `service` on `id`. Calls the peer makes to `id` reach it.
    pub fn accept_and_serve(&self, id: u32, service: Arc<dyn Service>) {
        self.conn.serve(id, service);
    }

    /// Client for a channel served by the peer.
    #[must_use]
    pub fn dial(&self, id: u32) -> RpcClient {
        RpcClient {
            conn: self.conn.clone(),
            channel: id,
        }
    }

    /// Stop serving `id`. Returns whether anything was served there.
    pub fn close(&self, id: u32) -> bool {
        self.conn.unserve(id)
    }
}

/// Typed calls to one remote channel.
#[derive(Clone)]
pub struct RpcClient {
    conn: Connection,
    channel: u32,
}

impl RpcClient {
    /// Call `method` with `params` and decode the result.
    ///
    /// # Errors
    ///
    /// Returns the remote error, a codec error when either side of the
    /// exchange does not (de)serialize, or a closed error.
    pub async fn call<P, R>(&self, method: &str, params: &P) -> RpcResult<R>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let value = self.conn.call(self.channel, method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Remote channel this client talks to.
    #[must_use]
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Whether the connection has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.conn.peer())
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::ErrorCode;

    struct Adder;

    #[async_trait]
    impl Service for Adder {
        async fn call(&self, method: &str, params: serde_json::Value) -> RpcResult<serde_json::Value> {
            let (a, b): (i64, i64) = crate::decode(params)?;
            match method {
                "add" => crate::encode(&a.saturating_add(b)),
                other => Err(crate::RpcError::method_not_found(other)),
            }
        }
    }

    #[tokio::test]
    async fn test_brokered_channel_round_trip() {
        let (a, b) = tokio::io::duplex(4096);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let host = Connection::new("plugin", ar, aw);
        let plugin = Connection::new("host", br, bw);

        let id = host.broker().next_id();
        assert_ne!(id, crate::ROOT_CHANNEL);
        host.broker().accept_and_serve(id, Arc::new(Adder));

        let client = plugin.broker().dial(id);
        let sum: i64 = client.call("add", &(2, 3)).await.unwrap();
        assert_eq!(sum, 5);

        assert!(host.broker().close(id));
        let err = client.call::<_, i64>("add", &(2, 3)).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NoService);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let broker = Connection::new("peer", r, w).broker();
        let first = broker.next_id();
        let second = broker.next_id();
        assert_ne!(first, second);
    }
}
