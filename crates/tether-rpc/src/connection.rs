//! A framed connection carrying calls in both directions.
//!
//! Each connection runs two background tasks. The writer drains an
//! outbound queue into the framed sink; the reader routes responses to
//! waiting callers and spawns one task per inbound request, so slow
//! handlers never block other calls and nested callbacks cannot deadlock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::broker::Broker;
use crate::error::{RpcError, RpcResult};
use crate::frame::{Frame, codec};
use crate::service::Service;

type Pending = HashMap<u64, oneshot::Sender<RpcResult<serde_json::Value>>>;

struct Inner {
    peer: String,
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<Pending>,
    next_call: AtomicU64,
    services: RwLock<HashMap<u32, Arc<dyn Service>>>,
    next_channel: AtomicU32,
    shutdown: CancellationToken,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn dispatch(
        &self,
        channel: u32,
        method: &str,
        params: serde_json::Value,
    ) -> RpcResult<serde_json::Value> {
        let service = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .cloned();
        match service {
            Some(service) => service.call(method, params).await,
            None => Err(RpcError::no_service(channel)),
        }
    }

    /// Fail every waiting call. Runs once the reader has stopped.
    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::closed()));
        }
    }
}

/// Removes an abandoned call from the pending table.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending().remove(&self.id);
    }
}

/// One end of a multiplexed RPC connection.
///
/// Cheap to clone; all clones share the same tasks and registries.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start the reader and writer tasks over a byte stream pair.
    ///
    /// `peer` names the other side in log output.
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            peer: peer.into(),
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            services: RwLock::new(HashMap::new()),
            next_channel: AtomicU32::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            inner.peer.clone(),
            FramedWrite::new(writer, codec()),
            rx,
            inner.shutdown.clone(),
        ));
        tokio::spawn(read_loop(
            Arc::clone(&inner),
            FramedRead::new(reader, codec()),
        ));

        Self { inner }
    }

    /// Call `method` on the peer's `channel` and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns the peer's error, or [`RpcError::closed`] if the connection
    /// closes before an answer arrives.
    pub async fn call(
        &self,
        channel: u32,
        method: &str,
        params: serde_json::Value,
    ) -> RpcResult<serde_json::Value> {
        let id = self.inner.next_call.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);
        let _pending = PendingGuard {
            inner: &self.inner,
            id,
        };

        // Checked after registering so a concurrent shutdown either sees the
        // entry and fails it, or is visible here.
        if self.is_closed() {
            return Err(RpcError::closed());
        }

        trace!(peer = %self.inner.peer, id, channel, method = %method, "Calling");
        self.inner
            .outbound
            .send(Frame::Request {
                id,
                channel,
                method: method.to_string(),
                params,
            })
            .map_err(|_| RpcError::closed())?;

        rx.await.unwrap_or_else(|_| Err(RpcError::closed()))
    }

    /// Access the channel broker of this connection.
    #[must_use]
    pub fn broker(&self) -> Broker {
        Broker::new(self.clone())
    }

    pub(crate) fn allocate_channel(&self) -> u32 {
        self.inner.next_channel.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn serve(&self, channel: u32, service: Arc<dyn Service>) {
        let replaced = self
            .inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, service)
            .is_some();
        if replaced {
            debug!(peer = %self.inner.peer, channel, "Replaced service on channel");
        }
    }

    pub(crate) fn unserve(&self, channel: u32) -> bool {
        self.inner
            .services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel)
            .is_some()
    }

    /// Name of the peer, as given at construction.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Whether the connection has shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Wait until the connection shuts down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Shut the connection down. Waiting calls fail with
    /// [`RpcError::closed`].
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn read_loop<R>(inner: Arc<Inner>, mut frames: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            next = frames.next() => next,
        };

        let bytes = match next {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                warn!(peer = %inner.peer, error = %e, "Connection read failed");
                break;
            },
            None => {
                debug!(peer = %inner.peer, "Connection closed by peer");
                break;
            },
        };

        match Frame::decode(&bytes) {
            Ok(Frame::Request {
                id,
                channel,
                method,
                params,
            }) => {
                let inner = Arc::clone(&inner);
                tokio::spawn(async move {
                    let outcome = inner.dispatch(channel, &method, params).await;
                    if let Err(e) = &outcome {
                        debug!(peer = %inner.peer, channel, method = %method, error = %e, "Call failed");
                    }
                    let _ = inner.outbound.send(Frame::response(id, outcome));
                });
            },
            Ok(Frame::Response { id, result, error }) => {
                let outcome = match error {
                    Some(e) => Err(e),
                    None => Ok(result.unwrap_or_default()),
                };
                let waiter = inner.pending().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    },
                    None => trace!(peer = %inner.peer, id, "Response for abandoned call"),
                }
            },
            Err(e) => warn!(peer = %inner.peer, error = %e, "Dropping malformed frame"),
        }
    }

    inner.shutdown.cancel();
    inner.fail_pending();
}

async fn write_loop<W>(
    peer: String,
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping unencodable frame");
                // A caller is waiting on a response; answer with the error.
                let Frame::Response { id, .. } = frame else {
                    continue;
                };
                match Frame::response(id, Err(e)).encode() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                }
            },
        };

        if let Err(e) = sink.send(Bytes::from(bytes)).await {
            warn!(peer = %peer, error = %e, "Connection write failed");
            shutdown.cancel();
            break;
        }
    }

    let _ = SinkExt::<Bytes>::close(&mut sink).await;
}
