//! Request correlation.
//!
//! When a request crosses into a plugin, the real request, its response
//! writer and the host function table stay here under a fresh
//! [`RequestId`]. Nested calls the plugin makes while handling it (router
//! param/error, renderer, site login, function calls) carry the id back and
//! resolve the live objects through [`RequestCorrelator::lease`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tether_core::{FuncMap, Request, RequestId, ResponseWriter};
use tracing::{debug, trace};

/// Default window of [`RequestCorrelator::delete_delayed`].
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// State of one in-flight bridged request.
#[derive(Debug)]
pub struct RequestContext {
    /// The real request.
    pub request: Request,
    /// The real response.
    pub response: ResponseWriter,
    /// Host functions available to the plugin for this request.
    pub funcs: FuncMap,
    leases: AtomicUsize,
}

impl RequestContext {
    /// Bundle the live objects of a request.
    #[must_use]
    pub fn new(request: Request, response: ResponseWriter, funcs: FuncMap) -> Self {
        Self {
            request,
            response,
            funcs,
            leases: AtomicUsize::new(0),
        }
    }

    /// Number of nested calls currently using this context.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }
}

/// A nested call's hold on a context. Released on drop.
#[derive(Debug)]
pub struct ContextLease {
    context: Arc<RequestContext>,
}

impl ContextLease {
    fn new(context: Arc<RequestContext>) -> Self {
        context.leases.fetch_add(1, Ordering::AcqRel);
        Self { context }
    }
}

impl std::ops::Deref for ContextLease {
    type Target = RequestContext;

    fn deref(&self) -> &RequestContext {
        &self.context
    }
}

impl Drop for ContextLease {
    fn drop(&mut self) {
        self.context.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Registry of in-flight bridged requests.
///
/// Cheap to clone; clones share the registry. Lookups take the read lock,
/// save and delete take the write lock.
#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    entries: Arc<RwLock<HashMap<RequestId, Arc<RequestContext>>>>,
    grace: Duration,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE)
    }
}

impl RequestCorrelator {
    /// Registry whose delayed deletions wait `grace`.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            grace,
        }
    }

    /// Store `context` under `id`, replacing any previous entry.
    pub fn save(&self, id: RequestId, context: RequestContext) -> Arc<RequestContext> {
        let context = Arc::new(context);
        let previous = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), Arc::clone(&context));
        if previous.is_some() {
            debug!(request_id = %id, "Overwrote request context");
        }
        context
    }

    /// Context stored under `id`.
    #[must_use]
    pub fn load(&self, id: &RequestId) -> Option<Arc<RequestContext>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Context stored under `id`, counted as in use until the lease drops.
    #[must_use]
    pub fn lease(&self, id: &RequestId) -> Option<ContextLease> {
        self.load(id).map(ContextLease::new)
    }

    /// Remove `id` now. Returns whether it was present.
    pub fn delete(&self, id: &RequestId) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .is_some();
        trace!(request_id = %id, removed, "Deleted request context");
        removed
    }

    /// Remove `id` after the grace window.
    ///
    /// Only the context present now is removed; if `id` is saved again in
    /// the meantime the new entry survives. Outside a tokio runtime the
    /// entry is removed immediately.
    pub fn delete_delayed(&self, id: RequestId) {
        let Some(expected) = self.load(&id) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.delete(&id);
            return;
        };
        let entries = Arc::clone(&self.entries);
        let grace = self.grace;
        debug!(request_id = %id, grace_secs = grace.as_secs(), "Scheduling delayed context deletion");
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let mut entries = entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.get(&id).is_some_and(|current| Arc::ptr_eq(current, &expected)) {
                entries.remove(&id);
                trace!(request_id = %id, "Delayed deletion of request context");
            }
        });
    }

    /// Number of stored contexts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no contexts are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grace window of delayed deletion.
    #[must_use]
    pub fn grace(&self) -> Duration {
        self.grace
    }
}

/// Retires a context exactly once when the call that created it ends.
///
/// Deletion is immediate once the primary call has returned and no nested
/// call holds a lease. A guard dropped before [`finish`](Self::finish)
/// (timeout, or the host stopped waiting) delays deletion by the grace
/// window, since the plugin may still be working on the request.
pub(crate) struct ContextGuard {
    correlator: RequestCorrelator,
    id: RequestId,
    context: Arc<RequestContext>,
    finished: bool,
}

impl ContextGuard {
    pub(crate) fn new(correlator: RequestCorrelator, id: RequestId, context: Arc<RequestContext>) -> Self {
        Self {
            correlator,
            id,
            context,
            finished: false,
        }
    }

    /// The primary call returned.
    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        if !self.finished || self.context.active_leases() > 0 {
            self.correlator.delete_delayed(self.id.clone());
        } else {
            self.correlator.delete(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(path: &str) -> RequestContext {
        RequestContext::new(Request::new("GET", path), ResponseWriter::new(), FuncMap::new())
    }

    #[test]
    fn test_save_load_delete() {
        let correlator = RequestCorrelator::default();
        let id = RequestId::generate();

        correlator.save(id.clone(), context("/a"));
        assert_eq!(correlator.load(&id).unwrap().request.path, "/a");

        assert!(correlator.delete(&id));
        assert!(correlator.load(&id).is_none());
        assert!(!correlator.delete(&id));
    }

    #[test]
    fn test_save_overwrites() {
        let correlator = RequestCorrelator::default();
        let id = RequestId::new("same");
        correlator.save(id.clone(), context("/first"));
        correlator.save(id.clone(), context("/second"));
        assert_eq!(correlator.len(), 1);
        assert_eq!(correlator.load(&id).unwrap().request.path, "/second");
    }

    #[test]
    fn test_lease_counts_until_dropped() {
        let correlator = RequestCorrelator::default();
        let id = RequestId::generate();
        let stored = correlator.save(id.clone(), context("/"));

        let first = correlator.lease(&id).unwrap();
        let second = correlator.lease(&id).unwrap();
        assert_eq!(stored.active_leases(), 2);
        assert_eq!(first.request.path, "/");
        drop(first);
        drop(second);
        assert_eq!(stored.active_leases(), 0);
        assert!(correlator.lease(&RequestId::generate()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_delayed_waits_for_grace() {
        let correlator = RequestCorrelator::new(Duration::from_secs(30));
        let id = RequestId::generate();
        correlator.save(id.clone(), context("/"));

        correlator.delete_delayed(id.clone());
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(correlator.load(&id).is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(correlator.load(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_delayed_spares_newer_entry() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let id = RequestId::new("reused");
        correlator.save(id.clone(), context("/old"));
        correlator.delete_delayed(id.clone());

        correlator.save(id.clone(), context("/new"));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(correlator.load(&id).unwrap().request.path, "/new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_delays_while_leased_or_unfinished() {
        let correlator = RequestCorrelator::new(Duration::from_secs(5));

        let quiet = RequestId::generate();
        let stored = correlator.save(quiet.clone(), context("/quiet"));
        let mut guard = ContextGuard::new(correlator.clone(), quiet.clone(), stored);
        guard.finish();
        drop(guard);
        assert!(correlator.load(&quiet).is_none());

        let busy = RequestId::generate();
        let stored = correlator.save(busy.clone(), context("/busy"));
        let lease = correlator.lease(&busy).unwrap();
        let mut guard = ContextGuard::new(correlator.clone(), busy.clone(), stored);
        guard.finish();
        drop(guard);
        assert!(correlator.load(&busy).is_some());
        drop(lease);

        let cut_short = RequestId::generate();
        let stored = correlator.save(cut_short.clone(), context("/cut-short"));
        drop(ContextGuard::new(correlator.clone(), cut_short.clone(), stored));
        assert!(correlator.load(&cut_short).is_some());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(correlator.load(&busy).is_none());
        assert!(correlator.load(&cut_short).is_none());
    }

    #[test]
    fn test_delayed_without_runtime_deletes_now() {
        let correlator = RequestCorrelator::default();
        let id = RequestId::generate();
        correlator.save(id.clone(), context("/"));
        correlator.delete_delayed(id.clone());
        assert!(correlator.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_do_not_cross() {
        let correlator = RequestCorrelator::default();
        let mut tasks = Vec::new();
        for i in 0..64 {
            let correlator = correlator.clone();
            tasks.push(tokio::spawn(async move {
                let id = RequestId::generate();
                let path = format!("/{i}");
                correlator.save(id.clone(), context(&path));
                tokio::task::yield_now().await;
                let seen = correlator.load(&id).unwrap().request.path.clone();
                correlator.delete(&id);
                assert_eq!(seen, path);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(correlator.is_empty());
    }
}
