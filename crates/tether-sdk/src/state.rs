//! Plugin-side state shared by the lifecycle server and the proxies.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tether_core::{FuncMap, Handler, RequestId, Value};

/// How long values set by middleware wait for the handler of their request.
pub(crate) const MIDDLEWARE_VALUES_GRACE: Duration = Duration::from_secs(30);

/// Request values left by the middleware chain, tagged so that an expiry
/// timer only removes the entry it was started for.
struct StashedValues {
    generation: u64,
    values: BTreeMap<String, Value>,
}

/// Declared routes, the function tables of renders in flight and the values
/// middleware attached to requests not yet handled.
#[derive(Default)]
pub(crate) struct PluginState {
    routes: RwLock<HashMap<(String, String), Handler>>,
    render_funcs: RwLock<HashMap<RequestId, FuncMap>>,
    middleware_values: RwLock<HashMap<RequestId, StashedValues>>,
    generation: AtomicU64,
}

impl PluginState {
    pub(crate) fn add_route(&self, method: &str, path: &str, handler: Handler) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((method.to_ascii_uppercase(), path.to_string()), handler);
    }

    pub(crate) fn remove_route(&self, method: &str, path: &str) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(method.to_ascii_uppercase(), path.to_string()));
    }

    pub(crate) fn handler(&self, method: &str, path: &str) -> Option<Handler> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(method.to_ascii_uppercase(), path.to_string()))
            .cloned()
    }

    pub(crate) fn clear_routes(&self) {
        self.routes.write().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Expose `funcs` to the host for the duration of one render.
    pub(crate) fn register_render_funcs(self: &Arc<Self>, id: RequestId, funcs: FuncMap) -> RenderFuncs {
        self.render_funcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), funcs);
        RenderFuncs {
            state: Arc::clone(self),
            id,
        }
    }

    pub(crate) fn render_funcs(&self, id: &RequestId) -> Option<FuncMap> {
        self.render_funcs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }
}

impl PluginState {
    /// Keep `values` for the handler of request `id`.
    ///
    /// Most requests passing the middleware are not routed to this plugin,
    /// so the entry expires after `grace` unless the handler takes it first.
    pub(crate) fn stash_middleware_values(
        self: &Arc<Self>,
        id: RequestId,
        values: BTreeMap<String, Value>,
        grace: Duration,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        self.middleware_values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), StashedValues { generation, values });

        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let mut stashed = state.middleware_values.write().unwrap_or_else(PoisonError::into_inner);
            if stashed.get(&id).is_some_and(|entry| entry.generation == generation) {
                stashed.remove(&id);
            }
        });
    }

    /// Take the values middleware left for request `id`.
    pub(crate) fn take_middleware_values(&self, id: &RequestId) -> BTreeMap<String, Value> {
        self.middleware_values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .map(|entry| entry.values)
            .unwrap_or_default()
    }
}

/// Unregisters a render's function table on drop.
pub(crate) struct RenderFuncs {
    state: Arc<PluginState>,
    id: RequestId,
}

impl Drop for RenderFuncs {
    fn drop(&mut self) {
        self.state
            .render_funcs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use tether_core::handler;

    use super::*;

    #[test]
    fn test_routes_are_case_insensitive_on_method() {
        let state = PluginState::default();
        state.add_route("get", "/", handler(|_, _| async { Ok(()) }));
        assert!(state.handler("GET", "/").is_some());
        assert!(state.handler("POST", "/").is_none());
        state.remove_route("Get", "/");
        assert!(state.handler("GET", "/").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_middleware_values_are_taken_once() {
        let state = Arc::new(PluginState::default());
        let id = RequestId::generate();
        let values = BTreeMap::from([("token".to_string(), Value::from("t"))]);
        state.stash_middleware_values(id.clone(), values.clone(), MIDDLEWARE_VALUES_GRACE);

        assert_eq!(state.take_middleware_values(&id), values);
        assert!(state.take_middleware_values(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_middleware_values_expire() {
        let state = Arc::new(PluginState::default());
        let id = RequestId::generate();
        let values = BTreeMap::from([("token".to_string(), Value::from("old"))]);
        state.stash_middleware_values(id.clone(), values, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(state.take_middleware_values(&id).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_spares_a_newer_stash() {
        let state = Arc::new(PluginState::default());
        let id = RequestId::generate();
        let old = BTreeMap::from([("token".to_string(), Value::from("old"))]);
        let new = BTreeMap::from([("token".to_string(), Value::from("new"))]);
        state.stash_middleware_values(id.clone(), old, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(500)).await;
        state.stash_middleware_values(id.clone(), new.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(state.take_middleware_values(&id), new);
    }

    #[test]
    fn test_render_funcs_live_until_guard_drops() {
        let state = Arc::new(PluginState::default());
        let id = RequestId::generate();
        let guard = state.register_render_funcs(id.clone(), FuncMap::new().with_fn("one", || 1_i64));
        assert!(state.render_funcs(&id).unwrap().contains("one"));
        drop(guard);
        assert!(state.render_funcs(&id).is_none());
    }
}
