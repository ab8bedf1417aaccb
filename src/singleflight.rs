//! Request coalescing for concurrent identical queries
//!
//! A `Group` collapses concurrent calls that share a key into one
//! computation; every caller in the collapsed group observes the same
//! result. Errors are broadcast as `Arc<anyhow::Error>` since `anyhow`
//! errors are not clonable. The in-flight entry is removed once the leader
//! finishes, so a later call with the same key computes afresh; memoization
//! is the cache's job, and callers must re-check their cache inside the
//! flight because a concurrent populator may have already won.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

type SharedResult<T> = Result<T, Arc<anyhow::Error>>;
type Flight<T> = Shared<BoxFuture<'static, SharedResult<T>>>;

/// A set of in-flight computations keyed by string.
pub struct Group<T: Clone + Send + Sync + 'static> {
    inflight: Mutex<HashMap<String, Flight<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Run `work` under `key`, or join an in-flight run of the same key.
    /// Exactly one caller's `work` executes; the rest await its shared
    /// result. Whichever caller observes completion first clears the entry,
    /// so an abandoned registrant (dropped mid-await by a timeout) cannot
    /// leave the key stuck.
    pub async fn run<F>(&self, key: &str, work: F) -> Result<T, Arc<anyhow::Error>>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut: BoxFuture<'static, SharedResult<T>> =
                        Box::pin(async move { work.await.map_err(Arc::new) });
                    let shared = fut.shared();
                    inflight.insert(key.to_string(), shared.clone());
                    shared
                }
            }
        };

        let result = flight.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight.get(key).is_some_and(|current| flight.ptr_eq(current)) {
            inflight.remove(key);
        }
        result
    }

    /// Number of keys currently in flight; used by tests.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Boxed future alias for trait-object call sites that feed a group.
pub type GroupFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

/// Turn a shared flight error back into an owned `anyhow::Error`. Sentinel
/// [`GraphError`](crate::errors::GraphError)s are reconstructed so callers
/// can still branch on them with `downcast_ref` after the broadcast.
pub fn flatten_shared(err: Arc<anyhow::Error>) -> anyhow::Error {
    match err.downcast_ref::<crate::errors::GraphError>() {
        Some(sentinel) => anyhow::Error::new(sentinel.clone()),
        None => anyhow::anyhow!("{err:#}"),
    }
}
