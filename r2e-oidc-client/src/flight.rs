use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::error::OidcError;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, OidcError>>>;

/// Registry of in-flight fetches, one per key.
///
/// The first caller for a key spawns the fetch on its own task; later callers
/// for the same key await the same shared result instead of starting another
/// one. The task is not tied to any caller, so dropping a waiter never cancels
/// the fetch. The key is released once the fetch finishes.
pub(crate) struct SingleFlight<K, V> {
    in_flight: Arc<DashMap<K, SharedFetch<V>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Join the fetch running for `key`, or start `fetch` if there is none.
    pub async fn run<F>(&self, key: K, fetch: F) -> Result<V, OidcError>
    where
        F: Future<Output = Result<V, OidcError>> + Send + 'static,
    {
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => {
                let in_flight = Arc::clone(&self.in_flight);
                let handle = tokio::spawn(async move {
                    let result = fetch.await;
                    in_flight.remove(&key);
                    result
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        Err(OidcError::Internal(format!("fetch task failed: {e}")))
                    })
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            }
        };
        shared.await
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
