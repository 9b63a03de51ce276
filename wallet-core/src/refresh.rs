//! Refresh Plumbing
//!
//! Shared by the balance aggregator and the transaction merger:
//! - [`Coalescer`] collapses concurrent requests for the same key into one
//!   in-flight future
//! - [`Selection`] and [`Ticket`] detect results that were overtaken by a
//!   selection change or a pull while in flight
//! - [`ChainFetcher`] performs the batched, retried, coalesced lookup

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::chain::{ChainBackend, MultiAddress};
use crate::config::RetryPolicy;
use crate::error::Result;
use crate::registry::{AccountRegistry, Selector};
use crate::remote::with_retry;

/// What a refresh recomputes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefreshKind {
    Balance,
    Transactions,
}

type InflightMap<K, V> = HashMap<K, Shared<BoxFuture<'static, Result<V>>>>;

/// At most one in-flight future per key. Later callers attach to the
/// running one and receive a clone of its outcome.
pub struct Coalescer<K, V> {
    inflight: Arc<Mutex<InflightMap<K, V>>>,
}

impl<K, V> Default for Coalescer<K, V> {
    fn default() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> Coalescer<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Await the in-flight future for `key`, starting one with `start` if
    /// there is none.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let shared = {
            let mut inflight = lock(&self.inflight);
            match inflight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight request for {:?}", key);
                    existing.clone()
                }
                None => {
                    let map = Arc::clone(&self.inflight);
                    let done_key = key.clone();
                    let future = start();
                    let shared = async move {
                        let result = future.await;
                        lock(&map).remove(&done_key);
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, shared.clone());
                    shared
                }
            }
        };
        shared.await
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The current selection and a counter bumped on every change
#[derive(Debug, Clone)]
pub struct Selection {
    inner: Arc<Mutex<(Selector, u64)>>,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new((Selector::All, 0))),
        }
    }
}

impl Selection {
    pub fn current(&self) -> Selector {
        lock(&self.inner).0
    }

    pub fn epoch(&self) -> u64 {
        lock(&self.inner).1
    }

    /// Change the selection. Returns `false` if it was already selected.
    pub fn select(&self, selector: Selector) -> bool {
        let mut inner = lock(&self.inner);
        if inner.0 == selector {
            return false;
        }
        inner.0 = selector;
        inner.1 += 1;
        debug!("Selection changed to {} (epoch {})", selector, inner.1);
        true
    }
}

/// Captures what a refresh was started against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    epoch: u64,
    guid: Uuid,
    save_version: u64,
}

impl Ticket {
    pub fn issue(selection: &Selection, registry: &AccountRegistry) -> Result<Self> {
        let (guid, save_version) = registry.view(|w| (w.guid, w.save_version))?;
        Ok(Self {
            epoch: selection.epoch(),
            guid,
            save_version,
        })
    }

    /// Neither the selection nor the wallet changed since issue
    pub fn is_current(&self, selection: &Selection, registry: &AccountRegistry) -> bool {
        match Self::issue(selection, registry) {
            Ok(now) => now == *self,
            Err(_) => false,
        }
    }
}

/// Batched chain lookups for a selection, retried and coalesced
pub struct ChainFetcher {
    registry: AccountRegistry,
    backend: Arc<dyn ChainBackend>,
    retry: RetryPolicy,
    coalescer: Coalescer<(Selector, RefreshKind), Arc<MultiAddress>>,
}

impl ChainFetcher {
    pub fn new(registry: AccountRegistry, backend: Arc<dyn ChainBackend>, retry: RetryPolicy) -> Self {
        Self {
            registry,
            backend,
            retry,
            coalescer: Coalescer::new(),
        }
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub async fn fetch(&self, selector: Selector, kind: RefreshKind) -> Result<Arc<MultiAddress>> {
        let addresses = self.registry.addresses(selector)?;
        let backend = Arc::clone(&self.backend);
        let retry = self.retry.clone();

        self.coalescer
            .run((selector, kind), move || async move {
                debug!(
                    "{:?} lookup for {} over {} addresses",
                    kind,
                    selector,
                    addresses.len()
                );
                with_retry(&retry, "multiaddr", || backend.multiaddr(&addresses))
                    .await
                    .map(Arc::new)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WalletError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_requests_share_one_call() {
        let coalescer: Coalescer<&'static str, u32> = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let start = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<u32, WalletError>(7)
            }
        };

        let (a, b) = tokio::join!(
            coalescer.run("balance", start(calls.clone())),
            coalescer.run("balance", start(calls.clone()))
        );

        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let coalescer: Coalescer<&'static str, u32> = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let start = |calls: Arc<AtomicUsize>, value: u32| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, WalletError>(value)
            }
        };

        let (a, b) = tokio::join!(
            coalescer.run("balance", start(calls.clone(), 1)),
            coalescer.run("transactions", start(calls.clone(), 2))
        );

        assert_eq!((a.unwrap(), b.unwrap()), (1, 2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_finished_requests_start_fresh() {
        let coalescer: Coalescer<&'static str, u32> = Coalescer::new();
        assert_eq!(coalescer.run("k", || async { Ok::<u32, WalletError>(1) }).await.unwrap(), 1);
        assert_eq!(coalescer.run("k", || async { Ok::<u32, WalletError>(2) }).await.unwrap(), 2);
    }

    #[test]
    fn test_selection_epochs() {
        let selection = Selection::default();
        assert_eq!(selection.current(), Selector::All);
        assert!(!selection.select(Selector::All));
        assert!(selection.select(Selector::Hd(0)));
        assert_eq!(selection.epoch(), 1);
    }
}
