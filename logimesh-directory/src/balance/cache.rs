// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::error::DirectoryError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use faststr::FastStr;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

type Build<V> = Shared<BoxFuture<'static, Result<Arc<V>, DirectoryError>>>;

/// A key to value cache where concurrent misses on one key share a single build.
///
/// A finished build is stored before any waiter observes it. [`CoalescedCache::rebalance`]
/// overwrites without consulting in-flight builds, so a build finishing after a rebalance
/// of the same key wins.
pub(crate) struct CoalescedCache<V> {
    entries: DashMap<FastStr, Arc<V>>,
    inflight: DashMap<FastStr, Build<V>>,
}

impl<V> Default for CoalescedCache<V> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
        }
    }
}

impl<V> CoalescedCache<V>
where
    V: Send + Sync + 'static,
{
    /// Returns the cached value of `key`, building it on a miss.
    ///
    /// Non-cacheable keys are built every time and never stored.
    pub(crate) async fn get_or_build<F, Fut>(self: &Arc<Self>, key: &FastStr, cacheable: bool, build: F) -> Result<Arc<V>, DirectoryError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, DirectoryError>> + Send + 'static,
    {
        if !cacheable {
            return build().await.map(Arc::new);
        }
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(building) => building.get().clone(),
            Entry::Vacant(slot) => {
                // The previous build stores its value before leaving `inflight`.
                if let Some(value) = self.get(key) {
                    return Ok(value);
                }
                let cache = Arc::clone(self);
                let key = key.clone();
                let fut = build();
                let shared = async move {
                    let built = fut.await.map(Arc::new);
                    if let Ok(value) = &built {
                        cache.entries.insert(key.clone(), value.clone());
                    }
                    cache.inflight.remove(&key);
                    built
                }
                .boxed()
                .shared();
                slot.insert(shared.clone());
                shared
            },
        };
        shared.await
    }

    /// Peeks the stored value.
    pub(crate) fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    /// Stores `value` unconditionally.
    pub(crate) fn rebalance(&self, key: FastStr, value: Arc<V>) {
        self.entries.insert(key, value);
    }

    /// Drops the stored value; the next lookup is a miss.
    pub(crate) fn remove(&self, key: &str) -> Option<Arc<V>> {
        self.entries.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::CoalescedCache;
    use crate::error::DirectoryError;
    use assert_matches::assert_matches;
    use faststr::FastStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_build_once() {
        let cache = Arc::new(CoalescedCache::<usize>::default());
        let builds = Arc::new(AtomicUsize::new(0));
        let key = FastStr::from_static_str("logimesh:default:orders");
        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let builds = builds.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(&key, true, move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(builds.fetch_add(1, Ordering::SeqCst))
                    })
                    .await
            }));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert!(Arc::ptr_eq(&cache.get(&key).unwrap(), &values[0]));
    }

    #[tokio::test]
    async fn test_failed_build_is_not_cached() {
        let cache = Arc::new(CoalescedCache::<usize>::default());
        let key = FastStr::from_static_str("k");
        let failed = cache.get_or_build(&key, true, || async { Err(DirectoryError::Backend(FastStr::from_static_str("down"))) }).await;
        assert_matches!(failed, Err(DirectoryError::Backend(_)));
        assert!(cache.get(&key).is_none());
        assert_eq!(*cache.get_or_build(&key, true, || async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_non_cacheable_and_overwrite() {
        let cache = Arc::new(CoalescedCache::<usize>::default());
        let key = FastStr::from_static_str("k");
        assert_eq!(*cache.get_or_build(&key, false, || async { Ok(1) }).await.unwrap(), 1);
        assert!(cache.get(&key).is_none());

        cache.get_or_build(&key, true, || async { Ok(2) }).await.unwrap();
        cache.rebalance(key.clone(), Arc::new(3));
        assert_eq!(*cache.get_or_build(&key, true, || async { Ok(4) }).await.unwrap(), 3);
        cache.remove(&key);
        assert_eq!(*cache.get_or_build(&key, true, || async { Ok(5) }).await.unwrap(), 5);
    }
}
