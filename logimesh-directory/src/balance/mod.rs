// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Balancing over cached routing bundles.
//!
//! The [`Balancer`] keeps one [`RoutingBundle`] per cache key. Concurrent misses on a key
//! share a single backend fetch; watch changes replace bundles wholesale; a picker holds
//! one bundle for the lifetime of one call.

mod bundle;
mod cache;
mod picker;

pub use bundle::RoutingBundle;
pub use picker::Picker;

use crate::backend::{DirectoryBackend, LbPolicy};
use crate::config::RouteOptions;
use crate::error::DirectoryError;
use crate::key::ServiceDescriptor;
use crate::resolver::{Change, ResolveResult};
use crate::session::DirectorySession;
use crate::task::Supervised;
use async_broadcast::{Receiver, RecvError};
use cache::CoalescedCache;
use faststr::FastStr;
use picker::PickerPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hands out pickers over cached routing bundles.
pub struct Balancer<B> {
    session: DirectorySession<B>,
    cache: Arc<CoalescedCache<RoutingBundle>>,
    pool: Arc<PickerPool<B>>,
    policy: LbPolicy,
    root: CancellationToken,
}

impl<B> Clone for Balancer<B> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
            cache: self.cache.clone(),
            pool: self.pool.clone(),
            policy: self.policy,
            root: self.root.clone(),
        }
    }
}

impl<B: DirectoryBackend> Balancer<B> {
    /// Returns a balancer with an empty cache and the weighted random policy.
    pub fn new(session: DirectorySession<B>) -> Self {
        Self {
            session,
            cache: Arc::new(CoalescedCache::default()),
            pool: Arc::new(PickerPool::default()),
            policy: LbPolicy::default(),
            root: CancellationToken::new(),
        }
    }

    /// Sets the load balance policy passed to the backend.
    pub fn with_policy(mut self, policy: LbPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name of the balancer.
    pub fn name(&self) -> &'static str {
        "logimesh-directory"
    }

    /// Returns a picker over the bundle cached for the result's cache key, building it on a miss.
    pub async fn get_picker(&self, result: &ResolveResult) -> Result<Picker<B>, DirectoryError> {
        let descriptor = ServiceDescriptor::from_cache_key(&result.cache_key)?;
        let bundle = self.build(descriptor, result.cacheable, result.options.clone()).await?;
        Ok(self.pool.acquire(bundle, self.session.clone(), self.policy))
    }

    /// Returns the bundle of a service, fetching it from the backend on a miss.
    ///
    /// A fetched bundle routes with `options`, usually [`Resolver::options`](crate::resolver::Resolver::options)
    /// of the resolver serving the same key; a cached bundle keeps the options it was built with.
    /// Concurrent misses on one key share a single fetch and observe the same bundle.
    /// Non-cacheable services are fetched on every call.
    pub async fn fetch_bundle(&self, descriptor: &ServiceDescriptor, cacheable: bool, options: Arc<RouteOptions>) -> Result<Arc<RoutingBundle>, DirectoryError> {
        self.build(descriptor.clone(), cacheable, options).await
    }

    async fn build(&self, descriptor: ServiceDescriptor, cacheable: bool, options: Arc<RouteOptions>) -> Result<Arc<RoutingBundle>, DirectoryError> {
        let cache_key = descriptor.cache_key();
        let session = self.session.clone();
        self.cache
            .get_or_build(&cache_key, cacheable, move || async move {
                let records = session.backend().list_instances(&descriptor).await?;
                if records.is_empty() {
                    return Err(DirectoryError::NoInstances(descriptor.description()));
                }
                debug!("[LOGIMESH] built routing bundle of {descriptor} with {} instances", records.len());
                Ok(RoutingBundle::from_records(descriptor, records, options))
            })
            .await
    }

    /// Replaces the cached bundle with the change's snapshot.
    pub fn rebalance(&self, change: &Change) -> Result<(), DirectoryError> {
        if !change.result.cacheable {
            return Ok(());
        }
        let bundle = RoutingBundle::from_result(&change.result)?;
        self.cache.rebalance(change.result.cache_key.clone(), Arc::new(bundle));
        Ok(())
    }

    /// Drops the cached bundle of the change's service.
    pub fn delete(&self, change: &Change) {
        if change.result.cacheable {
            self.cache.remove(&change.result.cache_key);
        }
    }

    /// Re-fetches a bundle from the backend.
    ///
    /// The new bundle keeps the route options of the cached one, or the session's when
    /// nothing is cached. On failure the cached bundle, when there is one, stays and is returned.
    pub async fn refresh(&self, cache_key: &str) -> Result<Arc<RoutingBundle>, DirectoryError> {
        let descriptor = ServiceDescriptor::from_cache_key(cache_key)?;
        let listed = self.session.backend().list_instances(&descriptor).await;
        match listed {
            Ok(records) if !records.is_empty() => {
                let options = match self.cache.get(cache_key) {
                    Some(cached) => cached.shared_options(),
                    None => Arc::new(self.session.config().route.clone()),
                };
                let bundle = Arc::new(RoutingBundle::from_records(descriptor, records, options));
                self.cache.rebalance(FastStr::new(cache_key), bundle.clone());
                Ok(bundle)
            },
            other => {
                let e = match other {
                    Err(e) => e,
                    Ok(_) => DirectoryError::NoInstances(descriptor.description()),
                };
                match self.cache.get(cache_key) {
                    Some(stale) => {
                        warn!("[LOGIMESH] refresh {cache_key} failed, keeping the cached bundle: {e}");
                        Ok(stale)
                    },
                    None => Err(e),
                }
            },
        }
    }

    /// The cached bundle of a key, if any.
    pub fn cached(&self, cache_key: &str) -> Option<Arc<RoutingBundle>> {
        self.cache.get(cache_key)
    }

    /// Number of idle pickers waiting for reuse.
    pub fn idle_pickers(&self) -> usize {
        self.pool.idle()
    }

    /// Applies watch changes to the cache until the channel closes or the balancer is closed.
    ///
    /// An empty snapshot deletes the bundle, anything else replaces it.
    pub fn follow(&self, mut changes: Receiver<Change>) -> Supervised {
        let balancer = self.clone();
        Supervised::spawn(&self.root, move |token| async move {
            loop {
                let change = tokio::select! {
                    _ = token.cancelled() => break,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) if change.result.is_empty() => balancer.delete(&change),
                    Ok(change) => {
                        if let Err(e) = balancer.rebalance(&change) {
                            warn!("[LOGIMESH] rebalance {} failed: {e}", change.cache_key());
                        }
                    },
                    // Every change carries the full snapshot, the next one catches up.
                    Err(RecvError::Overflowed(n)) => debug!("[LOGIMESH] balancer skipped {n} changes"),
                    Err(RecvError::Closed) => break,
                }
            }
            info!("[LOGIMESH] balancer stopped following changes");
        })
    }

    /// Stops every [`Balancer::follow`] task of this balancer and its clones.
    pub fn close(&self) {
        self.root.cancel();
    }
}
