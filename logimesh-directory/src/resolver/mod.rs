// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Service resolution and change watching.
//!
//! [`Resolver::resolve`] answers with a point-in-time snapshot; [`Resolver::watch`] keeps a
//! snapshot in a supervised loop and broadcasts a [`Change`] per backend event.
//!
//! Since the balancer caches resolution results, every change of the instance set must be
//! dispatched as a [`Change`] carrying the full snapshot as well as the delta.

mod watch;

use crate::backend::DirectoryBackend;
use crate::config::RouteOptions;
use crate::error::DirectoryError;
use crate::instance::{DirectoryInstance, Instance};
use crate::key::{InstanceKey, ServiceDescriptor};
use crate::session::DirectorySession;
use crate::task::Supervised;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A resolved, versioned instance set.
///
/// `records[i]` is the backend record `instances[i]` was adapted from.
#[derive(Debug, Clone)]
pub struct ResolveResult {
    /// whether the result may be shared through the balancer cache
    pub cacheable: bool,
    /// `logimesh:namespace:service`
    pub cache_key: FastStr,
    /// framework-facing instances
    pub instances: Vec<Arc<Instance>>,
    /// backend records, index-aligned with `instances`
    pub records: Vec<Arc<DirectoryInstance>>,
    /// route selectors of the resolver that produced the result
    pub options: Arc<RouteOptions>,
}

impl ResolveResult {
    /// Adapts a backend snapshot.
    pub fn from_records(cache_key: FastStr, records: Vec<Arc<DirectoryInstance>>, options: Arc<RouteOptions>) -> Self {
        let instances = records.iter().map(|r| Arc::new(Instance::from_record(r))).collect();
        Self {
            cacheable: true,
            cache_key,
            instances,
            records,
            options,
        }
    }

    /// Whether no instance remains.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// The difference between two snapshots of one service.
#[derive(Debug, Clone)]
pub struct Change {
    /// the full snapshot after the change
    pub result: ResolveResult,
    /// instances that appeared
    pub added: Vec<Arc<Instance>>,
    /// post-change state of instances whose record changed
    pub updated: Vec<Arc<Instance>>,
    /// instances that disappeared
    pub removed: Vec<Arc<Instance>>,
}

impl Change {
    /// Cache key of the changed service.
    #[inline]
    pub fn cache_key(&self) -> &FastStr {
        &self.result.cache_key
    }
}

/// [`diff`] compares two snapshots by [`InstanceKey`].
///
/// A key present in both with a different record is reported as updated. The bool tells
/// whether anything changed; when it is false the [`Change`] should not be dispatched.
pub fn diff(cache_key: FastStr, prev: &ResolveResult, next: &ResolveResult) -> (Change, bool) {
    let prev_index: HashMap<InstanceKey, usize> = prev.records.iter().enumerate().map(|(i, r)| (r.key(), i)).collect();
    let next_keys: Vec<InstanceKey> = next.records.iter().map(|r| r.key()).collect();

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for (i, key) in next_keys.iter().enumerate() {
        match prev_index.get(key) {
            None => added.push(next.instances[i].clone()),
            Some(&j) if prev.records[j] != next.records[i] => updated.push(next.instances[i].clone()),
            Some(_) => {},
        }
    }
    let next_set: std::collections::HashSet<&InstanceKey> = next_keys.iter().collect();
    let removed = prev
        .records
        .iter()
        .enumerate()
        .filter(|(_, r)| !next_set.contains(&r.key()))
        .map(|(i, _)| prev.instances[i].clone())
        .collect::<Vec<_>>();

    let changed = !added.is_empty() || !updated.is_empty() || !removed.is_empty();
    let mut result = next.clone();
    result.cache_key = cache_key;
    (Change { result, added, updated, removed }, changed)
}

/// Resolves service names against the directory.
#[derive(Debug)]
pub struct Resolver<B> {
    session: DirectorySession<B>,
    namespace: FastStr,
    options: Arc<RouteOptions>,
    root: CancellationToken,
    watches: Mutex<Vec<Supervised>>,
}

impl<B: DirectoryBackend> Resolver<B> {
    /// Creates a resolver using the session's namespace and route options.
    pub fn new(session: DirectorySession<B>) -> Self {
        let namespace = FastStr::new(&session.config().namespace);
        let options = Arc::new(session.config().route.clone());
        Self {
            session,
            namespace,
            options,
            root: CancellationToken::new(),
            watches: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the route selectors.
    pub fn with_options(mut self, options: RouteOptions) -> Self {
        self.options = Arc::new(options);
        self
    }

    /// Replaces the default namespace.
    pub fn with_namespace(mut self, namespace: impl Into<FastStr>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Name of the resolver.
    pub fn name(&self) -> &'static str {
        "logimesh-directory"
    }

    /// Route selectors applied to results of this resolver.
    pub fn options(&self) -> &Arc<RouteOptions> {
        &self.options
    }

    /// Returns the description `namespace:service` of a framework-supplied service name.
    ///
    /// The destination namespace of the route options wins over the resolver namespace.
    pub fn target(&self, service_name: &str) -> FastStr {
        let namespace = self.options.dst_namespace.as_deref().unwrap_or(self.namespace.as_str());
        ServiceDescriptor::new(FastStr::new(namespace), FastStr::new(service_name)).description()
    }

    /// Parses a description, filling in the resolver namespace.
    pub fn descriptor(&self, description: &str) -> Result<ServiceDescriptor, DirectoryError> {
        ServiceDescriptor::from_description(description, &self.namespace)
    }

    /// Resolves the current instances of a service.
    ///
    /// An empty instance set is [`DirectoryError::NoInstances`]: the service has no endpoint
    /// right now, which callers may retry.
    pub async fn resolve(&self, description: &str) -> Result<ResolveResult, DirectoryError> {
        let descriptor = self.descriptor(description)?;
        let records = self.session.backend().list_instances(&descriptor).await?;
        if records.is_empty() {
            return Err(DirectoryError::NoInstances(descriptor.description()));
        }
        debug!("[LOGIMESH] resolved {} instances for {descriptor}", records.len());
        Ok(ResolveResult::from_records(descriptor.cache_key(), records, self.options.clone()))
    }

    /// See [`diff`].
    #[inline]
    pub fn diff(&self, cache_key: FastStr, prev: &ResolveResult, next: &ResolveResult) -> (Change, bool) {
        diff(cache_key, prev, next)
    }

    /// Starts watching a service.
    ///
    /// The loop runs until [`Resolver::close`], or until every receiver is dropped.
    /// Subscribers that fall behind lose the oldest changes, every [`Change`] carries the full snapshot.
    pub fn watch(&self, description: &str) -> Result<Receiver<Change>, DirectoryError> {
        let descriptor = self.descriptor(description)?;
        let mut watches = self.watches.lock().map_err(|_| DirectoryError::Backend(FastStr::from_static_str("resolver watch list poisoned")))?;
        if self.root.is_cancelled() {
            return Err(DirectoryError::Backend(FastStr::from_static_str("resolver closed")));
        }
        let (mut tx, rx) = async_broadcast::broadcast(self.session.config().watch_buffer.max(1));
        tx.set_overflow(true);
        let session = self.session.clone();
        let options = self.options.clone();
        let task = Supervised::spawn(&self.root, move |token| watch::run(session, descriptor, options, tx, token));
        watches.retain(|task| !task.is_finished());
        watches.push(task);
        Ok(rx)
    }

    /// Stops and joins every watch loop. Later calls do nothing.
    pub async fn close(&self) {
        self.root.cancel();
        let tasks = match self.watches.lock() {
            Ok(mut watches) => std::mem::take(&mut *watches),
            Err(e) => {
                warn!("[LOGIMESH] resolver watch list poisoned");
                std::mem::take(&mut *e.into_inner())
            },
        };
        for task in tasks {
            task.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{diff, ResolveResult};
    use crate::config::RouteOptions;
    use crate::instance::DirectoryInstance;
    use faststr::FastStr;
    use std::sync::Arc;

    fn result(records: Vec<DirectoryInstance>) -> ResolveResult {
        ResolveResult::from_records(
            FastStr::from_static_str("logimesh:default:orders"),
            records.into_iter().map(Arc::new).collect(),
            Arc::new(RouteOptions::default()),
        )
    }

    fn record(host: &'static str, weight: i32) -> DirectoryInstance {
        DirectoryInstance::new("default", "orders", host, 80).with_weight(weight)
    }

    #[test]
    fn test_diff() {
        let prev = result(vec![record("10.0.0.1", 1), record("10.0.0.2", 1)]);
        let next = result(vec![record("10.0.0.2", 7), record("10.0.0.3", 1)]);
        let (change, changed) = diff(prev.cache_key.clone(), &prev, &next);
        assert!(changed);
        assert_eq!(change.added.iter().map(|i| i.address.as_str()).collect::<Vec<_>>(), vec!["10.0.0.3:80"]);
        assert_eq!(change.updated.len(), 1);
        assert_eq!(change.updated[0].weight, 7);
        assert_eq!(change.removed.iter().map(|i| i.address.as_str()).collect::<Vec<_>>(), vec!["10.0.0.1:80"]);
        assert_eq!(change.result.instances.len(), 2);
    }

    #[test]
    fn test_diff_unchanged() {
        let prev = result(vec![record("10.0.0.1", 1)]);
        let next = result(vec![record("10.0.0.1", 1)]);
        let (change, changed) = diff(prev.cache_key.clone(), &prev, &next);
        assert!(!changed);
        assert!(change.added.is_empty() && change.updated.is_empty() && change.removed.is_empty());
    }
}
