// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! In-process directory backend.

use super::{CallResult, DeregisterRequest, DirectoryBackend, HeartbeatRequest, LbPolicy, RegisterRequest, RegisterResponse, RouteRequest, RouteRule, WatchEvent};
use crate::config::SessionConfig;
use crate::error::DirectoryError;
use crate::instance::{DirectoryInstance, DEFAULT_WEIGHT};
use crate::key::{InstanceKey, ServiceDescriptor};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use dashmap::DashMap;
use faststr::FastStr;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

const DEFAULT_WATCH_CAPACITY: usize = 64;

/// A [`DirectoryBackend`] kept entirely in memory.
///
/// Clones share the same directory. Besides the backend contract it exposes hooks to
/// simulate changes made by other processes ([`MemoryDirectory::upsert`],
/// [`MemoryDirectory::remove`]) and counters to observe what this layer sent.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

struct Inner {
    services: DashMap<ServiceDescriptor, Vec<Arc<DirectoryInstance>>>,
    channels: DashMap<ServiceDescriptor, (Sender<WatchEvent>, InactiveReceiver<WatchEvent>)>,
    rules: DashMap<ServiceDescriptor, Vec<RouteRule>>,
    heartbeats: DashMap<InstanceKey, usize>,
    call_results: Mutex<Vec<CallResult>>,
    list_calls: AtomicUsize,
    list_delay_ms: AtomicU64,
    failing_lists: AtomicUsize,
    next_id: AtomicU64,
    watch_capacity: usize,
    destroyed: AtomicBool,
}

impl fmt::Debug for MemoryDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDirectory")
            .field("services", &self.inner.services.len())
            .field("watched", &self.inner.channels.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }
}

impl MemoryDirectory {
    /// Returns an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_watch_capacity(watch_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                services: DashMap::new(),
                channels: DashMap::new(),
                rules: DashMap::new(),
                heartbeats: DashMap::new(),
                call_results: Mutex::new(Vec::new()),
                list_calls: AtomicUsize::new(0),
                list_delay_ms: AtomicU64::new(0),
                failing_lists: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
                watch_capacity: watch_capacity.max(1),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Inserts or replaces a record, as if another process changed the directory.
    pub fn upsert(&self, record: DirectoryInstance) -> Arc<DirectoryInstance> {
        let record = Arc::new(record);
        let key = record.key();
        let service = record.descriptor();
        let replaced = {
            let mut list = self.inner.services.entry(service.clone()).or_default();
            match list.iter().position(|r| r.key() == key) {
                Some(i) => {
                    list[i] = record.clone();
                    true
                },
                None => {
                    list.push(record.clone());
                    false
                },
            }
        };
        let event = if replaced {
            WatchEvent {
                updated: vec![record.clone()],
                ..Default::default()
            }
        } else {
            WatchEvent {
                added: vec![record.clone()],
                ..Default::default()
            }
        };
        self.publish(&service, event);
        record
    }

    /// Removes a record, as if another process changed the directory.
    pub fn remove(&self, service: &ServiceDescriptor, host: &str, port: u16) -> Option<Arc<DirectoryInstance>> {
        let key = InstanceKey::new(service.namespace(), service.service(), host, port);
        let removed = {
            let mut list = self.inner.services.get_mut(service)?;
            let i = list.iter().position(|r| r.key() == key)?;
            list.remove(i)
        };
        self.inner.heartbeats.remove(&key);
        self.publish(
            service,
            WatchEvent {
                removed: vec![removed.clone()],
                ..Default::default()
            },
        );
        Some(removed)
    }

    /// Replaces the routing rules of a service.
    pub fn set_rules(&self, service: ServiceDescriptor, rules: Vec<RouteRule>) {
        self.inner.rules.insert(service, rules);
    }

    /// Drops every watch subscription of a service, as a backend restart would.
    pub fn close_watch(&self, service: &ServiceDescriptor) {
        if let Some((_, (tx, _))) = self.inner.channels.remove(service) {
            tx.close();
        }
    }

    /// Delays every list call, to widen race windows.
    pub fn set_list_delay(&self, delay: Duration) {
        self.inner.list_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Makes the next `n` list calls fail.
    pub fn fail_next_lists(&self, n: usize) {
        self.inner.failing_lists.store(n, Ordering::Relaxed);
    }

    /// Number of list calls served so far.
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    /// Number of heartbeats received for an instance.
    pub fn heartbeat_count(&self, key: &InstanceKey) -> usize {
        self.inner.heartbeats.get(key).map_or(0, |n| *n)
    }

    /// Call results received so far.
    pub fn call_results(&self) -> Vec<CallResult> {
        self.inner.call_results.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Current records of a service.
    pub fn snapshot(&self, service: &ServiceDescriptor) -> Vec<Arc<DirectoryInstance>> {
        self.inner.services.get(service).map(|list| list.value().clone()).unwrap_or_default()
    }

    /// Number of active watch subscriptions of a service.
    pub fn watchers(&self, service: &ServiceDescriptor) -> usize {
        self.inner.channels.get(service).map_or(0, |channel| channel.0.receiver_count())
    }

    /// Whether [`DirectoryBackend::destroy`] was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    fn publish(&self, service: &ServiceDescriptor, event: WatchEvent) {
        if let Some(channel) = self.inner.channels.get(service) {
            // No active subscriber is not an error.
            let _ = channel.0.try_broadcast(event);
        }
    }

    fn find(&self, service: &ServiceDescriptor, host: &str, port: u16) -> Option<Arc<DirectoryInstance>> {
        let key = InstanceKey::new(service.namespace(), service.service(), host, port);
        let list = self.inner.services.get(service)?;
        let found = list.iter().find(|r| r.key() == key).cloned();
        found
    }

    fn not_found(request: &DeregisterRequest) -> DirectoryError {
        DirectoryError::Backend(FastStr::from_string(format!("instance {}:{} of {} is not registered", request.host, request.port, request.service)))
    }
}

impl DirectoryBackend for MemoryDirectory {
    async fn connect(config: &SessionConfig) -> Result<Self, DirectoryError> {
        if config.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(DirectoryError::BackendUnavailable(FastStr::from_static_str("empty endpoint")));
        }
        Ok(Self::with_watch_capacity(config.watch_buffer))
    }

    fn list_instances<'s>(&'s self, service: &'s ServiceDescriptor) -> impl Future<Output = Result<Vec<Arc<DirectoryInstance>>, DirectoryError>> + Send {
        async move {
            self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
            let delay = self.inner.list_delay_ms.load(Ordering::Relaxed);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            let failing = self.inner.failing_lists.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if failing.is_ok() {
                return Err(DirectoryError::Backend(FastStr::from_string(format!("list {service} failed"))));
            }
            Ok(self.snapshot(service))
        }
    }

    fn watch_service<'s>(&'s self, service: &'s ServiceDescriptor) -> impl Future<Output = Result<Receiver<WatchEvent>, DirectoryError>> + Send {
        async move {
            if self.is_destroyed() {
                return Err(DirectoryError::Backend(FastStr::from_static_str("directory destroyed")));
            }
            let channel = self.inner.channels.entry(service.clone()).or_insert_with(|| {
                let (mut tx, rx) = async_broadcast::broadcast(self.inner.watch_capacity);
                tx.set_overflow(true);
                (tx, rx.deactivate())
            });
            Ok(channel.1.activate_cloned())
        }
    }

    fn process_routers(&self, request: &RouteRequest) -> Result<Vec<Arc<DirectoryInstance>>, DirectoryError> {
        let mut candidates: Vec<Arc<DirectoryInstance>> = request.instances.iter().filter(|r| r.is_available() && r.matches(&request.dst_metadata)).cloned().collect();
        if let Some(dst) = &request.dst {
            if let Some(rules) = self.inner.rules.get(dst) {
                let rule = rules.iter().find(|rule| rule.source.iter().all(|(k, v)| request.src_metadata.get(k) == Some(v)));
                if let Some(rule) = rule {
                    candidates.retain(|r| r.matches(&rule.destination));
                }
            }
        }
        Ok(candidates)
    }

    fn process_load_balance(&self, candidates: &[Arc<DirectoryInstance>], policy: LbPolicy) -> Result<Arc<DirectoryInstance>, DirectoryError> {
        if candidates.is_empty() {
            return Err(DirectoryError::RoutingFailure(FastStr::from_static_str("no candidate to balance")));
        }
        let mut rng = rand::thread_rng();
        match policy {
            LbPolicy::Random => Ok(candidates[rng.gen_range(0..candidates.len())].clone()),
            LbPolicy::WeightedRandom => {
                let sum: u64 = candidates.iter().map(|r| balance_weight(r)).sum();
                let mut point = rng.gen_range(0..sum);
                for candidate in candidates {
                    let weight = balance_weight(candidate);
                    if point < weight {
                        return Ok(candidate.clone());
                    }
                    point -= weight;
                }
                Err(DirectoryError::RoutingFailure(FastStr::from_static_str("weighted pick out of range")))
            },
        }
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse, DirectoryError> {
        let existing = self.find(&request.service, &request.host, request.port);
        let existed = existing.is_some();
        let instance_id = match existing {
            Some(record) => record.id.clone(),
            None => FastStr::from_string(format!("ins-{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst))),
        };
        let mut record = DirectoryInstance::new(request.service.namespace().to_string(), request.service.service().to_string(), request.host, request.port)
            .with_id(instance_id.clone())
            .with_weight(request.weight)
            .with_protocol(request.protocol);
        record.metadata = request.metadata;
        debug!("[LOGIMESH] memory directory registered {} as {instance_id}", record.key());
        self.upsert(record);
        Ok(RegisterResponse { instance_id, existed })
    }

    async fn deregister(&self, request: DeregisterRequest) -> Result<(), DirectoryError> {
        match self.remove(&request.service, &request.host, request.port) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(&request)),
        }
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<(), DirectoryError> {
        let record = self.find(&request.service, &request.host, request.port).ok_or_else(|| Self::not_found(&request))?;
        *self.inner.heartbeats.entry(record.key()).or_default() += 1;
        Ok(())
    }

    async fn report_call_result(&self, result: CallResult) -> Result<(), DirectoryError> {
        self.inner
            .call_results
            .lock()
            .map_err(|_| DirectoryError::Backend(FastStr::from_static_str("call result log poisoned")))?
            .push(result);
        Ok(())
    }

    async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for channel in self.inner.channels.iter() {
            channel.0.close();
        }
        self.inner.channels.clear();
    }
}

#[inline]
fn balance_weight(record: &DirectoryInstance) -> u64 {
    if record.weight <= 0 {
        DEFAULT_WEIGHT as u64
    } else {
        record.weight as u64
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryDirectory;
    use crate::backend::{DirectoryBackend, LbPolicy, RouteRequest, RouteRule};
    use crate::error::DirectoryError;
    use crate::instance::DirectoryInstance;
    use crate::key::ServiceDescriptor;
    use assert_matches::assert_matches;
    use faststr::FastStr;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn selector(k: &'static str, v: &'static str) -> HashMap<FastStr, FastStr> {
        HashMap::from([(FastStr::from_static_str(k), FastStr::from_static_str(v))])
    }

    #[tokio::test]
    async fn test_watch_receives_upserts() {
        let dir = MemoryDirectory::new();
        let orders = ServiceDescriptor::new("default", "orders");
        let mut rx = dir.watch_service(&orders).await.unwrap();

        dir.upsert(DirectoryInstance::new("default", "orders", "10.0.0.1", 80));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.added.len(), 1);

        dir.upsert(DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_weight(3));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.updated[0].weight, 3);

        dir.remove(&orders, "10.0.0.1", 80).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.removed.len(), 1);
        assert!(dir.snapshot(&orders).is_empty());
    }

    #[test]
    fn test_rules_and_dst_metadata() {
        let dir = MemoryDirectory::new();
        let orders = ServiceDescriptor::new("default", "orders");
        let a = Arc::new(DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_metadata("env", "canary"));
        let b = Arc::new(DirectoryInstance::new("default", "orders", "10.0.0.2", 80).with_metadata("env", "stable"));
        let down = Arc::new(DirectoryInstance::new("default", "orders", "10.0.0.3", 80).with_healthy(false));
        dir.set_rules(
            orders.clone(),
            vec![RouteRule {
                source: selector("lane", "canary"),
                destination: selector("env", "canary"),
            }],
        );
        let mut request = RouteRequest {
            dst: Some(orders),
            instances: vec![a.clone(), b.clone(), down],
            ..Default::default()
        };
        assert_eq!(dir.process_routers(&request).unwrap(), vec![a.clone(), b.clone()]);

        request.src_metadata = selector("lane", "canary");
        assert_eq!(dir.process_routers(&request).unwrap(), vec![a]);

        request.src_metadata.clear();
        request.dst_metadata = selector("env", "stable");
        assert_eq!(dir.process_routers(&request).unwrap(), vec![b]);
    }

    #[test]
    fn test_load_balance() {
        let dir = MemoryDirectory::new();
        assert_matches!(dir.process_load_balance(&[], LbPolicy::WeightedRandom), Err(DirectoryError::RoutingFailure(_)));

        let only = Arc::new(DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_weight(0));
        for policy in [LbPolicy::WeightedRandom, LbPolicy::Random] {
            assert_eq!(dir.process_load_balance(&[only.clone()], policy).unwrap(), only);
        }
    }

    #[tokio::test]
    async fn test_fail_next_lists() {
        let dir = MemoryDirectory::new();
        let orders = ServiceDescriptor::new("default", "orders");
        dir.fail_next_lists(1);
        assert_matches!(dir.list_instances(&orders).await, Err(DirectoryError::Backend(_)));
        assert!(dir.list_instances(&orders).await.unwrap().is_empty());
        assert_eq!(dir.list_calls(), 2);
    }
}
