// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Registration of local endpoints.
//!
//! [`Registry::register`] announces an endpoint with a TTL and keeps it alive with a
//! heartbeat loop firing every `ttl / 2`. [`Registry::deregister`] and [`Registry::close`]
//! stop and join the loops they own.

use crate::backend::{DeregisterRequest, DirectoryBackend, HeartbeatRequest, RegisterRequest};
use crate::config::heartbeat_interval;
use crate::error::DirectoryError;
use crate::key::{InstanceKey, ServiceDescriptor};
use crate::net::split_host_port;
use crate::session::DirectorySession;
use crate::task::Supervised;
use dashmap::DashMap;
use faststr::FastStr;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to register.
#[derive(Debug, Clone, Default)]
pub struct RegistryInfo {
    /// service name, required
    pub service_name: String,
    /// `host:port` of the endpoint, required; an empty host means the local IPv4 address
    pub addr: Option<String>,
    /// raw weight; non-positive weights are served with the default weight
    pub weight: i32,
    /// instance metadata
    pub tags: HashMap<String, String>,
    /// namespace, the session namespace when absent
    pub namespace: Option<String>,
    /// TTL, the session TTL when absent
    pub ttl: Option<Duration>,
}

impl RegistryInfo {
    /// Describes `service_name` served at `addr`.
    pub fn new(service_name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            addr: Some(addr.into()),
            ..Default::default()
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Add a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the TTL.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A live registration.
///
/// The heartbeat loop belongs to the [`Registry`]; this handle can stop it on its own.
#[derive(Debug, Clone)]
pub struct Registration {
    /// registered service
    pub descriptor: ServiceDescriptor,
    /// registered host
    pub host: FastStr,
    /// registered port
    pub port: u16,
    /// announced TTL
    pub ttl: Duration,
    /// directory-assigned id
    pub instance_id: FastStr,
    token: CancellationToken,
}

impl Registration {
    /// Key of the registered instance.
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(self.descriptor.namespace(), self.descriptor.service(), &self.host, self.port)
    }

    /// Stops the heartbeat loop. Calling it again has no effect.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the heartbeat loop is still asked to run.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

/// Registers local endpoints and keeps them alive.
#[derive(Debug)]
pub struct Registry<B> {
    session: DirectorySession<B>,
    root: CancellationToken,
    heartbeats: DashMap<InstanceKey, Supervised>,
}

struct Target {
    descriptor: ServiceDescriptor,
    host: FastStr,
    port: u16,
}

impl Target {
    fn key(&self) -> InstanceKey {
        InstanceKey::new(self.descriptor.namespace(), self.descriptor.service(), &self.host, self.port)
    }

    fn request(&self) -> DeregisterRequest {
        DeregisterRequest {
            service: self.descriptor.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }
}

impl<B: DirectoryBackend> Registry<B> {
    /// Creates a registry over a session.
    pub fn new(session: DirectorySession<B>) -> Self {
        Self {
            session,
            root: CancellationToken::new(),
            heartbeats: DashMap::new(),
        }
    }

    /// Always true; registration failures surface from [`Registry::register`].
    pub fn is_available(&self) -> bool {
        true
    }

    /// Number of heartbeat loops not yet asked to stop.
    pub fn active(&self) -> usize {
        self.heartbeats.iter().filter(|task| !task.is_cancelled()).count()
    }

    fn target(&self, info: &RegistryInfo) -> Result<Target, DirectoryError> {
        if info.service_name.is_empty() {
            return Err(DirectoryError::InvalidRegistration(FastStr::from_static_str("missing service name")));
        }
        let addr = info.addr.as_deref().filter(|addr| !addr.is_empty()).ok_or_else(|| DirectoryError::InvalidRegistration(FastStr::from_static_str("missing address")))?;
        let (host, port) = split_host_port(addr)?;
        let namespace = info.namespace.as_deref().unwrap_or(self.session.config().namespace.as_str());
        Ok(Target {
            descriptor: ServiceDescriptor::new(FastStr::new(namespace), FastStr::new(&info.service_name)),
            host,
            port,
        })
    }

    /// Registers an endpoint and starts its heartbeat loop.
    ///
    /// Registering the same endpoint again replaces its heartbeat loop. A closed registry
    /// registers nothing.
    pub async fn register(&self, info: &RegistryInfo) -> Result<Registration, DirectoryError> {
        let target = self.target(info)?;
        if self.root.is_cancelled() {
            return Err(DirectoryError::Backend(FastStr::from_static_str("registry closed")));
        }
        let config = self.session.config();
        let ttl = info.ttl.unwrap_or(config.ttl);
        if ttl.is_zero() {
            return Err(DirectoryError::InvalidRegistration(FastStr::from_static_str("ttl must be positive")));
        }
        let request = RegisterRequest {
            service: target.descriptor.clone(),
            host: target.host.clone(),
            port: target.port,
            protocol: FastStr::from_static_str("tcp"),
            weight: info.weight,
            metadata: info.tags.iter().map(|(k, v)| (FastStr::new(k), FastStr::new(v))).collect(),
            ttl,
        };
        let response = tokio::time::timeout(config.register_timeout, self.session.backend().register(request))
            .await
            .map_err(|_| DirectoryError::Backend(FastStr::from_string(format!("register {} timed out after {:?}", target.descriptor, config.register_timeout))))??;
        if response.existed {
            warn!("[LOGIMESH] {}:{} of {} was already registered as {}", target.host, target.port, target.descriptor, response.instance_id);
        }

        let session = self.session.clone();
        let beat = target.request();
        let task = Supervised::spawn(&self.root, move |token| heartbeat(session, beat, ttl, token));
        let registration = Registration {
            descriptor: target.descriptor.clone(),
            host: target.host.clone(),
            port: target.port,
            ttl,
            instance_id: response.instance_id,
            token: task.token().clone(),
        };
        self.heartbeats.retain(|_, task| !task.is_cancelled());
        if let Some(previous) = self.heartbeats.insert(target.key(), task) {
            previous.shutdown().await;
        }
        info!("[LOGIMESH] registered {}:{} of {} as {}", registration.host, registration.port, registration.descriptor, registration.instance_id);
        Ok(registration)
    }

    /// Stops the heartbeat loop of an endpoint and deregisters it.
    ///
    /// Deregistering an endpoint that is no longer registered returns the backend's error.
    pub async fn deregister(&self, info: &RegistryInfo) -> Result<(), DirectoryError> {
        let target = self.target(info)?;
        if let Some((_, task)) = self.heartbeats.remove(&target.key()) {
            task.shutdown().await;
        }
        self.session.backend().deregister(target.request()).await?;
        info!("[LOGIMESH] deregistered {}:{} of {}", target.host, target.port, target.descriptor);
        Ok(())
    }

    /// Stops and joins every heartbeat loop. Registrations are left to expire.
    pub async fn close(&self) {
        self.root.cancel();
        let keys: Vec<InstanceKey> = self.heartbeats.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, task)) = self.heartbeats.remove(&key) {
                task.shutdown().await;
            }
        }
    }
}

async fn heartbeat<B: DirectoryBackend>(session: DirectorySession<B>, request: HeartbeatRequest, ttl: Duration, token: CancellationToken) {
    let period = heartbeat_interval(ttl);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("[LOGIMESH] heartbeat of {}:{} every {period:?}", request.host, request.port);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                // Best effort, the next tick tries again.
                if let Err(e) = session.backend().heartbeat(request.clone()).await {
                    warn!("[LOGIMESH] heartbeat of {}:{} failed: {e}", request.host, request.port);
                }
            },
        }
    }
    debug!("[LOGIMESH] heartbeat of {}:{} stopped", request.host, request.port);
}

#[cfg(test)]
mod tests {
    use super::{Registry, RegistryInfo};
    use crate::backend::memory::MemoryDirectory;
    use crate::config::SessionConfig;
    use crate::error::DirectoryError;
    use crate::key::ServiceDescriptor;
    use crate::session::DirectorySession;
    use assert_matches::assert_matches;

    fn registry() -> Registry<MemoryDirectory> {
        Registry::new(DirectorySession::from_backend(SessionConfig::default(), MemoryDirectory::new()))
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let registry = registry();
        let no_name = RegistryInfo::new("", "10.0.0.1:80");
        assert_matches!(registry.register(&no_name).await, Err(DirectoryError::InvalidRegistration(_)));
        assert_matches!(registry.deregister(&no_name).await, Err(DirectoryError::InvalidRegistration(_)));

        let no_addr = RegistryInfo {
            service_name: "orders".to_string(),
            ..Default::default()
        };
        assert_matches!(registry.register(&no_addr).await, Err(DirectoryError::InvalidRegistration(_)));
        assert_matches!(registry.register(&RegistryInfo::new("orders", "10.0.0.1")).await, Err(DirectoryError::InvalidRegistration(_)));
        assert_eq!(registry.active(), 0);
    }

    #[tokio::test]
    async fn test_register_carries_metadata() {
        let registry = registry();
        let info = RegistryInfo::new("orders", "10.0.0.1:80").with_namespace("prod").with_weight(3).with_tag("env", "canary");
        let registration = registry.register(&info).await.unwrap();
        assert_eq!(registration.descriptor, ServiceDescriptor::new("prod", "orders"));

        let records = registry.session.backend().snapshot(&registration.descriptor);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, registration.instance_id);
        assert_eq!(records[0].weight, 3);
        assert_eq!(records[0].protocol.as_str(), "tcp");
        assert_eq!(records[0].metadata.get("env").map(|v| v.as_str()), Some("canary"));

        // Registering again keeps the id and a single loop.
        let again = registry.register(&info).await.unwrap();
        assert_eq!(again.instance_id, registration.instance_id);
        assert!(!registration.is_active());
        assert_eq!(registry.active(), 1);
        registry.close().await;
        assert_eq!(registry.active(), 0);
        assert!(!again.is_active());
    }

    #[tokio::test]
    async fn test_register_after_close() {
        let registry = registry();
        registry.close().await;
        let info = RegistryInfo::new("orders", "10.0.0.1:80");
        assert_matches!(registry.register(&info).await, Err(DirectoryError::Backend(_)));
        assert_eq!(registry.active(), 0);
        assert!(registry.session.backend().snapshot(&ServiceDescriptor::new("default", "orders")).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_registration_is_not_active() {
        let registry = registry();
        let first = registry.register(&RegistryInfo::new("orders", "10.0.0.1:80")).await.unwrap();
        let second = registry.register(&RegistryInfo::new("orders", "10.0.0.2:80")).await.unwrap();
        assert_eq!(registry.active(), 2);

        first.cancel();
        assert_eq!(registry.active(), 1);
        assert!(second.is_active());

        // The cancelled loop is pruned and the endpoint can register again.
        let again = registry.register(&RegistryInfo::new("orders", "10.0.0.1:80")).await.unwrap();
        assert!(again.is_active());
        assert_eq!(registry.active(), 2);
        assert_eq!(registry.heartbeats.len(), 2);
        registry.close().await;
    }

    #[tokio::test]
    async fn test_double_deregister() {
        let registry = registry();
        let info = RegistryInfo::new("orders", "10.0.0.1:80");
        registry.register(&info).await.unwrap();
        registry.deregister(&info).await.unwrap();
        assert_matches!(registry.deregister(&info).await, Err(DirectoryError::Backend(_)));
    }
}
