// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! Directory records and the runtime instances adapted from them.

use crate::key::{InstanceKey, ServiceDescriptor};
use faststr::FastStr;
use std::collections::HashMap;

/// Weight given to instances the directory reports with a non-positive weight.
pub const DEFAULT_WEIGHT: u32 = 10;

/// Tag holding the namespace of the instance.
pub const TAG_NAMESPACE: &str = "namespace";
/// Tag holding the directory-assigned instance id.
pub const TAG_INSTANCE_ID: &str = "instanceId";

/// [`Instance`] contains information of an instance from the target service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// transport protocol, e.g. `tcp`
    pub protocol: FastStr,
    /// service address, e.g. 172.0.10.10:8888
    pub address: FastStr,
    /// service weight, always positive
    pub weight: u32,
    /// service tags extension
    pub tags: HashMap<FastStr, FastStr>,
}

impl Instance {
    /// Adapts a directory record.
    ///
    /// Non-positive weights become [`DEFAULT_WEIGHT`]; the namespace and the instance id are
    /// kept as tags so call results can be reported against the record.
    pub fn from_record(record: &DirectoryInstance) -> Self {
        let weight = if record.weight <= 0 { DEFAULT_WEIGHT } else { record.weight as u32 };
        let mut tags = HashMap::with_capacity(2);
        tags.insert(FastStr::from_static_str(TAG_NAMESPACE), record.namespace.clone());
        tags.insert(FastStr::from_static_str(TAG_INSTANCE_ID), record.id.clone());
        Self {
            protocol: record.protocol.clone(),
            address: record.address(),
            weight,
            tags,
        }
    }

    /// Gets a tag.
    #[inline]
    pub fn tag(&self, key: &str) -> Option<&FastStr> {
        self.tags.get(key)
    }
}

/// An instance record as the directory backend reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInstance {
    /// directory-assigned instance id
    pub id: FastStr,
    /// namespace of the owning service
    pub namespace: FastStr,
    /// owning service
    pub service: FastStr,
    /// host name or ip
    pub host: FastStr,
    /// port
    pub port: u16,
    /// raw weight, may be zero or negative
    pub weight: i32,
    /// transport protocol
    pub protocol: FastStr,
    /// service version
    pub version: FastStr,
    /// whether the backend considers the instance healthy
    pub healthy: bool,
    /// whether the instance is isolated from traffic
    pub isolated: bool,
    /// metadata used by rule routing
    pub metadata: HashMap<FastStr, FastStr>,
}

impl DirectoryInstance {
    /// Creates a healthy record with no id, weight 0 and protocol `tcp`.
    pub fn new(namespace: impl Into<FastStr>, service: impl Into<FastStr>, host: impl Into<FastStr>, port: u16) -> Self {
        Self {
            id: FastStr::empty(),
            namespace: namespace.into(),
            service: service.into(),
            host: host.into(),
            port,
            weight: 0,
            protocol: FastStr::from_static_str("tcp"),
            version: FastStr::empty(),
            healthy: true,
            isolated: false,
            metadata: HashMap::new(),
        }
    }

    /// Sets the instance id.
    pub fn with_id(mut self, id: impl Into<FastStr>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the raw weight.
    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    /// Sets the protocol.
    pub fn with_protocol(mut self, protocol: impl Into<FastStr>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<FastStr>, value: impl Into<FastStr>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Sets the health flag.
    pub fn with_healthy(mut self, healthy: bool) -> Self {
        self.healthy = healthy;
        self
    }

    /// Sets the isolation flag.
    pub fn with_isolated(mut self, isolated: bool) -> Self {
        self.isolated = isolated;
        self
    }

    /// Key correlating this record with its runtime instance.
    pub fn key(&self) -> InstanceKey {
        InstanceKey::new(&self.namespace, &self.service, &self.host, self.port)
    }

    /// Descriptor of the owning service.
    pub fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor::new(self.namespace.clone(), self.service.clone())
    }

    /// `host:port`, with IPv6 hosts bracketed.
    pub fn address(&self) -> FastStr {
        if self.host.contains(':') {
            FastStr::from_string(format!("[{}]:{}", self.host, self.port))
        } else {
            FastStr::from_string(format!("{}:{}", self.host, self.port))
        }
    }

    /// Whether the instance may receive traffic.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.healthy && !self.isolated
    }

    /// Whether every selector entry is present in the metadata.
    pub fn matches(&self, selector: &HashMap<FastStr, FastStr>) -> bool {
        selector.iter().all(|(k, v)| self.metadata.get(k) == Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectoryInstance, Instance, DEFAULT_WEIGHT, TAG_INSTANCE_ID, TAG_NAMESPACE};

    #[test]
    fn test_non_positive_weight_is_defaulted() {
        for weight in [0, -1, i32::MIN] {
            let record = DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_weight(weight);
            assert_eq!(Instance::from_record(&record).weight, DEFAULT_WEIGHT);
        }
    }

    #[test]
    fn test_positive_weight_is_kept() {
        for weight in [1, 5, 100, i32::MAX] {
            let record = DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_weight(weight);
            assert_eq!(Instance::from_record(&record).weight, weight as u32);
        }
    }

    #[test]
    fn test_weights_zero_and_five() {
        let weights: Vec<u32> = [0, 5]
            .into_iter()
            .map(|w| Instance::from_record(&DirectoryInstance::new("default", "orders", "10.0.0.1", 80).with_weight(w)).weight)
            .collect();
        assert_eq!(weights, vec![10, 5]);
    }

    #[test]
    fn test_adapter_keeps_protocol_and_tags() {
        let record = DirectoryInstance::new("prod", "orders", "10.0.0.1", 8080).with_id("ins-1").with_protocol("grpc");
        let instance = Instance::from_record(&record);
        assert_eq!(instance.protocol.as_str(), "grpc");
        assert_eq!(instance.address.as_str(), "10.0.0.1:8080");
        assert_eq!(instance.tag(TAG_NAMESPACE).map(|v| v.as_str()), Some("prod"));
        assert_eq!(instance.tag(TAG_INSTANCE_ID).map(|v| v.as_str()), Some("ins-1"));
    }

    #[test]
    fn test_ipv6_address() {
        let record = DirectoryInstance::new("prod", "orders", "::1", 8080);
        assert_eq!(record.address().as_str(), "[::1]:8080");
    }
}
