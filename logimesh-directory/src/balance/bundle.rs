// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::backend::RouteRequest;
use crate::config::RouteOptions;
use crate::error::DirectoryError;
use crate::instance::{DirectoryInstance, Instance};
use crate::key::{InstanceKey, ServiceDescriptor};
use crate::resolver::ResolveResult;
use faststr::FastStr;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a picker needs about one service, built from a single snapshot.
///
/// A bundle is never modified; a refresh builds a new one.
#[derive(Debug)]
pub struct RoutingBundle {
    descriptor: ServiceDescriptor,
    records: Vec<Arc<DirectoryInstance>>,
    instances: Vec<Arc<Instance>>,
    index: HashMap<InstanceKey, Arc<Instance>>,
    options: Arc<RouteOptions>,
}

impl RoutingBundle {
    /// Builds a bundle from backend records.
    pub fn from_records(descriptor: ServiceDescriptor, records: Vec<Arc<DirectoryInstance>>, options: Arc<RouteOptions>) -> Self {
        let instances = records.iter().map(|r| Arc::new(Instance::from_record(r))).collect();
        Self::assemble(descriptor, records, instances, options)
    }

    /// Builds a bundle from a resolution result, reusing its adapted instances.
    pub fn from_result(result: &ResolveResult) -> Result<Self, DirectoryError> {
        let descriptor = ServiceDescriptor::from_cache_key(&result.cache_key)?;
        if result.records.len() != result.instances.len() {
            return Err(DirectoryError::InvalidKey(FastStr::from_string(format!("result of {} has misaligned instances", result.cache_key))));
        }
        Ok(Self::assemble(descriptor, result.records.clone(), result.instances.clone(), result.options.clone()))
    }

    fn assemble(descriptor: ServiceDescriptor, records: Vec<Arc<DirectoryInstance>>, instances: Vec<Arc<Instance>>, options: Arc<RouteOptions>) -> Self {
        let index = records.iter().zip(&instances).map(|(r, i)| (r.key(), i.clone())).collect();
        Self {
            descriptor,
            records,
            instances,
            index,
            options,
        }
    }

    /// The service the bundle describes.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Backend records, in snapshot order.
    pub fn records(&self) -> &[Arc<DirectoryInstance>] {
        &self.records
    }

    /// Adapted instances, index-aligned with [`RoutingBundle::records`].
    pub fn instances(&self) -> &[Arc<Instance>] {
        &self.instances
    }

    /// Route selectors applied when picking.
    pub fn options(&self) -> &RouteOptions {
        &self.options
    }

    pub(crate) fn shared_options(&self) -> Arc<RouteOptions> {
        self.options.clone()
    }

    /// Looks up the instance adapted from the record with `key`.
    #[inline]
    pub fn get(&self, key: &InstanceKey) -> Option<&Arc<Instance>> {
        self.index.get(key)
    }

    /// Number of instances.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the bundle holds no instance.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn route_request(&self) -> RouteRequest {
        let options = &self.options;
        RouteRequest {
            src_namespace: options.src_namespace.as_deref().map(FastStr::new),
            src_service: options.src_service.as_deref().map(FastStr::new),
            src_metadata: options.src_selector(),
            dst: Some(self.descriptor.clone()),
            dst_metadata: options.dst_selector(),
            instances: self.records.clone(),
        }
    }
}
