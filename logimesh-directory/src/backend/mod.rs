// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! The directory backend contract.
//!
//! A [`DirectoryBackend`] is the remote SDK this layer orchestrates: it lists and watches
//! instances, evaluates routing rules and load balancing, keeps registrations alive and
//! collects call results. The layer never reimplements those engines.

pub mod memory;

use crate::config::SessionConfig;
use crate::error::DirectoryError;
use crate::instance::DirectoryInstance;
use crate::key::ServiceDescriptor;
use async_broadcast::Receiver;
use faststr::FastStr;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// [`DirectoryBackend`] is the most basic trait for a service directory.
pub trait DirectoryBackend: Send + Sync + 'static {
    /// Builds the connection context from the session config.
    fn connect(config: &SessionConfig) -> impl Future<Output = Result<Self, DirectoryError>> + Send
    where
        Self: Sized;

    /// Lists the current instances of a service.
    fn list_instances<'s>(&'s self, service: &'s ServiceDescriptor) -> impl Future<Output = Result<Vec<Arc<DirectoryInstance>>, DirectoryError>> + Send;

    /// Subscribes to instance changes of a service.
    ///
    /// The receiver closes when the backend drops the subscription.
    fn watch_service<'s>(&'s self, service: &'s ServiceDescriptor) -> impl Future<Output = Result<Receiver<WatchEvent>, DirectoryError>> + Send;

    /// Narrows the candidates with the routing rules matching the request.
    fn process_routers(&self, request: &RouteRequest) -> Result<Vec<Arc<DirectoryInstance>>, DirectoryError>;

    /// Chooses one of the candidates.
    fn process_load_balance(&self, candidates: &[Arc<DirectoryInstance>], policy: LbPolicy) -> Result<Arc<DirectoryInstance>, DirectoryError>;

    /// Registers an instance.
    fn register(&self, request: RegisterRequest) -> impl Future<Output = Result<RegisterResponse, DirectoryError>> + Send;

    /// Removes a registered instance.
    fn deregister(&self, request: DeregisterRequest) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Renews the TTL of a registered instance.
    fn heartbeat(&self, request: HeartbeatRequest) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Records the outcome of one call against an instance.
    fn report_call_result(&self, result: CallResult) -> impl Future<Output = Result<(), DirectoryError>> + Send;

    /// Releases the connection context.
    fn destroy(&self) -> impl Future<Output = ()> + Send;
}

/// One batch of instance changes pushed by the backend.
#[derive(Debug, Clone, Default)]
pub struct WatchEvent {
    /// records that appeared
    pub added: Vec<Arc<DirectoryInstance>>,
    /// post-change state of records that changed
    pub updated: Vec<Arc<DirectoryInstance>>,
    /// records that disappeared
    pub removed: Vec<Arc<DirectoryInstance>>,
}

impl WatchEvent {
    /// Whether the event carries no change.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Selection policy of the backend's load balancer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LbPolicy {
    /// Random, proportional to instance weight.
    #[default]
    WeightedRandom,
    /// Uniformly random.
    Random,
}

/// Input of rule routing.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// caller namespace
    pub src_namespace: Option<FastStr>,
    /// caller service
    pub src_service: Option<FastStr>,
    /// caller metadata
    pub src_metadata: HashMap<FastStr, FastStr>,
    /// destination service
    pub dst: Option<ServiceDescriptor>,
    /// metadata every destination must carry
    pub dst_metadata: HashMap<FastStr, FastStr>,
    /// candidates, in bundle order
    pub instances: Vec<Arc<DirectoryInstance>>,
}

/// A metadata routing rule: callers matching `source` may only reach instances matching `destination`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteRule {
    /// selector on the caller metadata
    pub source: HashMap<FastStr, FastStr>,
    /// selector on the instance metadata
    pub destination: HashMap<FastStr, FastStr>,
}

/// Input of a register call.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// owning service
    pub service: ServiceDescriptor,
    /// host
    pub host: FastStr,
    /// port
    pub port: u16,
    /// protocol
    pub protocol: FastStr,
    /// raw weight
    pub weight: i32,
    /// instance metadata
    pub metadata: HashMap<FastStr, FastStr>,
    /// heartbeats are expected within this TTL
    pub ttl: Duration,
}

/// Output of a register call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    /// directory-assigned instance id
    pub instance_id: FastStr,
    /// whether the instance was already registered
    pub existed: bool,
}

/// Input of a deregister call.
#[derive(Debug, Clone)]
pub struct DeregisterRequest {
    /// owning service
    pub service: ServiceDescriptor,
    /// host
    pub host: FastStr,
    /// port
    pub port: u16,
}

/// Input of a heartbeat call.
pub type HeartbeatRequest = DeregisterRequest;

/// Status reported with a call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetStatus {
    /// the call succeeded
    Success,
    /// the call failed
    Fail,
}

/// Outcome of one call against one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    /// called service
    pub service: ServiceDescriptor,
    /// instance the call went to
    pub instance_id: FastStr,
    /// protocol return code
    pub code: i32,
    /// status
    pub status: RetStatus,
    /// wall-clock latency
    pub delay: Duration,
}
