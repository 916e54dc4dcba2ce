// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//!
//! logimesh-directory connects logimesh clients and servers to a service directory.
//!
//! A [`resolver::Resolver`] turns a service name into a versioned set of instances and
//! keeps it fresh through watch changes, a [`balance::Balancer`] caches the routing
//! bundle built from that set and hands out per-call pickers, a [`registry::Registry`]
//! keeps the local endpoint registered and heartbeating, and a
//! [`report::CallResultReporter`] feeds call outcomes back to the directory.
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod backend;
pub mod balance;
pub mod config;
pub mod error;
pub mod instance;
pub mod key;
pub mod net;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod session;
pub mod task;

pub use backend::memory::MemoryDirectory;
pub use backend::DirectoryBackend;
pub use balance::{Balancer, Picker, RoutingBundle};
pub use config::{RouteOptions, SessionConfig};
pub use error::DirectoryError;
pub use instance::{DirectoryInstance, Instance, DEFAULT_WEIGHT};
pub use key::{InstanceKey, ServiceDescriptor};
pub use registry::{Registration, Registry, RegistryInfo};
pub use report::{CallResultReporter, ReportOutcome, ReportingStub, RetCode};
pub use resolver::{Change, ResolveResult, Resolver};
pub use session::{DirectorySession, SessionSlot};
