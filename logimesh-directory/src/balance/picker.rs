// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::RoutingBundle;
use crate::backend::{DirectoryBackend, LbPolicy};
use crate::instance::{DirectoryInstance, Instance};
use crate::key::InstanceKey;
use crate::session::DirectorySession;
use core::cell::OnceCell;
use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex};
use tracing::warn;

const DEFAULT_POOL_CAPACITY: usize = 256;

/// Idle picker states waiting for reuse.
pub(crate) struct PickerPool<B> {
    idle: Mutex<Vec<Box<PickerState<B>>>>,
    capacity: usize,
}

struct PickerState<B> {
    bundle: Option<Arc<RoutingBundle>>,
    session: Option<DirectorySession<B>>,
    policy: LbPolicy,
    candidates: OnceCell<Vec<Arc<DirectoryInstance>>>,
    tried: HashSet<InstanceKey>,
}

impl<B> PickerState<B> {
    fn empty() -> Self {
        Self {
            bundle: None,
            session: None,
            policy: LbPolicy::default(),
            candidates: OnceCell::new(),
            tried: HashSet::new(),
        }
    }

    fn clear(&mut self) {
        self.bundle = None;
        self.session = None;
        self.policy = LbPolicy::default();
        self.candidates = OnceCell::new();
        self.tried.clear();
    }

    fn is_clear(&self) -> bool {
        self.bundle.is_none() && self.session.is_none() && self.candidates.get().is_none() && self.tried.is_empty()
    }
}

impl<B> Default for PickerPool<B> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }
}

impl<B> PickerPool<B> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    /// Number of idle states.
    pub(crate) fn idle(&self) -> usize {
        self.idle.lock().map_or(0, |idle| idle.len())
    }

    fn put(&self, mut state: Box<PickerState<B>>) {
        state.clear();
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.capacity {
                idle.push(state);
            }
        }
    }
}

impl<B: DirectoryBackend> PickerPool<B> {
    /// Takes an idle state, or allocates one, and attaches the bundle.
    pub(crate) fn acquire(self: &Arc<Self>, bundle: Arc<RoutingBundle>, session: DirectorySession<B>, policy: LbPolicy) -> Picker<B> {
        let mut state = self.idle.lock().ok().and_then(|mut idle| idle.pop()).unwrap_or_else(|| Box::new(PickerState::empty()));
        debug_assert!(state.is_clear());
        state.bundle = Some(bundle);
        state.session = Some(session);
        state.policy = policy;
        Picker {
            state: Some(state),
            pool: self.clone(),
        }
    }
}

/// A per-call routing decision over one [`RoutingBundle`].
///
/// Rule routing runs at most once per acquisition, on the first selection, and its
/// outcome is reused by every later selection. An empty or failed rule evaluation makes
/// every selection return `None`; the unfiltered set is never used as a fallback.
///
/// A picker is not shared; dropping it releases it back to the pool.
pub struct Picker<B: DirectoryBackend> {
    state: Option<Box<PickerState<B>>>,
    pool: Arc<PickerPool<B>>,
}

impl<B: DirectoryBackend> Picker<B> {
    /// Chooses one instance with the backend's load balancer.
    pub fn select(&mut self) -> Option<Arc<Instance>> {
        let state = self.state.as_deref()?;
        let candidates = Self::candidates(state)?;
        pick(state, candidates).map(|(_, instance)| instance)
    }

    /// The bundle the picker routes over, until released.
    pub fn bundle(&self) -> Option<&Arc<RoutingBundle>> {
        self.state.as_ref()?.bundle.as_ref()
    }

    /// Whether the picker was released.
    pub fn is_released(&self) -> bool {
        self.state.is_none()
    }

    /// Clears every reference the picker holds and returns it to the pool. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            self.pool.put(state);
        }
    }

    fn candidates(state: &PickerState<B>) -> Option<&[Arc<DirectoryInstance>]> {
        let bundle = state.bundle.as_ref()?;
        let session = state.session.as_ref()?;
        let candidates = state.candidates.get_or_init(|| match session.backend().process_routers(&bundle.route_request()) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!("[LOGIMESH] rule routing of {} failed: {e}", bundle.descriptor());
                Vec::new()
            },
        });
        Some(candidates)
    }
}

fn pick<B: DirectoryBackend>(state: &PickerState<B>, candidates: &[Arc<DirectoryInstance>]) -> Option<(InstanceKey, Arc<Instance>)> {
    if candidates.is_empty() {
        return None;
    }
    let bundle = state.bundle.as_ref()?;
    let session = state.session.as_ref()?;
    let chosen = match session.backend().process_load_balance(candidates, state.policy) {
        Ok(chosen) => chosen,
        Err(e) => {
            warn!("[LOGIMESH] load balance of {} failed: {e}", bundle.descriptor());
            return None;
        },
    };
    let key = chosen.key();
    match bundle.get(&key) {
        Some(instance) => Some((key, instance.clone())),
        None => {
            warn!("[LOGIMESH] picked {key} is missing from the bundle of {}", bundle.descriptor());
            None
        },
    }
}

/// Yields distinct instances, for retrying a call on another endpoint.
impl<B: DirectoryBackend> Iterator for Picker<B> {
    type Item = Arc<Instance>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.as_deref_mut()?;
        let candidates = Self::candidates(state)?;
        let remaining: Vec<Arc<DirectoryInstance>> = candidates.iter().filter(|c| !state.tried.contains(&c.key())).cloned().collect();
        let (key, instance) = pick(state, &remaining)?;
        state.tried.insert(key);
        Some(instance)
    }
}

impl<B: DirectoryBackend> Drop for Picker<B> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<B: DirectoryBackend> Debug for Picker<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Picker")
            .field("bundle", &self.bundle().map(|b| b.descriptor()))
            .field("released", &self.is_released())
            .finish()
    }
}
