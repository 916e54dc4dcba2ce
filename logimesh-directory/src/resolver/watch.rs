// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{diff, Change, ResolveResult};
use crate::backend::{DirectoryBackend, WatchEvent};
use crate::config::RouteOptions;
use crate::instance::{DirectoryInstance, Instance};
use crate::key::ServiceDescriptor;
use crate::session::DirectorySession;
use async_broadcast::{Receiver, RecvError, Sender, TrySendError};
use faststr::FastStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct WatchState<B> {
    session: DirectorySession<B>,
    descriptor: ServiceDescriptor,
    cache_key: FastStr,
    options: Arc<RouteOptions>,
    snapshot: Vec<Arc<DirectoryInstance>>,
    tx: Sender<Change>,
}

/// Keeps the snapshot of one service and broadcasts a [`Change`] per backend event.
///
/// Backend failures are logged and retried after `watch_retry`; only cancellation, or the
/// last receiver going away, ends the loop.
pub(super) async fn run<B: DirectoryBackend>(session: DirectorySession<B>, descriptor: ServiceDescriptor, options: Arc<RouteOptions>, tx: Sender<Change>, token: CancellationToken) {
    let retry = session.config().watch_retry;
    let mut state = WatchState {
        cache_key: descriptor.cache_key(),
        session,
        descriptor,
        options,
        snapshot: Vec::new(),
        tx,
    };
    let mut seeded = false;
    info!("[LOGIMESH] start watching {}", state.descriptor);
    loop {
        let subscribed = tokio::select! {
            _ = token.cancelled() => break,
            subscribed = state.session.backend().watch_service(&state.descriptor) => subscribed,
        };
        let mut events = match subscribed {
            Ok(events) => events,
            Err(e) => {
                warn!("[LOGIMESH] watch {} failed: {e}", state.descriptor);
                if pause(&token, retry).await {
                    continue;
                }
                break;
            },
        };
        // Events after the subscription are queued, so listing now leaves no gap.
        match state.resync(seeded).await {
            Synced::Listed => seeded = true,
            Synced::Gone => break,
            // Events are only folded onto a listed snapshot.
            Synced::Failed => {
                drop(events);
                if pause(&token, retry).await {
                    continue;
                }
                break;
            },
        }
        if !state.consume(&mut events, &token).await {
            break;
        }
        if !pause(&token, retry).await {
            break;
        }
    }
    info!("[LOGIMESH] stop watching {}", state.descriptor);
}

/// Outcome of replacing the snapshot with a fresh list.
enum Synced {
    Listed,
    /// The list failed; the snapshot is unchanged.
    Failed,
    /// Nobody listens anymore.
    Gone,
}

/// Sleeps unless cancelled first. Returns false on cancellation.
async fn pause(token: &CancellationToken, retry: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(retry) => true,
    }
}

impl<B: DirectoryBackend> WatchState<B> {
    /// Drains the subscription. Returns true when the subscription closed and should be reopened.
    async fn consume(&mut self, events: &mut Receiver<WatchEvent>, token: &CancellationToken) -> bool {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => return false,
                event = events.recv() => event,
            };
            match event {
                Ok(event) => {
                    if !self.apply(event) {
                        return false;
                    }
                },
                Err(RecvError::Overflowed(n)) => {
                    warn!("[LOGIMESH] watch {} dropped {n} events, resyncing", self.descriptor);
                    match self.resync(true).await {
                        Synced::Listed => {},
                        Synced::Failed => return true,
                        Synced::Gone => return false,
                    }
                },
                Err(RecvError::Closed) => {
                    warn!("[LOGIMESH] watch {} closed by backend", self.descriptor);
                    return true;
                },
            }
        }
    }

    /// Replaces the snapshot with a fresh list, broadcasting the difference when `emit` is set.
    async fn resync(&mut self, emit: bool) -> Synced {
        let records = match self.session.backend().list_instances(&self.descriptor).await {
            Ok(records) => records,
            Err(e) => {
                warn!("[LOGIMESH] list {} failed: {e}", self.descriptor);
                return Synced::Failed;
            },
        };
        let prev = self.result();
        self.snapshot = records;
        if !emit {
            return Synced::Listed;
        }
        let (change, changed) = diff(self.cache_key.clone(), &prev, &self.result());
        if !changed || self.emit(change) {
            Synced::Listed
        } else {
            Synced::Gone
        }
    }

    /// Folds one event into the snapshot and broadcasts it. Returns false when nobody listens anymore.
    fn apply(&mut self, event: WatchEvent) -> bool {
        if event.is_empty() {
            return true;
        }
        for record in &event.removed {
            let key = record.key();
            self.snapshot.retain(|r| r.key() != key);
        }
        for record in event.updated.iter().chain(event.added.iter()) {
            let key = record.key();
            match self.snapshot.iter().position(|r| r.key() == key) {
                Some(i) => self.snapshot[i] = record.clone(),
                None => self.snapshot.push(record.clone()),
            }
        }
        debug!(
            "[LOGIMESH] watch {}: {} added, {} updated, {} removed",
            self.descriptor,
            event.added.len(),
            event.updated.len(),
            event.removed.len()
        );
        let adapt = |records: &[Arc<DirectoryInstance>]| records.iter().map(|r| Arc::new(Instance::from_record(r))).collect::<Vec<_>>();
        let change = Change {
            result: self.result(),
            added: adapt(&event.added),
            updated: adapt(&event.updated),
            removed: adapt(&event.removed),
        };
        self.emit(change)
    }

    fn result(&self) -> ResolveResult {
        ResolveResult::from_records(self.cache_key.clone(), self.snapshot.clone(), self.options.clone())
    }

    fn emit(&self, change: Change) -> bool {
        match self.tx.try_broadcast(change) {
            Ok(_) | Err(TrySendError::Inactive(_)) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Closed(_)) => {
                debug!("[LOGIMESH] no receiver left for {}", self.descriptor);
                false
            },
        }
    }
}
