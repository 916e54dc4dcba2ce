// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! The shared backend session.

use crate::backend::DirectoryBackend;
use crate::config::SessionConfig;
use crate::error::DirectoryError;
use faststr::FastStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A connected directory backend shared by resolvers, balancers and registries.
///
/// Clones share one connection; [`DirectorySession::close`] tears it down once.
#[derive(Debug)]
pub struct DirectorySession<B> {
    inner: Arc<SessionInner<B>>,
}

#[derive(Debug)]
struct SessionInner<B> {
    config: SessionConfig,
    backend: B,
    closed: AtomicBool,
}

impl<B> Clone for DirectorySession<B> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<B: DirectoryBackend> DirectorySession<B> {
    /// Validates the config and connects the backend.
    pub async fn connect(config: SessionConfig) -> Result<Self, DirectoryError> {
        if config.endpoints.is_empty() {
            return Err(DirectoryError::BackendUnavailable(FastStr::from_static_str("no endpoint configured")));
        }
        config.validate()?;
        let backend = B::connect(&config).await.map_err(|e| match e {
            DirectoryError::BackendUnavailable(_) => e,
            other => DirectoryError::BackendUnavailable(FastStr::from_string(other.to_string())),
        })?;
        info!("[LOGIMESH] directory session connected to {:?}", config.endpoints);
        Ok(Self::from_backend(config, backend))
    }

    /// Wraps an already connected backend.
    pub fn from_backend(config: SessionConfig, backend: B) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                backend,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The config the session was built from.
    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// The backend.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.inner.backend
    }

    /// Whether [`DirectorySession::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Destroys the backend context. Later calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.backend.destroy().await;
        debug!("[LOGIMESH] directory session closed");
    }
}

/// Lazily connected, process-wide [`DirectorySession`].
///
/// The first successful [`SessionSlot::get_or_connect`] wins; failures leave the slot empty.
#[derive(Debug)]
pub struct SessionSlot<B> {
    session: Mutex<Option<DirectorySession<B>>>,
}

impl<B> Default for SessionSlot<B> {
    fn default() -> Self {
        Self { session: Mutex::const_new(None) }
    }
}

impl<B: DirectoryBackend> SessionSlot<B> {
    /// Returns an empty slot; usable in a `static`.
    pub const fn new() -> Self {
        Self { session: Mutex::const_new(None) }
    }

    /// Returns the shared session, connecting it with `config` on first use.
    pub async fn get_or_connect(&self, config: impl FnOnce() -> SessionConfig) -> Result<DirectorySession<B>, DirectoryError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = DirectorySession::connect(config()).await?;
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Takes the session out and closes it.
    pub async fn shutdown(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DirectorySession, SessionSlot};
    use crate::backend::memory::MemoryDirectory;
    use crate::config::SessionConfig;
    use crate::error::DirectoryError;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_connect_errors() {
        let empty = SessionConfig::new(Vec::<String>::new());
        assert_matches!(DirectorySession::<MemoryDirectory>::connect(empty).await, Err(DirectoryError::BackendUnavailable(_)));
        let blank = SessionConfig::new([""]);
        assert_matches!(DirectorySession::<MemoryDirectory>::connect(blank).await, Err(DirectoryError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_close_once() {
        let session = DirectorySession::<MemoryDirectory>::connect(SessionConfig::default()).await.unwrap();
        let other = session.clone();
        session.close().await;
        other.close().await;
        assert!(other.is_closed());
        assert!(session.backend().is_destroyed());
    }

    #[tokio::test]
    async fn test_slot_connects_once() {
        static SLOT: SessionSlot<MemoryDirectory> = SessionSlot::new();
        let a = SLOT.get_or_connect(SessionConfig::default).await.unwrap();
        let b = SLOT.get_or_connect(|| unreachable!("already connected")).await.unwrap();
        a.backend().upsert(crate::instance::DirectoryInstance::new("default", "orders", "10.0.0.1", 80));
        assert_eq!(b.backend().snapshot(&crate::key::ServiceDescriptor::new("default", "orders")).len(), 1);
        SLOT.shutdown().await;
        assert!(a.is_closed());
    }
}
