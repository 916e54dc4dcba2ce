// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Background tasks owned through a cancellation token.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// A spawned loop together with the token that stops it.
///
/// Dropping a [`Supervised`] cancels the loop; [`Supervised::shutdown`] also waits for it.
#[derive(Debug)]
#[must_use = "dropping a Supervised cancels its task"]
pub struct Supervised {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Supervised {
    /// Spawns `f(token)` on the current runtime under a fresh child of `parent`.
    pub fn spawn<F, Fut>(parent: &CancellationToken, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = parent.child_token();
        let handle = tokio::spawn(f(token.clone()));
        Self { token, handle: Some(handle) }
    }

    /// Requests the loop to stop. Calling it again has no effect.
    #[inline]
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop has been asked to stop.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Whether the spawned future has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// The token governing the loop.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancels the loop and waits until it has returned.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("[LOGIMESH] supervised task panicked: {e}");
                }
            }
        }
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::Supervised;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_shutdown_joins() {
        let root = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let task = Supervised::spawn(&root, |token| async move {
            token.cancelled().await;
            flag.store(true, Ordering::SeqCst);
        });
        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());
        task.shutdown().await;
        assert!(exited.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_parent_cancels_children() {
        let root = CancellationToken::new();
        let task = Supervised::spawn(&root, |token| async move { token.cancelled().await });
        root.cancel();
        assert!(task.is_cancelled());
        task.shutdown().await;
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let root = CancellationToken::new();
        let task = Supervised::spawn(&root, |token| async move { token.cancelled().await });
        let token = task.token().clone();
        drop(task);
        assert!(token.is_cancelled());
    }
}
