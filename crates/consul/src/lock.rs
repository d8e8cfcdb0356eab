//! The held-lock guard shared by every [`crate::KvStore`] implementation
//! (spec §5: session TTL/2 renewal, `Drop`-based best-effort release plus an
//! explicit async [`SessionLock::release`]).

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::ConsulError;

/// The subset of session/lock operations a [`SessionLock`] needs to keep
/// itself alive and clean up after itself, factored out so the lock guard
/// does not depend on the full `KvStore` trait (and so the mock backend can
/// implement it too).
#[async_trait]
pub(crate) trait LockBackend: Send + Sync {
    async fn renew_session(&self, session_id: &str) -> Result<(), ConsulError>;
    async fn release_lock(&self, key: &str, session_id: &str) -> Result<(), ConsulError>;
    async fn destroy_session(&self, session_id: &str) -> Result<(), ConsulError>;
}

pub struct SessionLock {
    key: String,
    session_id: String,
    backend: Arc<dyn LockBackend>,
    renew_handle: Option<JoinHandle<()>>,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLock")
            .field("key", &self.key)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

impl SessionLock {
    pub(crate) fn new(key: String, session_id: String, ttl: Duration, backend: Arc<dyn LockBackend>) -> Self {
        let released = Arc::new(AtomicBool::new(false));
        let renew_handle = spawn_renewal(session_id.clone(), ttl, Arc::clone(&backend), Arc::clone(&released));

        Self { key, session_id, backend, renew_handle: Some(renew_handle), released }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Releases the lock and destroys the session. Idempotent: a second call
    /// (or a later drop) is a no-op.
    pub async fn release(mut self) -> Result<(), ConsulError> {
        self.release_inner().await
    }

    async fn release_inner(&mut self) -> Result<(), ConsulError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        self.backend.release_lock(&self.key, &self.session_id).await?;
        self.backend.destroy_session(&self.session_id).await
    }
}

fn spawn_renewal(
    session_id: String,
    ttl: Duration,
    backend: Arc<dyn LockBackend>,
    released: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let period = ttl / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if released.load(Ordering::SeqCst) {
                break;
            }
            if let Err(error) = backend.renew_session(&session_id).await {
                tracing::warn!(%error, session_id = %session_id, "session renewal failed, lock will expire");
                break;
            }
        }
    })
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.renew_handle.take() {
            handle.abort();
        }
        let backend = Arc::clone(&self.backend);
        let key = self.key.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            if let Err(error) = backend.release_lock(&key, &session_id).await {
                tracing::warn!(%error, session_id = %session_id, "best-effort lock release on drop failed");
            }
            let _ = backend.destroy_session(&session_id).await;
        });
    }
}
