//! Distributed lock with auto-renewal.
//!
//! A grant carries a TTL and a max-hold: a background task renews the entry
//! at `ttl * (1 - renew_at_fraction)` cadence and stops at max-hold, after
//! which the entry lapses by TTL. The guard cancels renewal when dropped,
//! so locks release on every path including panics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::error::Result;

/// Handle to one held lock. Explicit unlock is preferred; dropping the
/// guard stops renewal and lets the entry expire by TTL.
pub struct LockGuard {
    key: String,
    cancel: Option<mpsc::Sender<()>>,
    renew_task: Option<tokio::task::JoinHandle<()>>,
    release: Option<Box<dyn FnOnce() -> ReleaseFut + Send>>,
}

type ReleaseFut =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send>>;

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}

impl LockGuard {
    pub fn new(
        key: String,
        cancel: mpsc::Sender<()>,
        renew_task: tokio::task::JoinHandle<()>,
        release: Box<dyn FnOnce() -> ReleaseFut + Send>,
    ) -> Self {
        Self {
            key,
            cancel: Some(cancel),
            renew_task: Some(renew_task),
            release: Some(release),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stop renewal and delete the lock entry.
    pub async fn unlock(mut self) -> Result<()> {
        self.stop_renewal();
        if let Some(task) = self.renew_task.take() {
            let _ = task.await;
        }
        match self.release.take() {
            Some(release) => release().await,
            None => Ok(()),
        }
    }

    fn stop_renewal(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.try_send(());
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unlock not called (early return or panic): the renew task stops
        // and the entry lapses by TTL.
        self.stop_renewal();
    }
}

#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to acquire `key`. `None` means the lock is held elsewhere;
    /// backend failures surface as errors.
    async fn lock_with_renew(
        &self,
        key: &str,
        ttl: Duration,
        max_hold: Duration,
    ) -> Result<Option<LockGuard>>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    token: u64,
    expires_at: tokio::time::Instant,
}

/// In-process lock table. Single-writer semantics match the Redis backend;
/// expiry is honored so contention tests behave like production.
#[derive(Clone, Default)]
pub struct MemoryLocker {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    next_token: Arc<std::sync::atomic::AtomicU64>,
}

impl std::fmt::Debug for MemoryLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLocker").finish()
    }
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_acquire(&self, key: &str, ttl: Duration) -> Option<u64> {
        let mut entries = self.entries.lock().await;
        let now = tokio::time::Instant::now();
        if let Some(entry) = entries.get(key)
            && entry.expires_at > now
        {
            return None;
        }
        let token = self
            .next_token
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        entries.insert(
            key.to_string(),
            Entry {
                token,
                expires_at: now + ttl,
            },
        );
        Some(token)
    }

    async fn renew(&self, key: &str, token: u64, ttl: Duration) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.token == token => {
                entry.expires_at = tokio::time::Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    async fn release(&self, key: &str, token: u64) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key)
            && entry.token == token
        {
            entries.remove(key);
        }
    }
}

/// Sleep between renewals: renew once the remaining TTL drops below half.
pub(crate) fn renew_cadence(ttl: Duration) -> Duration {
    ttl.mul_f32(0.5)
}

#[async_trait]
impl Locker for MemoryLocker {
    async fn lock_with_renew(
        &self,
        key: &str,
        ttl: Duration,
        max_hold: Duration,
    ) -> Result<Option<LockGuard>> {
        let Some(token) = self.try_acquire(key, ttl).await else {
            debug!(key, "lock held elsewhere");
            return Ok(None);
        };

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let renewer = self.clone();
        let renew_key = key.to_string();
        let renew_task = tokio::spawn(async move {
            let held_since = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(renew_cadence(ttl)) => {},
                    _ = cancel_rx.recv() => break,
                }
                if held_since.elapsed() >= max_hold {
                    warn!(key = %renew_key, "lock max-hold reached, stopping renewal");
                    break;
                }
                if !renewer.renew(&renew_key, token, ttl).await {
                    break;
                }
            }
        });

        let releaser = self.clone();
        let release_key = key.to_string();
        let guard = LockGuard::new(
            key.to_string(),
            cancel_tx,
            renew_task,
            Box::new(move || {
                Box::pin(async move {
                    releaser.release(&release_key, token).await;
                    Ok(())
                })
            }),
        );
        Ok(Some(guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_until_unlock() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(20);
        let hold = Duration::from_secs(60);

        let guard = locker
            .lock_with_renew("k", ttl, hold)
            .await
            .unwrap()
            .expect("first acquire");
        assert!(locker.lock_with_renew("k", ttl, hold).await.unwrap().is_none());

        guard.unlock().await.unwrap();
        assert!(locker.lock_with_renew("k", ttl, hold).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_guard_lapses_by_ttl() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(20);
        let hold = Duration::from_secs(60);

        let guard = locker
            .lock_with_renew("k", ttl, hold)
            .await
            .unwrap()
            .expect("first acquire");
        drop(guard);

        // Still held until the TTL elapses.
        assert!(locker.lock_with_renew("k", ttl, hold).await.unwrap().is_none());
        tokio::time::advance(ttl + Duration::from_secs(1)).await;
        assert!(locker.lock_with_renew("k", ttl, hold).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_extends_past_the_original_ttl() {
        let locker = MemoryLocker::new();
        let ttl = Duration::from_secs(20);
        let hold = Duration::from_secs(120);

        let _guard = locker
            .lock_with_renew("k", ttl, hold)
            .await
            .unwrap()
            .expect("first acquire");

        // Two TTLs later the renew task must have kept the entry alive.
        for _ in 0..8 {
            tokio::time::advance(Duration::from_secs(5)).await;
            tokio::task::yield_now().await;
        }
        assert!(locker.lock_with_renew("k", ttl, hold).await.unwrap().is_none());
    }
}
