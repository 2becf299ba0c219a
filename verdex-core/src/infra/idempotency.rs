//! One-shot markers for start/end operations.
//!
//! Keys like `expt_start:{expt}{run}` and `expt_end:{expt}{run}` are set
//! with a TTL of twice the zombie interval, so duplicated deliveries inside
//! a run's lifetime observe the marker while stale markers age out.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait IdempotencyService: Send + Sync {
    async fn exist(&self, key: &str) -> Result<bool>;
    async fn set(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// In-process marker table with real expiry.
#[derive(Clone, Default)]
pub struct MemoryIdempotency {
    markers: Arc<Mutex<HashMap<String, tokio::time::Instant>>>,
}

impl std::fmt::Debug for MemoryIdempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIdempotency").finish()
    }
}

impl MemoryIdempotency {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyService for MemoryIdempotency {
    async fn exist(&self, key: &str) -> Result<bool> {
        let markers = self.markers.lock().await;
        Ok(markers
            .get(key)
            .is_some_and(|expiry| *expiry > tokio::time::Instant::now()))
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut markers = self.markers.lock().await;
        markers.insert(key.to_string(), tokio::time::Instant::now() + ttl);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn markers_expire_by_ttl() {
        let markers = MemoryIdempotency::new();
        assert!(!markers.exist("expt_start:110").await.unwrap());

        markers
            .set("expt_start:110", Duration::from_secs(10))
            .await
            .unwrap();
        assert!(markers.exist("expt_start:110").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!markers.exist("expt_start:110").await.unwrap());
    }
}
