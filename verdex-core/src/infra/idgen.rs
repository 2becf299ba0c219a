//! Block id allocation for result rows and run-logs.
//!
//! Identities are `i64` on the wire, so id generation is a collaborator
//! rather than a local uuid call. Submit-mode start allocates per page,
//! never for the whole set.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::error::Result;

#[async_trait]
pub trait IdGenerator: Send + Sync {
    /// Allocate `n` fresh ids. The block is contiguous for the in-process
    /// generator; callers must not rely on that.
    async fn gen_multi_ids(&self, n: usize) -> Result<Vec<i64>>;
}

#[derive(Clone)]
pub struct MemoryIdGenerator {
    next: Arc<AtomicI64>,
}

impl std::fmt::Debug for MemoryIdGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryIdGenerator")
            .field("next", &self.next.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MemoryIdGenerator {
    fn default() -> Self {
        Self::starting_at(1_000)
    }
}

impl MemoryIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: i64) -> Self {
        Self {
            next: Arc::new(AtomicI64::new(first)),
        }
    }
}

#[async_trait]
impl IdGenerator for MemoryIdGenerator {
    async fn gen_multi_ids(&self, n: usize) -> Result<Vec<i64>> {
        let start = self.next.fetch_add(n as i64, Ordering::Relaxed);
        Ok((start..start + n as i64).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_never_overlap() {
        let idgen = MemoryIdGenerator::starting_at(10);
        let a = idgen.gen_multi_ids(3).await.unwrap();
        let b = idgen.gen_multi_ids(2).await.unwrap();
        assert_eq!(a, vec![10, 11, 12]);
        assert_eq!(b, vec![13, 14]);
    }
}
