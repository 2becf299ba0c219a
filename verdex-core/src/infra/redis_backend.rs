//! Redis-backed distributed lock and idempotency markers.
//!
//! Locks are `SET NX PX` entries holding a random token; renewal and
//! release are token-checked scripts so a lapsed-and-reacquired key is
//! never extended or deleted by the previous holder.

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::idempotency::IdempotencyService;
use super::locker::{LockGuard, Locker, renew_cadence};
use crate::error::Result;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end"#;

#[derive(Clone)]
pub struct RedisLocker {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLocker")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisLocker {
    pub async fn new(redis_url: &str) -> Result<Self> {
        info!("Connecting to Redis lock backend at {}", redis_url);
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let extended: i64 = Script::new(RENEW_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Locker for RedisLocker {
    async fn lock_with_renew(
        &self,
        key: &str,
        ttl: Duration,
        max_hold: Duration,
    ) -> Result<Option<LockGuard>> {
        let token = Uuid::now_v7().to_string();
        if !self.try_acquire(key, &token, ttl).await? {
            debug!(key, "lock held elsewhere");
            return Ok(None);
        }

        let (cancel_tx, mut cancel_rx) = mpsc::channel::<()>(1);
        let renewer = self.clone();
        let renew_key = key.to_string();
        let renew_token = token.clone();
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
                match renewer.renew(&renew_key, &renew_token, ttl).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        warn!(key = %renew_key, %err, "lock renew failed");
                    }
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
                Box::pin(async move { releaser.release(&release_key, &token).await })
            }),
        );
        Ok(Some(guard))
    }
}

/// `SET NX EX` markers; existence is the whole contract.
#[derive(Clone)]
pub struct RedisIdempotency {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisIdempotency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisIdempotency")
            .field("connection", &"ConnectionManager")
            .finish()
    }
}

impl RedisIdempotency {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl IdempotencyService for RedisIdempotency {
    async fn exist(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn set(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(key, 1u8, ttl.as_secs().max(1)).await?;
        Ok(())
    }
}
