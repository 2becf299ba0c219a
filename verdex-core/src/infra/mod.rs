//! Infrastructure collaborators: locks, idempotency markers, event
//! publishing, id generation, metrics, and config access.
//!
//! Each concern is a trait with a first-class in-process implementation;
//! the Redis-backed implementations live behind the `database` feature.

pub mod configer;
pub mod idempotency;
pub mod idgen;
pub mod locker;
pub mod metrics;
pub mod publisher;

#[cfg(feature = "database")]
pub mod redis_backend;

pub use configer::{Configer, ErrCtrl, StaticConfiger};
pub use idempotency::{IdempotencyService, MemoryIdempotency};
pub use idgen::{IdGenerator, MemoryIdGenerator};
pub use locker::{LockGuard, Locker, MemoryLocker};
pub use metrics::{CaptureMetric, ExptMetric, ItemExecMetric, TracingMetric};
pub use publisher::{ExptEventSource, ExptPublisher, InProcExptBus, QueueDepths};

#[cfg(feature = "database")]
pub use redis_backend::{RedisIdempotency, RedisLocker};
