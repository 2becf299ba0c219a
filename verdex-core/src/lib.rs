//! Execution core of the Verdex evaluation engine.
//!
//! The crate is organized the way work flows through the engine:
//!
//! - [`exec`] — the scheduler loop, the per-item eval loop, the mode
//!   drivers, the turn evaluator, and the lifecycle manager.
//! - [`store`] — persistence traits plus the in-memory and (feature-gated)
//!   Postgres backends.
//! - [`services`] — traits for the external collaborators the engine drives
//!   (target, evaluators, evaluation set, benefit).
//! - [`infra`] — distributed lock, idempotency markers, event publishing,
//!   id generation, metrics, and config access.
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod exec;
pub mod infra;
pub mod services;
pub mod store;

pub use config::{
    AggRetryConf, ErrConvertConf, ErrRetryConf, ExecPacingConf, ExptExecConf,
    ExptItemEvalConf, ExptLockConf,
};
pub use error::{ErrKind, ExptError, Result};

#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
