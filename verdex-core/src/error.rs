//! Engine error taxonomy.
//!
//! Every failure the engine routes is one [`ExptError`]. The variants map
//! onto the classification the retry/terminate policy consumes: target and
//! evaluator business errors, turn-scope wrappers, quota exhaustion, zombie
//! events, and the ambient store/lock/publish failures underneath.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExptError {
    /// The target invocation reported a business error.
    #[error("target result error (code {code}): {message}")]
    TargetResult { code: i32, message: String },

    /// An evaluator reported a business error.
    #[error("evaluator result error (code {code}): {message}")]
    EvaluatorResult { code: i32, message: String },

    /// Unclassifiable failure at turn scope, wrapping the sanitized message.
    #[error("turn error: {message}")]
    TurnOther { message: String },

    /// Unexpected internal condition (nil target result, bad state, ...).
    #[error("internal error: {0}")]
    Internal(String),

    /// The benefit service rejected further usage; the experiment must
    /// terminate.
    #[error("benefit exhausted: {0}")]
    InDebt(String),

    /// Benefit check denied this call with a reason.
    #[error("benefit denied: {0}")]
    BenefitDenied(String),

    /// A schedule event older than the configured threshold.
    #[error("zombie schedule event: age {age_secs}s >= limit {limit_secs}s")]
    Zombie { age_secs: i64, limit_secs: i64 },

    /// A consumer task panicked; the payload is the recovered message.
    #[error("panic recovered: {0}")]
    Panic(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "database")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "database")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, ExptError>;

/// Classification consumed by the retry/terminate policy and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrKind {
    TargetResult,
    EvaluatorResult,
    TurnOther,
    Internal,
    InDebt,
    BenefitDenied,
    Zombie,
    Unclassified,
}

impl ExptError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ExptError::Internal(msg.into())
    }

    pub fn target_result(code: i32, message: impl Into<String>) -> Self {
        ExptError::TargetResult {
            code,
            message: message.into(),
        }
    }

    pub fn evaluator_result(code: i32, message: impl Into<String>) -> Self {
        ExptError::EvaluatorResult {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrKind {
        match self {
            ExptError::TargetResult { .. } => ErrKind::TargetResult,
            ExptError::EvaluatorResult { .. } => ErrKind::EvaluatorResult,
            ExptError::TurnOther { .. } => ErrKind::TurnOther,
            ExptError::Internal(_) | ExptError::Panic(_) => ErrKind::Internal,
            ExptError::InDebt(_) => ErrKind::InDebt,
            ExptError::BenefitDenied(_) => ErrKind::BenefitDenied,
            ExptError::Zombie { .. } => ErrKind::Zombie,
            _ => ErrKind::Unclassified,
        }
    }

    /// Business error code carried by the record, or a fixed per-kind code
    /// for engine-level failures. Used only for metrics and run-log wire
    /// serialization.
    pub fn code(&self) -> i32 {
        match self {
            ExptError::TargetResult { code, .. }
            | ExptError::EvaluatorResult { code, .. } => *code,
            ExptError::TurnOther { .. } => 601,
            ExptError::Internal(_) | ExptError::Panic(_) => 602,
            ExptError::InDebt(_) => 603,
            ExptError::BenefitDenied(_) => 604,
            ExptError::Zombie { .. } => 605,
            _ => 600,
        }
    }

    /// Whether the error has a known classification. Unstable errors come
    /// from the ambient layers (store, lock, transport) where the failure
    /// site, not the policy table, decides what happens next.
    pub fn is_stable(&self) -> bool {
        self.kind() != ErrKind::Unclassified
    }

    /// Compact wire form persisted into run-log `err_msg` columns.
    pub fn to_wire(&self) -> String {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
        .to_string()
    }
}
