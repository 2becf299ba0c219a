//! Minimal error type for model-level conversions.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A wire value did not map onto a known enum variant.
    UnknownDiscriminant { kind: &'static str, value: i64 },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::UnknownDiscriminant { kind, value } => {
                write!(f, "unknown {kind} discriminant: {value}")
            }
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
