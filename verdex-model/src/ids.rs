//! Strongly typed identifiers.
//!
//! Every identity in the engine is an `i64` on the wire and in storage;
//! the newtypes below keep them from being mixed up in signatures.

use std::fmt;

/// Strongly typed ID for experiments.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct ExptId(pub i64);

impl ExptId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ExptId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for ExptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for a single run of an experiment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct RunId(pub i64);

impl RunId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RunId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for workspaces ("spaces").
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct SpaceId(pub i64);

impl SpaceId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for SpaceId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for evaluation-set items.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct ItemId(pub i64);

impl ItemId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ItemId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for conversation turns within an item.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TurnId(pub i64);

impl TurnId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TurnId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for a pinned evaluator version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct EvaluatorVersionId(pub i64);

impl EvaluatorVersionId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EvaluatorVersionId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for EvaluatorVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for the system under test.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TargetId(pub i64);

impl TargetId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TargetId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for a pinned target version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct TargetVersionId(pub i64);

impl TargetVersionId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for TargetVersionId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for TargetVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for evaluation sets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct EvalSetId(pub i64);

impl EvalSetId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EvalSetId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for EvalSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for a pinned evaluation-set version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct EvalSetVersionId(pub i64);

impl EvalSetVersionId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl From<i64> for EvalSetVersionId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl fmt::Display for EvalSetVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
