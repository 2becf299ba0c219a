//! Runs: a single invocation of an experiment in one of three modes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ModelError;
use crate::ids::{ExptId, RunId, SpaceId};

/// Execution mode of a run. Serialized as `u8` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum EvalMode {
    /// First-time run: seeds results for every item of the set version.
    Submit,
    /// Rerun of failed/terminal/stuck turns on an existing experiment.
    FailRetry,
    /// Long-lived run accepting new items over time.
    Append,
}

impl EvalMode {
    pub fn as_u8(&self) -> u8 {
        (*self).into()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalMode::Submit => "submit",
            EvalMode::FailRetry => "fail_retry",
            EvalMode::Append => "append",
        }
    }
}

impl From<EvalMode> for u8 {
    fn from(mode: EvalMode) -> Self {
        match mode {
            EvalMode::Submit => 1,
            EvalMode::FailRetry => 2,
            EvalMode::Append => 3,
        }
    }
}

impl TryFrom<u8> for EvalMode {
    type Error = ModelError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(EvalMode::Submit),
            2 => Ok(EvalMode::FailRetry),
            3 => Ok(EvalMode::Append),
            other => Err(ModelError::UnknownDiscriminant {
                kind: "eval_mode",
                value: other as i64,
            }),
        }
    }
}

impl fmt::Display for EvalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Parked by the scheduler while an Append run has no work.
    Pended,
    Completed,
}

impl RunStatus {
    pub fn as_i32(&self) -> i32 {
        match self {
            RunStatus::Running => 1,
            RunStatus::Pended => 2,
            RunStatus::Completed => 3,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, ModelError> {
        match v {
            1 => Ok(RunStatus::Running),
            2 => Ok(RunStatus::Pended),
            3 => Ok(RunStatus::Completed),
            other => Err(ModelError::UnknownDiscriminant {
                kind: "run_status",
                value: other as i64,
            }),
        }
    }
}

/// One run of an experiment. Multiple runs may exist per experiment, but
/// only one is ever active (the scheduler lock enforces this).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptRun {
    pub id: RunId,
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub mode: EvalMode,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eval_mode_round_trips_as_u8() {
        for mode in [EvalMode::Submit, EvalMode::FailRetry, EvalMode::Append] {
            let wire = serde_json::to_string(&mode).unwrap();
            let back: EvalMode = serde_json::from_str(&wire).unwrap();
            assert_eq!(mode, back);
        }
        assert_eq!(serde_json::to_string(&EvalMode::Submit).unwrap(), "1");
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let err = serde_json::from_str::<EvalMode>("9").unwrap_err();
        assert!(err.to_string().contains("eval_mode"));
    }
}
