//! Per-item and per-turn results, plus their per-run run-log copies.
//!
//! Authoritative rows (`ExptItemResult`, `ExptTurnResult`) exist once per
//! `(experiment, item[, turn])` and survive across runs. Run-logs are the
//! per-run copies used for retry accounting; they are created lazily by the
//! run that touches them and are immutable once terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ModelError;
use crate::ids::{EvaluatorVersionId, ExptId, ItemId, RunId, TurnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRunState {
    Queueing,
    Processing,
    Success,
    Fail,
    Terminal,
}

impl ItemRunState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ItemRunState::Success | ItemRunState::Fail | ItemRunState::Terminal
        )
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            ItemRunState::Queueing => 1,
            ItemRunState::Processing => 2,
            ItemRunState::Success => 3,
            ItemRunState::Fail => 4,
            ItemRunState::Terminal => 5,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, ModelError> {
        match v {
            1 => Ok(ItemRunState::Queueing),
            2 => Ok(ItemRunState::Processing),
            3 => Ok(ItemRunState::Success),
            4 => Ok(ItemRunState::Fail),
            5 => Ok(ItemRunState::Terminal),
            other => Err(ModelError::UnknownDiscriminant {
                kind: "item_run_state",
                value: other as i64,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRunState {
    Queueing,
    Processing,
    Success,
    Fail,
    Terminal,
}

impl TurnRunState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TurnRunState::Success | TurnRunState::Fail | TurnRunState::Terminal
        )
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            TurnRunState::Queueing => 1,
            TurnRunState::Processing => 2,
            TurnRunState::Success => 3,
            TurnRunState::Fail => 4,
            TurnRunState::Terminal => 5,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, ModelError> {
        match v {
            1 => Ok(TurnRunState::Queueing),
            2 => Ok(TurnRunState::Processing),
            3 => Ok(TurnRunState::Success),
            4 => Ok(TurnRunState::Fail),
            5 => Ok(TurnRunState::Terminal),
            other => Err(ModelError::UnknownDiscriminant {
                kind: "turn_run_state",
                value: other as i64,
            }),
        }
    }
}

/// Whether a row has been consumed downstream.
///
/// On a run-log, `Logged` means the item loop has recorded the final state
/// for that run. On the authoritative item row, `Logged` means the
/// aggregation step has consumed the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Unlogged,
    Logged,
}

impl ResultState {
    pub fn as_i32(&self) -> i32 {
        match self {
            ResultState::Unlogged => 0,
            ResultState::Logged => 1,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self, ModelError> {
        match v {
            0 => Ok(ResultState::Unlogged),
            1 => Ok(ResultState::Logged),
            other => Err(ModelError::UnknownDiscriminant {
                kind: "result_state",
                value: other as i64,
            }),
        }
    }
}

/// Authoritative per-item row. One per `(expt_id, item_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptItemResult {
    pub id: i64,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub item_idx: i32,
    pub status: ItemRunState,
    pub result_state: ResultState,
    #[serde(default)]
    pub err_msg: Option<String>,
    /// The run currently (or most recently) responsible for this item.
    #[serde(default)]
    pub expt_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-item, per-run log row. Immutable once `status` is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptItemResultRunLog {
    pub id: i64,
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub item_id: ItemId,
    pub status: ItemRunState,
    pub result_state: ResultState,
    #[serde(default)]
    pub err_msg: Option<String>,
    /// Correlation log-id active when the row was created.
    pub log_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Authoritative per-turn row. One per `(expt_id, item_id, turn_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptTurnResult {
    pub id: i64,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub turn_idx: i32,
    pub status: TurnRunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-turn, per-run log row carrying the record ids produced by the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptTurnResultRunLog {
    pub id: i64,
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub status: TurnRunState,
    #[serde(default)]
    pub target_result_id: Option<i64>,
    /// At most one entry per evaluator version per run.
    #[serde(default)]
    pub evaluator_result_ids: HashMap<EvaluatorVersionId, i64>,
    #[serde(default)]
    pub err_msg: Option<String>,
    pub log_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for s in [
            ItemRunState::Queueing,
            ItemRunState::Processing,
            ItemRunState::Success,
            ItemRunState::Fail,
            ItemRunState::Terminal,
        ] {
            assert_eq!(ItemRunState::from_i32(s.as_i32()).unwrap(), s);
        }
        assert!(ItemRunState::from_i32(42).is_err());
    }

    #[test]
    fn evaluator_result_ids_serialize_with_id_keys() {
        let mut log = ExptTurnResultRunLog {
            id: 1,
            expt_id: ExptId(1),
            run_id: RunId(10),
            item_id: ItemId(101),
            turn_id: TurnId(201),
            status: TurnRunState::Success,
            target_result_id: Some(7),
            evaluator_result_ids: HashMap::new(),
            err_msg: None,
            log_id: "log".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        log.evaluator_result_ids.insert(EvaluatorVersionId(301), 904);

        let wire = serde_json::to_string(&log).unwrap();
        assert!(wire.contains("\"301\":904"));
        let back: ExptTurnResultRunLog = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.evaluator_result_ids[&EvaluatorVersionId(301)], 904);
    }
}
