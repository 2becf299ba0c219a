//! Records produced by target and evaluator invocations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{EvaluatorVersionId, TargetId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Success,
    Fail,
}

/// Business error reported inside an otherwise-delivered record.
/// `code == 0` means no error.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunError {
    pub code: i32,
    pub message: String,
}

impl RunError {
    pub fn is_set(&self) -> bool {
        self.code != 0
    }
}

/// Output of one target invocation. An `id` of 0 marks a synthesized record
/// that was never persisted (online experiments skip the target).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    pub id: i64,
    #[serde(default)]
    pub target_id: Option<TargetId>,
    pub status: RecordStatus,
    #[serde(default)]
    pub output_fields: HashMap<String, String>,
    #[serde(default)]
    pub run_error: Option<RunError>,
}

impl TargetRecord {
    /// Empty success record for target-skipped experiments.
    pub fn empty() -> Self {
        Self {
            id: 0,
            target_id: None,
            status: RecordStatus::Success,
            output_fields: HashMap::new(),
            run_error: None,
        }
    }

    pub fn persisted_id(&self) -> Option<i64> {
        (self.id != 0).then_some(self.id)
    }

    pub fn has_run_error(&self) -> bool {
        self.run_error.as_ref().is_some_and(RunError::is_set)
    }
}

/// Output of one evaluator invocation against one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorRecord {
    pub id: i64,
    pub evaluator_version_id: EvaluatorVersionId,
    pub status: RecordStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub run_error: Option<RunError>,
}

impl EvaluatorRecord {
    pub fn has_run_error(&self) -> bool {
        self.run_error.as_ref().is_some_and(RunError::is_set)
    }
}

/// One message of the conversation history forwarded to the target.
/// Reserved: nothing populates history yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}
