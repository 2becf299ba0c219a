//! Experiment configuration: the immutable pairing of an evaluation-set
//! version, an optional target, and one or more evaluator versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{
    EvalSetId, EvalSetVersionId, EvaluatorVersionId, ExptId, SpaceId, TargetId,
    TargetVersionId,
};

/// Lifecycle state of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExptStatus {
    Pending,
    Processing,
    /// Terminal-bound: no new items are accepted (Append mode only).
    Draining,
    Success,
    Failed,
    Terminated,
}

impl ExptStatus {
    /// Finished experiments receive no further state transitions except
    /// idempotent end operations.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExptStatus::Success | ExptStatus::Failed | ExptStatus::Terminated
        )
    }
}

/// Whether the experiment evaluates offline (target invoked per turn) or
/// online (target output already captured upstream; target skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExptType {
    Offline,
    Online,
}

/// Billing classification forwarded to the benefit service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditCost {
    Free,
    Cost,
}

impl CreditCost {
    pub fn is_free(&self) -> bool {
        matches!(self, CreditCost::Free)
    }
}

/// The system under test, pinned to a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    pub target_id: TargetId,
    pub version_id: TargetVersionId,
}

/// The evaluation set, pinned to a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalSetRef {
    pub set_id: EvalSetId,
    pub version_id: EvalSetVersionId,
}

/// One field mapping: read `from_field` out of a source record and present
/// it to the callee under `field_name`. `value` is a constant fallback used
/// when `from_field` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldConf {
    pub field_name: String,
    pub from_field: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// An ordered list of field mappings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FieldAdapter {
    pub field_confs: Vec<FieldConf>,
}

/// Ingress mappings for the target call: evaluation-set fields to target
/// input fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetIngressConf {
    pub eval_set_adapter: FieldAdapter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetConf {
    pub ingress_conf: TargetIngressConf,
}

/// Ingress mappings for one evaluator: target output fields plus
/// evaluation-set fields, merged into a single input map.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvaluatorIngressConf {
    pub target_adapter: FieldAdapter,
    pub eval_set_adapter: FieldAdapter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvaluatorsConf {
    /// Per-turn evaluator fan-out width. `None` falls back to the engine
    /// default.
    #[serde(default)]
    pub evaluator_concur_num: Option<usize>,
    /// Mapping applied when no per-evaluator override exists.
    #[serde(default)]
    pub default_conf: Option<EvaluatorIngressConf>,
    /// Per-evaluator-version overrides.
    #[serde(default)]
    pub per_evaluator: HashMap<EvaluatorVersionId, EvaluatorIngressConf>,
}

impl EvaluatorsConf {
    pub fn ingress_for(
        &self,
        id: EvaluatorVersionId,
    ) -> Option<&EvaluatorIngressConf> {
        self.per_evaluator.get(&id).or(self.default_conf.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectorConf {
    pub target_conf: TargetConf,
    pub evaluators_conf: EvaluatorsConf,
}

/// Execution-shaping configuration attached to one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EvalConf {
    /// Max items of this experiment in flight at once. `None` falls back to
    /// the per-space config default.
    #[serde(default)]
    pub item_concur_num: Option<usize>,
    pub connector: ConnectorConf,
}

/// A configured evaluation experiment. Immutable once running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExptId,
    pub space_id: SpaceId,
    pub name: String,
    /// Upstream task identity; seeds the correlation log-id.
    pub source_id: i64,
    pub expt_type: ExptType,
    pub status: ExptStatus,
    #[serde(default)]
    pub status_message: String,
    /// `None` means a target-skipped experiment.
    pub target: Option<TargetRef>,
    /// Ordered; every turn is scored by each of these.
    pub evaluator_version_ids: Vec<EvaluatorVersionId>,
    pub eval_set: EvalSetRef,
    pub eval_conf: EvalConf,
    /// Milliseconds; 0 = unbounded. Only meaningful in Append mode.
    pub max_alive_time_ms: i64,
    pub start_at: DateTime<Utc>,
    pub credit_cost: CreditCost,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Whether the alive window has elapsed. Never true for
    /// `max_alive_time_ms == 0`.
    pub fn alive_time_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.max_alive_time_ms > 0
            && now
                .signed_duration_since(self.start_at)
                .num_milliseconds()
                > self.max_alive_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_statuses() {
        assert!(ExptStatus::Success.is_finished());
        assert!(ExptStatus::Failed.is_finished());
        assert!(ExptStatus::Terminated.is_finished());
        assert!(!ExptStatus::Pending.is_finished());
        assert!(!ExptStatus::Processing.is_finished());
        assert!(!ExptStatus::Draining.is_finished());
    }

    #[test]
    fn ingress_falls_back_to_default_conf() {
        let mut conf = EvaluatorsConf::default();
        let ver = EvaluatorVersionId(301);
        assert!(conf.ingress_for(ver).is_none());

        conf.default_conf = Some(EvaluatorIngressConf::default());
        assert!(conf.ingress_for(ver).is_some());

        let override_conf = EvaluatorIngressConf {
            target_adapter: FieldAdapter {
                field_confs: vec![FieldConf {
                    field_name: "out".into(),
                    from_field: "actual_output".into(),
                    value: None,
                }],
            },
            eval_set_adapter: FieldAdapter::default(),
        };
        conf.per_evaluator.insert(ver, override_conf);
        let got = conf.ingress_for(ver).unwrap();
        assert_eq!(got.target_adapter.field_confs.len(), 1);
    }
}
