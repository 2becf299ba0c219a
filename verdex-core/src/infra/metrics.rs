//! Metric emission points of the two loops.
//!
//! The engine emits counters, not aggregates; [`TracingMetric`] renders
//! them as structured `tracing` events under the `expt::metric` target and
//! a real deployment can swap in an exporter. [`CaptureMetric`] records
//! emissions for test assertions.

use std::sync::Mutex;

use verdex_model::{EvalMode, SpaceId};

/// Outcome of one item-loop pass, emitted by the error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemExecMetric {
    pub mode: EvalMode,
    pub failed: bool,
    pub will_retry: bool,
    /// Whether the error had a known classification.
    pub stable: bool,
    pub code: i32,
    /// `create_at` of the consumed event, for end-to-end latency.
    pub create_at: i64,
}

pub trait ExptMetric: Send + Sync {
    fn emit_item_exec_eval(&self, space_id: SpaceId, mode: EvalMode);
    fn emit_item_exec_result(&self, space_id: SpaceId, metric: ItemExecMetric);
    fn emit_turn_exec_eval(&self, space_id: SpaceId, mode: EvalMode);
    fn emit_turn_exec_result(&self, space_id: SpaceId, mode: EvalMode, failed: bool);
    fn emit_turn_exec_target_result(&self, space_id: SpaceId, failed: bool);
    fn emit_turn_exec_evaluator_result(&self, space_id: SpaceId, failed: bool);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetric;

impl ExptMetric for TracingMetric {
    fn emit_item_exec_eval(&self, space_id: SpaceId, mode: EvalMode) {
        tracing::debug!(target: "expt::metric", space = %space_id, %mode, "item_exec_eval");
    }

    fn emit_item_exec_result(&self, space_id: SpaceId, metric: ItemExecMetric) {
        tracing::info!(
            target: "expt::metric",
            space = %space_id,
            mode = %metric.mode,
            failed = metric.failed,
            will_retry = metric.will_retry,
            stable = metric.stable,
            code = metric.code,
            create_at = metric.create_at,
            "item_exec_result"
        );
    }

    fn emit_turn_exec_eval(&self, space_id: SpaceId, mode: EvalMode) {
        tracing::debug!(target: "expt::metric", space = %space_id, %mode, "turn_exec_eval");
    }

    fn emit_turn_exec_result(&self, space_id: SpaceId, mode: EvalMode, failed: bool) {
        tracing::debug!(target: "expt::metric", space = %space_id, %mode, failed, "turn_exec_result");
    }

    fn emit_turn_exec_target_result(&self, space_id: SpaceId, failed: bool) {
        tracing::debug!(target: "expt::metric", space = %space_id, failed, "turn_exec_target_result");
    }

    fn emit_turn_exec_evaluator_result(&self, space_id: SpaceId, failed: bool) {
        tracing::debug!(target: "expt::metric", space = %space_id, failed, "turn_exec_evaluator_result");
    }
}

/// Every emission, in order, for tests.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    ItemExecEval(SpaceId, EvalMode),
    ItemExecResult(SpaceId, ItemExecMetric),
    TurnExecEval(SpaceId, EvalMode),
    TurnExecResult(SpaceId, EvalMode, bool),
    TurnExecTargetResult(SpaceId, bool),
    TurnExecEvaluatorResult(SpaceId, bool),
}

#[derive(Debug, Default)]
pub struct CaptureMetric {
    events: Mutex<Vec<MetricEvent>>,
}

impl CaptureMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<MetricEvent> {
        std::mem::take(&mut self.events.lock().expect("metric lock"))
    }

    pub fn item_results(&self) -> Vec<ItemExecMetric> {
        self.events
            .lock()
            .expect("metric lock")
            .iter()
            .filter_map(|event| match event {
                MetricEvent::ItemExecResult(_, metric) => Some(*metric),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: MetricEvent) {
        self.events.lock().expect("metric lock").push(event);
    }
}

impl ExptMetric for CaptureMetric {
    fn emit_item_exec_eval(&self, space_id: SpaceId, mode: EvalMode) {
        self.push(MetricEvent::ItemExecEval(space_id, mode));
    }

    fn emit_item_exec_result(&self, space_id: SpaceId, metric: ItemExecMetric) {
        self.push(MetricEvent::ItemExecResult(space_id, metric));
    }

    fn emit_turn_exec_eval(&self, space_id: SpaceId, mode: EvalMode) {
        self.push(MetricEvent::TurnExecEval(space_id, mode));
    }

    fn emit_turn_exec_result(&self, space_id: SpaceId, mode: EvalMode, failed: bool) {
        self.push(MetricEvent::TurnExecResult(space_id, mode, failed));
    }

    fn emit_turn_exec_target_result(&self, space_id: SpaceId, failed: bool) {
        self.push(MetricEvent::TurnExecTargetResult(space_id, failed));
    }

    fn emit_turn_exec_evaluator_result(&self, space_id: SpaceId, failed: bool) {
        self.push(MetricEvent::TurnExecEvaluatorResult(space_id, failed));
    }
}
