//! Per-turn target invocation and evaluator fan-out.
//!
//! Turns run strictly in order; within one turn the pending evaluators run
//! in a bounded pool that collects errors while siblings finish. Every turn
//! persists its run-log before the next turn starts, so a crash mid-item
//! loses at most the turn in flight.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

use super::EngineDeps;
use crate::config::ExptExecConf;
use crate::error::{ExptError, Result};
use crate::infra::ErrCtrl;
use crate::services::{
    BenefitDenyReason, CheckBenefitRequest, ExecuteTargetRequest,
    RunEvaluatorRequest,
};
use verdex_model::{
    EvaluationSetItem, EvaluatorRecord, EvaluatorVersionId, Experiment,
    ExptTurnResultRunLog, ExptType, FieldAdapter, ItemEvalEvent, Message,
    RecordStatus, TargetRecord, Turn, TurnId, TurnRunState,
};

/// Everything one item evaluation carries between turns.
#[derive(Debug)]
pub struct ItemEvalCtx {
    pub event: ItemEvalEvent,
    pub expt: Experiment,
    pub eval_item: EvaluationSetItem,
    /// Run-log per turn for this run, materialized by PreEval.
    pub turn_logs: HashMap<TurnId, ExptTurnResultRunLog>,
}

#[derive(Default)]
struct TurnOutcome {
    target: Option<TargetRecord>,
    evaluators: HashMap<EvaluatorVersionId, EvaluatorRecord>,
    eval_err: Option<ExptError>,
}

struct EvalFanout {
    records: HashMap<EvaluatorVersionId, EvaluatorRecord>,
    err: Option<ExptError>,
}

#[derive(Clone)]
pub struct TurnEvaluator {
    deps: EngineDeps,
}

impl std::fmt::Debug for TurnEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnEvaluator").finish()
    }
}

impl TurnEvaluator {
    pub fn new(deps: EngineDeps) -> Self {
        Self { deps }
    }

    /// Drive every turn of the item in order. The first turn error aborts
    /// the remaining turns; its classified form is returned.
    pub async fn eval_turns(&self, ctx: &mut ItemEvalCtx) -> Result<()> {
        let space_id = ctx.event.space_id;
        let mode = ctx.event.mode;
        let conf = self.deps.configer.expt_exec_conf(space_id);
        let err_ctrl = self.deps.configer.err_ctrl();

        // Reserved: history threading is a stub until targets consume it.
        let history: Vec<Message> = Vec::new();
        let turns = ctx.eval_item.turns.clone();
        for turn in &turns {
            self.deps.metric.emit_turn_exec_eval(space_id, mode);
            let outcome = AssertUnwindSafe(
                self.eval_turn(ctx, turn, &history, &conf),
            )
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| TurnOutcome {
                eval_err: Some(ExptError::Panic(panic_msg(payload))),
                ..Default::default()
            });

            let turn_err =
                self.store_turn_run_result(ctx, turn, outcome, &err_ctrl).await?;
            self.deps
                .metric
                .emit_turn_exec_result(space_id, mode, turn_err.is_some());
            if let Some(err) = turn_err {
                return Err(err);
            }
        }

        // Let the last turn's writes land before the run-log is finalized.
        tokio::time::sleep(conf.pacing.turn_settle()).await;
        Ok(())
    }

    async fn eval_turn(
        &self,
        ctx: &ItemEvalCtx,
        turn: &Turn,
        history: &[Message],
        conf: &ExptExecConf,
    ) -> TurnOutcome {
        let mut outcome = TurnOutcome::default();
        let Some(log) = ctx.turn_logs.get(&turn.id).cloned() else {
            outcome.eval_err =
                Some(ExptError::internal("turn run-log missing"));
            return outcome;
        };
        let ext = self.turn_ext(ctx, turn);

        let target = match self.call_target(ctx, turn, &log, history, &ext).await
        {
            Ok(target) => target,
            Err(err) => {
                outcome.eval_err = Some(err);
                return outcome;
            }
        };
        self.deps
            .metric
            .emit_turn_exec_target_result(ctx.event.space_id, target.has_run_error());
        if target.has_run_error() {
            let run_err = target.run_error.clone().unwrap_or_default();
            outcome.eval_err =
                Some(ExptError::target_result(run_err.code, run_err.message));
            outcome.target = Some(target);
            return outcome;
        }
        outcome.target = Some(target);

        let fanout = self.call_evaluators(ctx, turn, &log, &outcome, &ext, conf).await;
        match fanout {
            Ok(EvalFanout { records, err }) => {
                outcome.evaluators = records;
                outcome.eval_err = err.or_else(|| {
                    outcome.evaluators.values().find_map(|rec| {
                        rec.run_error
                            .as_ref()
                            .filter(|e| e.is_set())
                            .map(|e| {
                                ExptError::evaluator_result(e.code, e.message.clone())
                            })
                    })
                });
            }
            Err(err) => outcome.eval_err = Some(err),
        }
        outcome
    }

    /// Ingress extension map seeded from the turn and the experiment's
    /// upstream identity, forwarded on every downstream RPC.
    fn turn_ext(&self, ctx: &ItemEvalCtx, turn: &Turn) -> HashMap<String, String> {
        let mut ext = ctx.event.ext.clone();
        if let Some(span_id) = turn.field("span_id") {
            ext.insert("span_id".to_string(), span_id.to_string());
        }
        ext.insert("task_id".to_string(), ctx.expt.source_id.to_string());
        ext.insert(
            "workspace_id".to_string(),
            ctx.event.space_id.to_string(),
        );
        ext.insert(
            "start_time".to_string(),
            (ctx.eval_item.created_at.timestamp_millis() * 1_000).to_string(),
        );
        ext
    }

    async fn call_target(
        &self,
        ctx: &ItemEvalCtx,
        turn: &Turn,
        log: &ExptTurnResultRunLog,
        history: &[Message],
        ext: &HashMap<String, String>,
    ) -> Result<TargetRecord> {
        // Online experiments already captured the target output upstream.
        if ctx.expt.expt_type == ExptType::Online {
            return Ok(TargetRecord::empty());
        }

        if let Some(record_id) = log.target_result_id
            && let Some(record) = self
                .deps
                .targets
                .get_record_by_id(ctx.event.space_id, record_id)
                .await?
            && record.status == RecordStatus::Success
            && !record.has_run_error()
        {
            debug!(
                expt_id = %ctx.event.expt_id,
                turn_id = %turn.id,
                record_id,
                "reusing cached target record"
            );
            return Ok(record);
        }

        self.check_benefit(ctx, ext).await?;
        let Some(target) = ctx.expt.target else {
            // Target-skipped experiment: evaluators score the set fields.
            return Ok(TargetRecord::empty());
        };

        let ingress = &ctx.expt.eval_conf.connector.target_conf.ingress_conf;
        let fields = apply_adapter(&ingress.eval_set_adapter, |from| {
            turn.field(from).map(str::to_string)
        });
        self.deps
            .targets
            .execute_target(ExecuteTargetRequest {
                space_id: ctx.event.space_id,
                expt_id: ctx.event.expt_id,
                item_id: ctx.event.eval_set_item_id,
                turn_id: turn.id,
                target,
                fields,
                history: history.to_vec(),
                session: ctx.event.session.clone(),
                ext: ext.clone(),
            })
            .await
    }

    async fn call_evaluators(
        &self,
        ctx: &ItemEvalCtx,
        turn: &Turn,
        log: &ExptTurnResultRunLog,
        outcome: &TurnOutcome,
        ext: &HashMap<String, String>,
        conf: &ExptExecConf,
    ) -> Result<EvalFanout> {
        // Only records that landed successfully count as cached; a failed
        // record keeps its evaluator pending for the retry pass.
        let mut reusable: HashSet<EvaluatorVersionId> = HashSet::new();
        if !log.evaluator_result_ids.is_empty() {
            let record_ids: Vec<i64> =
                log.evaluator_result_ids.values().copied().collect();
            let records = self
                .deps
                .evaluator_records
                .batch_get_evaluator_records(ctx.event.space_id, &record_ids)
                .await?;
            let reusable_ids: HashSet<i64> = records
                .iter()
                .filter(|r| {
                    r.status == RecordStatus::Success && !r.has_run_error()
                })
                .map(|r| r.id)
                .collect();
            for (version_id, record_id) in &log.evaluator_result_ids {
                if reusable_ids.contains(record_id) {
                    debug!(
                        expt_id = %ctx.event.expt_id,
                        turn_id = %turn.id,
                        evaluator = %version_id,
                        record_id,
                        "reusing cached evaluator record"
                    );
                    reusable.insert(*version_id);
                }
            }
        }
        let pending: Vec<EvaluatorVersionId> = ctx
            .expt
            .evaluator_version_ids
            .iter()
            .copied()
            .filter(|v| !reusable.contains(v))
            .collect();
        if pending.is_empty() {
            return Ok(EvalFanout {
                records: HashMap::new(),
                err: None,
            });
        }
        self.check_benefit(ctx, ext).await?;

        let evaluators_conf = &ctx.expt.eval_conf.connector.evaluators_conf;
        let concur = evaluators_conf
            .evaluator_concur_num
            .unwrap_or(conf.evaluator_concur_num)
            .max(1);
        let target_fields = outcome
            .target
            .as_ref()
            .map(|t| t.output_fields.clone())
            .unwrap_or_default();
        let target_record_id =
            outcome.target.as_ref().and_then(|t| t.persisted_id());

        let calls = pending.into_iter().map(|version_id| {
            let mut fields = HashMap::new();
            if let Some(ingress) = evaluators_conf.ingress_for(version_id) {
                fields.extend(apply_adapter(&ingress.target_adapter, |from| {
                    target_fields.get(from).cloned()
                }));
                fields.extend(apply_adapter(&ingress.eval_set_adapter, |from| {
                    turn.field(from).map(str::to_string)
                }));
            }
            let req = RunEvaluatorRequest {
                space_id: ctx.event.space_id,
                expt_id: ctx.event.expt_id,
                item_id: ctx.event.eval_set_item_id,
                turn_id: turn.id,
                evaluator_version_id: version_id,
                fields,
                target_record_id,
                session: ctx.event.session.clone(),
                ext: ext.clone(),
            };
            let svc: Arc<dyn crate::services::EvaluatorService> =
                self.deps.evaluators.clone();
            async move { (version_id, svc.run_evaluator(req).await) }
        });
        let results: Vec<(EvaluatorVersionId, Result<EvaluatorRecord>)> =
            stream::iter(calls).buffer_unordered(concur).collect().await;

        let mut records = HashMap::new();
        let mut first_err = None;
        for (version_id, result) in results {
            match result {
                Ok(record) => {
                    self.deps.metric.emit_turn_exec_evaluator_result(
                        ctx.event.space_id,
                        record.has_run_error(),
                    );
                    records.insert(version_id, record);
                }
                Err(err) => {
                    self.deps
                        .metric
                        .emit_turn_exec_evaluator_result(ctx.event.space_id, true);
                    warn!(
                        expt_id = %ctx.event.expt_id,
                        evaluator = %version_id,
                        %err,
                        "evaluator call failed"
                    );
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }
        Ok(EvalFanout {
            records,
            err: first_err,
        })
    }

    async fn check_benefit(
        &self,
        ctx: &ItemEvalCtx,
        ext: &HashMap<String, String>,
    ) -> Result<()> {
        let check = self
            .deps
            .benefits
            .check_and_deduct_eval_benefit(CheckBenefitRequest {
                expt_id: ctx.event.expt_id,
                space_id: ctx.event.space_id,
                free_cost: ctx.expt.credit_cost.is_free(),
                session: ctx.event.session.clone(),
                ext: ext.clone(),
            })
            .await?;
        match check.deny_reason {
            None => Ok(()),
            Some(BenefitDenyReason::InDebt) => {
                Err(ExptError::InDebt("eval benefit exhausted".to_string()))
            }
            Some(BenefitDenyReason::Denied(reason)) => {
                Err(ExptError::BenefitDenied(reason))
            }
        }
    }

    /// Fold one turn's outcome into its run-log and persist it. Returns the
    /// classified, sanitized error when the turn failed.
    async fn store_turn_run_result(
        &self,
        ctx: &mut ItemEvalCtx,
        turn: &Turn,
        outcome: TurnOutcome,
        err_ctrl: &ErrCtrl,
    ) -> Result<Option<ExptError>> {
        let mut log = ctx
            .turn_logs
            .get(&turn.id)
            .cloned()
            .ok_or_else(|| ExptError::internal("turn run-log missing"))?;
        log.run_id = ctx.event.run_id;
        if let Some(id) = outcome.target.as_ref().and_then(|t| t.persisted_id()) {
            log.target_result_id = Some(id);
        }
        for (version_id, record) in &outcome.evaluators {
            log.evaluator_result_ids.insert(*version_id, record.id);
        }

        let turn_err = match outcome.eval_err {
            Some(err) => {
                let classified = sanitize_turn_err(err, err_ctrl);
                log.status = TurnRunState::Fail;
                log.err_msg = Some(classified.to_wire());
                Some(classified)
            }
            None => {
                log.status = TurnRunState::Success;
                log.err_msg = None;
                None
            }
        };
        self.deps.stores.turns.save_run_log(&log).await?;
        ctx.turn_logs.insert(turn.id, log);
        Ok(turn_err)
    }
}

/// Map `from_field → lookup(from_field)`, falling back to the constant
/// configured on the field.
fn apply_adapter(
    adapter: &FieldAdapter,
    lookup: impl Fn(&str) -> Option<String>,
) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for conf in &adapter.field_confs {
        let value = if conf.from_field.is_empty() {
            None
        } else {
            lookup(&conf.from_field)
        };
        if let Some(value) = value.or_else(|| conf.value.clone()) {
            out.insert(conf.field_name.clone(), value);
        }
    }
    out
}

/// Sanitize the user-visible message while keeping the classification;
/// unclassifiable errors collapse into the turn-scope wrapper.
fn sanitize_turn_err(err: ExptError, err_ctrl: &ErrCtrl) -> ExptError {
    let message = err_ctrl.convert_err_msg(&err.to_string());
    match err {
        ExptError::TargetResult { code, .. } => {
            ExptError::TargetResult { code, message }
        }
        ExptError::EvaluatorResult { code, .. } => {
            ExptError::EvaluatorResult { code, message }
        }
        ExptError::Internal(_) => ExptError::Internal(message),
        ExptError::Panic(_) => ExptError::Panic(message),
        ExptError::InDebt(_) => ExptError::InDebt(message),
        ExptError::BenefitDenied(_) => ExptError::BenefitDenied(message),
        zombie @ ExptError::Zombie { .. } => zombie,
        _ => ExptError::TurnOther { message },
    }
}

fn panic_msg(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdex_model::FieldConf;

    #[test]
    fn adapter_prefers_the_source_field_over_the_constant() {
        let adapter = FieldAdapter {
            field_confs: vec![
                FieldConf {
                    field_name: "input".into(),
                    from_field: "question".into(),
                    value: Some("fallback".into()),
                },
                FieldConf {
                    field_name: "lang".into(),
                    from_field: String::new(),
                    value: Some("en".into()),
                },
                FieldConf {
                    field_name: "missing".into(),
                    from_field: "absent".into(),
                    value: None,
                },
            ],
        };
        let out = apply_adapter(&adapter, |from| {
            (from == "question").then(|| "hello".to_string())
        });
        assert_eq!(out.get("input").map(String::as_str), Some("hello"));
        assert_eq!(out.get("lang").map(String::as_str), Some("en"));
        assert!(!out.contains_key("missing"));
    }

    #[test]
    fn unclassified_errors_become_turn_scope() {
        let ctrl = ErrCtrl::default();
        let err = sanitize_turn_err(ExptError::Store("db down".into()), &ctrl);
        assert!(matches!(err, ExptError::TurnOther { .. }));

        let err =
            sanitize_turn_err(ExptError::target_result(42, "bad call"), &ctrl);
        assert!(matches!(err, ExptError::TargetResult { code: 42, .. }));
    }
}
