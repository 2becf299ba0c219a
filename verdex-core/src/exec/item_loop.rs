//! The per-item evaluation loop.
//!
//! Consumes one [`ItemEvalEvent`] through the same middleware shape as the
//! scheduler: error handler (outermost, panic-recovering), freshness check,
//! per-item distributed lock, then turn evaluation. The error handler owns
//! the retry / terminate routing, so a failed pass never poisons the queue.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::correlation;
use super::turn_eval::ItemEvalCtx;
use super::{CompleteOpts, EngineDeps, ErrorClassifier, ExptManager, TurnEvaluator};
use crate::error::{ExptError, Result};
use crate::infra::ItemExecMetric;
use verdex_model::{
    EvalMode, EvaluationSetItem, Experiment, ExptStatus, ExptTurnResultRunLog,
    ItemEvalEvent, ItemRunState, ResultState, TurnId, TurnRunState,
};

pub struct ItemEvalLoop {
    deps: EngineDeps,
    manager: Arc<ExptManager>,
    turn_eval: TurnEvaluator,
    classifier: ErrorClassifier,
}

impl std::fmt::Debug for ItemEvalLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemEvalLoop").finish()
    }
}

impl ItemEvalLoop {
    pub fn new(deps: EngineDeps, manager: Arc<ExptManager>) -> Arc<Self> {
        let turn_eval = TurnEvaluator::new(deps.clone());
        let classifier = ErrorClassifier::new(deps.configer.clone());
        Arc::new(Self {
            deps,
            manager,
            turn_eval,
            classifier,
        })
    }

    /// Outermost middleware. Errors route to retry, termination, or a
    /// final ack; the queue never sees a failure.
    pub async fn handle(self: &Arc<Self>, event: ItemEvalEvent) -> Result<()> {
        self.deps
            .metric
            .emit_item_exec_eval(event.space_id, event.mode);

        let this = self.clone();
        let inner_event = event.clone();
        let outcome =
            match tokio::spawn(async move { this.guarded(inner_event).await })
                .await
            {
                Ok(result) => result,
                Err(join_err) => Err(ExptError::Panic(join_err.to_string())),
            };

        match outcome {
            Ok(()) => {
                self.emit_result(&event, None, false);
                Ok(())
            }
            Err(err) => self.route_err(&event, err).await,
        }
    }

    async fn route_err(&self, event: &ItemEvalEvent, err: ExptError) -> Result<()> {
        if self
            .classifier
            .eval_err_need_terminate_expt(event.space_id, &err)
        {
            self.emit_result(event, Some(&err), false);
            warn!(
                expt_id = %event.expt_id,
                run_id = %event.run_id,
                %err,
                "terminating experiment"
            );
            let cid = format!("terminate:indebt:{}", event.run_id);
            self.manager
                .complete_run(event.expt_id, event.run_id, event.space_id, Some(&cid))
                .await?;
            self.manager
                .complete_expt(
                    event.expt_id,
                    event.space_id,
                    CompleteOpts::with_cid(&cid)
                        .status(ExptStatus::Terminated)
                        .message(err.to_string()),
                )
                .await?;
            return Ok(());
        }

        if self
            .classifier
            .eval_err_need_retry(event.space_id, event.retry_times, &err)
        {
            self.emit_result(event, Some(&err), true);
            let conf = self.classifier.retry_conf(event.space_id, &err);
            info!(
                expt_id = %event.expt_id,
                item_id = %event.eval_set_item_id,
                retry_times = event.retry_times,
                %err,
                "republishing item event"
            );
            self.deps
                .publisher
                .publish_item(
                    event.clone().next_retry(),
                    Some(conf.retry_interval()),
                )
                .await?;
            return Ok(());
        }

        // Exhausted or fatal; the run-log already carries the failure.
        self.emit_result(event, Some(&err), false);
        warn!(
            expt_id = %event.expt_id,
            item_id = %event.eval_set_item_id,
            %err,
            "item failed, no retries left"
        );
        Ok(())
    }

    fn emit_result(
        &self,
        event: &ItemEvalEvent,
        err: Option<&ExptError>,
        will_retry: bool,
    ) {
        let (failed, stable, code) = match err {
            Some(err) => {
                let (stable, code, _) = ErrorClassifier::parse_status_error(err);
                (true, stable, code)
            }
            None => (false, true, 0),
        };
        self.deps.metric.emit_item_exec_result(
            event.space_id,
            ItemExecMetric {
                mode: event.mode,
                failed,
                will_retry,
                stable,
                code,
                create_at: event.create_at,
            },
        );
    }

    /// Freshness check + per-item lock, then the evaluation pass.
    async fn guarded(self: Arc<Self>, event: ItemEvalEvent) -> Result<()> {
        let expt = self
            .manager
            .get_detail(event.space_id, event.expt_id)
            .await?;
        if expt.is_finished() {
            debug!(expt_id = %event.expt_id, "experiment finished, dropping item event");
            return Ok(());
        }

        let conf = self.deps.configer.expt_exec_conf(event.space_id);
        let key = format!(
            "expt_item_eval_run_lock:{}:{}",
            event.expt_id, event.eval_set_item_id
        );
        let Some(guard) = self
            .deps
            .locker
            .lock_with_renew(&key, conf.locks.ttl(), conf.locks.item_max_hold())
            .await?
        else {
            debug!(
                expt_id = %event.expt_id,
                item_id = %event.eval_set_item_id,
                "item owned elsewhere"
            );
            return Ok(());
        };

        let result = self.eval(&event, expt).await;
        guard.unlock().await?;
        result
    }

    async fn eval(&self, event: &ItemEvalEvent, expt: Experiment) -> Result<()> {
        let mut items = self
            .deps
            .eval_sets
            .batch_get_items(event.space_id, expt.eval_set, &[event.eval_set_item_id])
            .await?;
        if items.len() != 1 {
            return Err(ExptError::internal("invalid item result"));
        }
        let Some(eval_item) = items.pop() else {
            return Err(ExptError::internal("invalid item result"));
        };

        let Some(item_log) = self
            .deps
            .stores
            .items
            .get_run_log(event.expt_id, event.run_id, event.eval_set_item_id)
            .await?
        else {
            return Err(ExptError::internal("item run-log missing"));
        };
        if item_log.status.is_finished() {
            debug!(
                expt_id = %event.expt_id,
                item_id = %event.eval_set_item_id,
                "item run already finished, dropping event"
            );
            return Ok(());
        }

        let turn_logs = self.pre_eval(event, &expt, &eval_item).await?;
        let mut ctx = ItemEvalCtx {
            event: event.clone(),
            expt,
            eval_item,
            turn_logs,
        };
        let run_result = self.turn_eval.eval_turns(&mut ctx).await;
        self.complete_item_run(event, run_result).await
    }

    /// Materialize this run's turn run-logs. Create-if-absent keeps a
    /// redelivered event from clobbering turns an earlier pass finished.
    /// FailRetry seeds new logs from each turn's latest prior log so cached
    /// target and evaluator results carry forward.
    async fn pre_eval(
        &self,
        event: &ItemEvalEvent,
        expt: &Experiment,
        eval_item: &EvaluationSetItem,
    ) -> Result<HashMap<TurnId, ExptTurnResultRunLog>> {
        let existing = self
            .deps
            .stores
            .turns
            .list_run_logs(event.expt_id, event.run_id, event.eval_set_item_id)
            .await?;
        let existing_ids: Vec<TurnId> =
            existing.iter().map(|log| log.turn_id).collect();

        let missing: Vec<_> = eval_item
            .turns
            .iter()
            .filter(|turn| !existing_ids.contains(&turn.id))
            .collect();
        if !missing.is_empty() {
            let priors: HashMap<TurnId, ExptTurnResultRunLog> =
                if event.mode == EvalMode::FailRetry {
                    self.deps
                        .results
                        .get_expt_item_turn_results(
                            event.expt_id,
                            event.eval_set_item_id,
                        )
                        .await?
                        .into_iter()
                        .filter_map(|r| {
                            r.latest_log.map(|log| (r.turn.turn_id, log))
                        })
                        .collect()
                } else {
                    HashMap::new()
                };

            let now = Utc::now();
            let ids = self.deps.idgen.gen_multi_ids(missing.len()).await?;
            let rows: Vec<ExptTurnResultRunLog> = missing
                .iter()
                .zip(ids)
                .map(|(turn, id)| {
                    let prior = priors.get(&turn.id);
                    ExptTurnResultRunLog {
                        id,
                        expt_id: event.expt_id,
                        run_id: event.run_id,
                        item_id: event.eval_set_item_id,
                        turn_id: turn.id,
                        status: TurnRunState::Processing,
                        target_result_id: prior
                            .and_then(|p| p.target_result_id),
                        evaluator_result_ids: prior
                            .map(|p| p.evaluator_result_ids.clone())
                            .unwrap_or_default(),
                        err_msg: None,
                        log_id: correlation::turn_log_id(
                            expt.source_id,
                            event.expt_id,
                            event.run_id,
                            event.space_id,
                            turn.id,
                        ),
                        created_at: now,
                        updated_at: now,
                    }
                })
                .collect();
            self.deps.stores.turns.batch_create_run_logs_nx(&rows).await?;
        }

        // Re-read after the insert so a concurrent winner's rows are the
        // ones this pass works against.
        let logs = self
            .deps
            .stores
            .turns
            .list_run_logs(event.expt_id, event.run_id, event.eval_set_item_id)
            .await?;
        Ok(logs.into_iter().map(|log| (log.turn_id, log)).collect())
    }

    /// Finish the item run-log. A retryable error propagates unfinished so
    /// the next attempt picks the item up where it stopped; everything else
    /// lands a terminal run-log for the scheduler to aggregate.
    async fn complete_item_run(
        &self,
        event: &ItemEvalEvent,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.deps
                    .stores
                    .items
                    .finish_run_log(
                        event.expt_id,
                        event.run_id,
                        event.eval_set_item_id,
                        ItemRunState::Success,
                        None,
                        ResultState::Logged,
                    )
                    .await
            }
            Err(err) => {
                if self.classifier.eval_err_need_retry(
                    event.space_id,
                    event.retry_times,
                    &err,
                ) {
                    return Err(err);
                }
                self.deps
                    .stores
                    .items
                    .finish_run_log(
                        event.expt_id,
                        event.run_id,
                        event.eval_set_item_id,
                        ItemRunState::Fail,
                        Some(err.to_wire()),
                        ResultState::Logged,
                    )
                    .await?;
                Err(err)
            }
        }
    }
}
