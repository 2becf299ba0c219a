//! The per-run scheduler loop.
//!
//! Consumes one [`ScheduleEvent`] through the middleware chain: error
//! handler (outermost, panic-recovering), freshness check, distributed
//! lock, then the mode-driven schedule cycle.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CompleteOpts, EngineDeps, ExptManager, ModeFactory, ScanBuckets};
use crate::config::ExptExecConf;
use crate::error::{ExptError, Result};
use verdex_model::{
    Experiment, ExptItemResultRunLog, ExptStatsDelta, ExptStatus,
    ItemEvalEvent, ItemRunState, ScheduleEvent, TurnRunState,
};

pub struct SchedulerLoop {
    deps: EngineDeps,
    manager: Arc<ExptManager>,
    modes: ModeFactory,
}

impl std::fmt::Debug for SchedulerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerLoop").finish()
    }
}

impl SchedulerLoop {
    pub fn new(deps: EngineDeps, manager: Arc<ExptManager>) -> Arc<Self> {
        let modes = ModeFactory::new(&deps, manager.clone());
        Arc::new(Self {
            deps,
            manager,
            modes,
        })
    }

    /// Outermost middleware. Never bubbles a cycle failure to the queue:
    /// any error (including a recovered panic) fails the experiment and the
    /// event is acknowledged.
    pub async fn handle(self: &Arc<Self>, event: ScheduleEvent) -> Result<()> {
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
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(
                    expt_id = %event.expt_id,
                    run_id = %event.run_id,
                    %err,
                    "schedule cycle failed, failing experiment"
                );
                let cid = format!("exptexec:onerr:{}", event.run_id);
                let completion = async {
                    self.manager
                        .complete_run(
                            event.expt_id,
                            event.run_id,
                            event.space_id,
                            Some(&cid),
                        )
                        .await?;
                    self.manager
                        .complete_expt(
                            event.expt_id,
                            event.space_id,
                            CompleteOpts::with_cid(&cid)
                                .status(ExptStatus::Failed)
                                .message(err.to_string()),
                        )
                        .await
                };
                if let Err(complete_err) = completion.await {
                    warn!(
                        expt_id = %event.expt_id,
                        run_id = %event.run_id,
                        %complete_err,
                        "failed to record the experiment failure"
                    );
                }
                Ok(())
            }
        }
    }

    /// Freshness check + lock, then the schedule cycle.
    async fn guarded(self: Arc<Self>, event: ScheduleEvent) -> Result<()> {
        let expt = self
            .manager
            .get_detail(event.space_id, event.expt_id)
            .await?;
        if expt.is_finished() {
            debug!(expt_id = %event.expt_id, "experiment finished, dropping event");
            return Ok(());
        }
        let conf = self.deps.configer.expt_exec_conf(event.space_id);
        let age = event.age_secs(Utc::now());
        let limit = conf.zombie_interval_secs.0;
        if limit > 0 && age >= limit {
            return Err(ExptError::Zombie {
                age_secs: age,
                limit_secs: limit,
            });
        }

        let key = format!("expt_run_exec_lock:{}:{}", event.expt_id, event.run_id);
        let Some(guard) = self
            .deps
            .locker
            .lock_with_renew(&key, conf.locks.ttl(), conf.locks.run_max_hold())
            .await?
        else {
            debug!(expt_id = %event.expt_id, run_id = %event.run_id, "run owned elsewhere");
            return Ok(());
        };

        let result = self.schedule(&event, expt, &conf).await;
        guard.unlock().await?;
        result
    }

    async fn schedule(
        &self,
        event: &ScheduleEvent,
        mut expt: Experiment,
        conf: &ExptExecConf,
    ) -> Result<()> {
        let driver = self.modes.driver(event.mode);
        driver.expt_start(event, &mut expt).await?;
        driver.schedule_start(event, &mut expt).await?;

        let buckets = driver.scan_eval_items(event, &expt).await?;
        debug!(
            expt_id = %event.expt_id,
            run_id = %event.run_id,
            to_submit = buckets.to_submit.len(),
            incomplete = buckets.incomplete.len(),
            complete = buckets.complete.len(),
            "scan cycle"
        );
        self.handle_zombies(&buckets.incomplete, conf);
        self.record_eval_item_run_logs(event, &buckets.complete, conf)
            .await?;

        driver
            .schedule_end(
                event,
                &expt,
                buckets.to_submit.len(),
                buckets.incomplete.len(),
            )
            .await?;
        let next_tick = driver
            .expt_end(
                event,
                &expt,
                buckets.to_submit.len(),
                buckets.incomplete.len(),
            )
            .await?;
        self.handle_to_submits(event, conf, buckets).await?;
        driver.next_tick(event, next_tick).await
    }

    /// Observability only: a Processing item whose run-log went stale is
    /// warn-logged, never mutated.
    fn handle_zombies(
        &self,
        incomplete: &[ExptItemResultRunLog],
        conf: &ExptExecConf,
    ) {
        let now = Utc::now();
        for log in incomplete {
            let age = now.signed_duration_since(log.updated_at).num_seconds();
            if age > conf.item_eval.zombie_secs {
                warn!(
                    expt_id = %log.expt_id,
                    run_id = %log.run_id,
                    item_id = %log.item_id,
                    age_secs = age,
                    "item stuck in processing"
                );
            }
        }
    }

    /// Push every completed item's run-log into the aggregation service,
    /// with exponential backoff per item.
    async fn record_eval_item_run_logs(
        &self,
        event: &ScheduleEvent,
        complete: &[ExptItemResultRunLog],
        conf: &ExptExecConf,
    ) -> Result<()> {
        for log in complete {
            if !log.status.is_finished() {
                continue;
            }
            let started = tokio::time::Instant::now();
            let mut backoff = conf.aggregation.backoff_base();
            loop {
                match self
                    .deps
                    .results
                    .record_item_run_logs(
                        event.expt_id,
                        event.run_id,
                        log.item_id,
                        event.space_id,
                    )
                    .await
                {
                    Ok(()) => break,
                    Err(err) if started.elapsed() < conf.aggregation.max_elapsed() => {
                        warn!(
                            expt_id = %event.expt_id,
                            item_id = %log.item_id,
                            %err,
                            "aggregation failed, backing off"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(conf.aggregation.backoff_max());
                    }
                    Err(err) => return Err(err),
                }
            }
            tokio::time::sleep(conf.pacing.aggregation_spacing()).await;
        }
        Ok(())
    }

    /// Publish item events for the submit bucket and move everything the
    /// batch covers to Processing.
    async fn handle_to_submits(
        &self,
        event: &ScheduleEvent,
        conf: &ExptExecConf,
        buckets: ScanBuckets,
    ) -> Result<()> {
        let eligible: Vec<ExptItemResultRunLog> = buckets
            .to_submit
            .into_iter()
            .filter(|log| !log.status.is_finished())
            .collect();
        if eligible.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let events: Vec<ItemEvalEvent> = eligible
            .iter()
            .map(|log| ItemEvalEvent {
                expt_id: event.expt_id,
                run_id: event.run_id,
                space_id: event.space_id,
                mode: event.mode,
                eval_set_item_id: log.item_id,
                create_at: now,
                retry_times: 0,
                ext: event.ext.clone(),
                session: event.session.clone(),
            })
            .collect();
        info!(
            expt_id = %event.expt_id,
            run_id = %event.run_id,
            n = events.len(),
            "submitting items"
        );
        self.deps
            .publisher
            .batch_publish_items(events, Some(conf.item_eval.interval()))
            .await?;

        let item_ids: Vec<_> = eligible.iter().map(|log| log.item_id).collect();
        self.deps
            .stores
            .items
            .update_run_log_status(
                event.expt_id,
                event.run_id,
                &item_ids,
                ItemRunState::Processing,
            )
            .await?;
        self.deps
            .stores
            .items
            .update_status(
                event.expt_id,
                &item_ids,
                ItemRunState::Processing,
                Some(event.run_id),
            )
            .await?;
        self.deps
            .stores
            .turns
            .update_status_by_items(
                event.expt_id,
                &item_ids,
                TurnRunState::Processing,
            )
            .await?;

        let n_turns = self
            .deps
            .stores
            .turns
            .count_by_items(event.expt_id, &item_ids)
            .await?;
        self.deps
            .stores
            .stats
            .arith_operate_count(
                event.expt_id,
                ExptStatsDelta {
                    processing: n_turns,
                    queueing: -n_turns,
                    ..Default::default()
                },
            )
            .await
    }
}
