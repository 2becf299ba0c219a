//! Mode drivers: the Submit / FailRetry / Append variants of one run.
//!
//! The scheduler core is mode-agnostic; everything mode-specific (seeding
//! rows at start, deciding when the run is over, how the next tick is
//! scheduled) hangs off [`ModeDriver`]. [`BaseScanner`] carries the scan
//! and end-of-experiment logic all three share.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use super::{CompleteOpts, EngineDeps, ExptManager};
use crate::error::Result;
use crate::infra::{Configer, IdempotencyService};
use crate::store::Stores;
use verdex_model::{
    EvalMode, Experiment, ExptItemResultRunLog, ItemRunState, ScheduleEvent,
};

mod append;
mod fail_retry;
mod submit;

pub use append::AppendMode;
pub use fail_retry::FailRetryMode;
pub use submit::SubmitMode;

/// The three run-log pools one scan cycle partitions items into.
#[derive(Debug, Default)]
pub struct ScanBuckets {
    /// Queueing, up to the free concurrency budget.
    pub to_submit: Vec<ExptItemResultRunLog>,
    /// Processing, unbounded.
    pub incomplete: Vec<ExptItemResultRunLog>,
    /// Final state recorded for this run; awaiting aggregation.
    pub complete: Vec<ExptItemResultRunLog>,
}

#[async_trait]
pub trait ModeDriver: Send + Sync {
    fn mode(&self) -> EvalMode;

    /// One-shot per-run setup, guarded by the `expt_start:*` marker.
    async fn expt_start(
        &self,
        event: &ScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<()>;

    /// Cycle-local prework before the scan.
    async fn schedule_start(
        &self,
        event: &ScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<()>;

    async fn scan_eval_items(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanBuckets>;

    /// Cycle-local postwork after aggregation.
    async fn schedule_end(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<()>;

    /// Whether the scheduler should tick again. `false` finalizes the run.
    async fn expt_end(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<bool>;

    /// Republish the schedule event when `next_tick` is set.
    async fn next_tick(&self, event: &ScheduleEvent, next_tick: bool)
    -> Result<()>;
}

/// Scan and end-of-run logic shared by all drivers.
#[derive(Clone)]
pub struct BaseScanner {
    stores: Stores,
    idempotency: Arc<dyn IdempotencyService>,
    configer: Arc<dyn Configer>,
    manager: Arc<ExptManager>,
}

impl BaseScanner {
    pub fn new(deps: &EngineDeps, manager: Arc<ExptManager>) -> Self {
        Self {
            stores: deps.stores.clone(),
            idempotency: deps.idempotency.clone(),
            configer: deps.configer.clone(),
            manager,
        }
    }

    /// Three queries over this run's item run-logs: everything Processing,
    /// Queueing up to the free concurrency budget, everything aggregatable.
    pub async fn scan_eval_items(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanBuckets> {
        let conf = self.configer.expt_exec_conf(event.space_id);
        let concur = expt
            .eval_conf
            .item_concur_num
            .unwrap_or(conf.item_eval.concur_num);

        let incomplete = self
            .stores
            .items
            .scan_run_logs(
                event.expt_id,
                event.run_id,
                ItemRunState::Processing,
                None,
            )
            .await?;
        let budget = concur.saturating_sub(incomplete.len());
        let to_submit = if budget == 0 {
            Vec::new()
        } else {
            self.stores
                .items
                .scan_run_logs(
                    event.expt_id,
                    event.run_id,
                    ItemRunState::Queueing,
                    Some(budget),
                )
                .await?
        };
        let complete = self
            .stores
            .items
            .logged_run_logs(event.expt_id, event.run_id)
            .await?;
        Ok(ScanBuckets {
            to_submit,
            incomplete,
            complete,
        })
    }

    /// Finalize the run and the experiment, once per run (`expt_end:*`).
    pub async fn expt_end(&self, event: &ScheduleEvent) -> Result<()> {
        let key = format!("expt_end:{}{}", event.expt_id, event.run_id);
        if self.idempotency.exist(&key).await? {
            return Ok(());
        }
        info!(expt_id = %event.expt_id, run_id = %event.run_id, "run finished, completing");

        let cid = format!("exptexec:onend:{}", event.run_id);
        self.manager
            .complete_run(event.expt_id, event.run_id, event.space_id, Some(&cid))
            .await?;
        self.manager
            .complete_expt(event.expt_id, event.space_id, CompleteOpts::with_cid(&cid))
            .await?;

        let ttl = self.configer.expt_exec_conf(event.space_id).marker_ttl();
        self.idempotency.set(&key, ttl).await
    }
}

/// `mode → driver` lookup, built once per engine.
#[derive(Clone)]
pub struct ModeFactory {
    submit: Arc<SubmitMode>,
    fail_retry: Arc<FailRetryMode>,
    append: Arc<AppendMode>,
}

impl ModeFactory {
    pub fn new(deps: &EngineDeps, manager: Arc<ExptManager>) -> Self {
        let scanner = BaseScanner::new(deps, manager.clone());
        Self {
            submit: Arc::new(SubmitMode::new(deps, scanner.clone())),
            fail_retry: Arc::new(FailRetryMode::new(deps, scanner.clone())),
            append: Arc::new(AppendMode::new(deps, scanner, manager)),
        }
    }

    pub fn driver(&self, mode: EvalMode) -> Arc<dyn ModeDriver> {
        match mode {
            EvalMode::Submit => self.submit.clone(),
            EvalMode::FailRetry => self.fail_retry.clone(),
            EvalMode::Append => self.append.clone(),
        }
    }
}
