//! Append mode: a long-lived run that keeps accepting new items until its
//! alive window closes.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use super::{BaseScanner, EngineDeps, ModeDriver, ScanBuckets};
use crate::error::Result;
use crate::exec::ExptManager;
use crate::infra::{Configer, ExptPublisher};
use crate::store::Stores;
use verdex_model::{
    EvalMode, Experiment, ExptStatus, RunStatus, ScheduleEvent,
};

pub struct AppendMode {
    stores: Stores,
    configer: Arc<dyn Configer>,
    publisher: Arc<dyn ExptPublisher>,
    scanner: BaseScanner,
    manager: Arc<ExptManager>,
}

impl AppendMode {
    pub fn new(
        deps: &EngineDeps,
        scanner: BaseScanner,
        manager: Arc<ExptManager>,
    ) -> Self {
        Self {
            stores: deps.stores.clone(),
            configer: deps.configer.clone(),
            publisher: deps.publisher.clone(),
            scanner,
            manager,
        }
    }
}

#[async_trait]
impl ModeDriver for AppendMode {
    fn mode(&self) -> EvalMode {
        EvalMode::Append
    }

    async fn expt_start(
        &self,
        _event: &ScheduleEvent,
        _expt: &mut Experiment,
    ) -> Result<()> {
        Ok(())
    }

    async fn schedule_start(
        &self,
        event: &ScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<()> {
        let now = Utc::now();
        if matches!(expt.status, ExptStatus::Processing | ExptStatus::Pending)
            && expt.alive_time_exceeded(now)
        {
            info!(expt_id = %event.expt_id, "alive window elapsed, draining");
            self.stores
                .experiments
                .update_status(event.space_id, event.expt_id, ExptStatus::Draining, None)
                .await?;
            expt.status = ExptStatus::Draining;
        } else if expt.status == ExptStatus::Pending {
            self.stores
                .experiments
                .update_status(event.space_id, event.expt_id, ExptStatus::Processing, None)
                .await?;
            expt.status = ExptStatus::Processing;
        }

        // A pended run waking up to this cycle is running again.
        if let Some(run) = self
            .stores
            .runs
            .get(event.expt_id, event.run_id)
            .await?
            .filter(|r| r.status == RunStatus::Pended)
        {
            self.stores
                .runs
                .update_status(event.expt_id, run.id, RunStatus::Running)
                .await?;
        }
        Ok(())
    }

    async fn scan_eval_items(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
    ) -> Result<ScanBuckets> {
        self.scanner.scan_eval_items(event, expt).await
    }

    async fn schedule_end(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<()> {
        let idle = to_submit == 0 && incomplete == 0;
        if idle
            && matches!(expt.status, ExptStatus::Processing | ExptStatus::Pending)
        {
            info!(expt_id = %event.expt_id, "append run idle, pending");
            self.manager.pend_run(event.expt_id, event.run_id).await?;
            self.manager.pend_expt(event.space_id, event.expt_id).await?;
            let conf = self.configer.expt_exec_conf(event.space_id);
            tokio::time::sleep(conf.pacing.append_empty_backoff()).await;
        }
        Ok(())
    }

    async fn expt_end(
        &self,
        event: &ScheduleEvent,
        expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<bool> {
        if to_submit == 0 && incomplete == 0 && expt.status == ExptStatus::Draining
        {
            self.scanner.expt_end(event).await?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn next_tick(
        &self,
        event: &ScheduleEvent,
        next_tick: bool,
    ) -> Result<()> {
        if !next_tick {
            return Ok(());
        }
        let conf = self.configer.expt_exec_conf(event.space_id);
        tokio::time::sleep(conf.pacing.tick_pause()).await;
        // The refresh keeps a healthy long-lived run from tripping zombie
        // detection; only Append re-stamps.
        let refreshed = event.clone().refreshed(Utc::now());
        self.publisher
            .publish_schedule(refreshed, Some(conf.daemon_interval()))
            .await
    }
}
