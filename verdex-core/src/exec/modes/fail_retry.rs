//! FailRetry mode: a new run over the turns an earlier run left behind.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

use super::{BaseScanner, EngineDeps, ModeDriver, ScanBuckets};
use crate::error::Result;
use crate::exec::correlation;
use crate::infra::{Configer, ExptPublisher, IdGenerator, IdempotencyService};
use crate::store::Stores;
use verdex_model::{
    EvalMode, Experiment, ExptItemResultRunLog, ExptStatus, ItemId,
    ItemRunState, ResultState, ScheduleEvent, TurnRunState,
};

const SCAN_BATCH: usize = 50;

/// Turn statuses a retry run picks up: failed, terminated, never started,
/// and stuck mid-flight.
const RESCAN_STATUSES: [TurnRunState; 4] = [
    TurnRunState::Terminal,
    TurnRunState::Queueing,
    TurnRunState::Fail,
    TurnRunState::Processing,
];

pub struct FailRetryMode {
    stores: Stores,
    idgen: Arc<dyn IdGenerator>,
    idempotency: Arc<dyn IdempotencyService>,
    configer: Arc<dyn Configer>,
    publisher: Arc<dyn ExptPublisher>,
    scanner: BaseScanner,
}

impl FailRetryMode {
    pub fn new(deps: &EngineDeps, scanner: BaseScanner) -> Self {
        Self {
            stores: deps.stores.clone(),
            idgen: deps.idgen.clone(),
            idempotency: deps.idempotency.clone(),
            configer: deps.configer.clone(),
            publisher: deps.publisher.clone(),
            scanner,
        }
    }
}

#[async_trait]
impl ModeDriver for FailRetryMode {
    fn mode(&self) -> EvalMode {
        EvalMode::FailRetry
    }

    async fn expt_start(
        &self,
        event: &ScheduleEvent,
        expt: &mut Experiment,
    ) -> Result<()> {
        let key = format!("expt_start:{}{}", event.expt_id, event.run_id);
        if self.idempotency.exist(&key).await? {
            return Ok(());
        }
        let conf = self.configer.expt_exec_conf(event.space_id);
        info!(expt_id = %event.expt_id, run_id = %event.run_id, "seeding retry run");

        let now = Utc::now();
        let log_id = correlation::item_log_id(
            expt.source_id,
            event.expt_id,
            event.run_id,
            event.space_id,
        );
        let mut cursor = 0i64;
        loop {
            let (batch, next) = self
                .stores
                .turns
                .scan_by_status(event.expt_id, &RESCAN_STATUSES, cursor, SCAN_BATCH)
                .await?;
            if batch.is_empty() {
                break;
            }

            let item_ids: Vec<ItemId> = batch
                .iter()
                .map(|t| t.item_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let log_ids = self.idgen.gen_multi_ids(item_ids.len()).await?;
            let run_logs: Vec<ExptItemResultRunLog> = item_ids
                .iter()
                .zip(log_ids)
                .map(|(item_id, id)| ExptItemResultRunLog {
                    id,
                    expt_id: event.expt_id,
                    run_id: event.run_id,
                    item_id: *item_id,
                    status: ItemRunState::Queueing,
                    result_state: ResultState::Unlogged,
                    err_msg: None,
                    log_id: log_id.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .collect();
            self.stores.items.batch_create_run_logs_nx(&run_logs).await?;
            self.stores
                .items
                .update_status(
                    event.expt_id,
                    &item_ids,
                    ItemRunState::Queueing,
                    Some(event.run_id),
                )
                .await?;
            let turn_ids: Vec<_> = batch.iter().map(|t| t.turn_id).collect();
            self.stores
                .turns
                .update_status_by_ids(event.expt_id, &turn_ids, TurnRunState::Queueing)
                .await?;

            match next {
                Some(next) => cursor = next,
                None => break,
            }
            tokio::time::sleep(conf.pacing.page_delay()).await;
        }

        // Re-arm the counters: everything failed / terminated / stuck goes
        // back into pending in one atomic step.
        self.stores.stats.fold_into_pending(event.expt_id).await?;
        self.stores
            .experiments
            .update_status(event.space_id, event.expt_id, ExptStatus::Processing, None)
            .await?;
        expt.status = ExptStatus::Processing;

        self.idempotency.set(&key, conf.marker_ttl()).await?;
        tokio::time::sleep(conf.pacing.start_settle()).await;
        Ok(())
    }

    async fn schedule_start(
        &self,
        _event: &ScheduleEvent,
        _expt: &mut Experiment,
    ) -> Result<()> {
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
        _event: &ScheduleEvent,
        _expt: &Experiment,
        _to_submit: usize,
        _incomplete: usize,
    ) -> Result<()> {
        Ok(())
    }

    async fn expt_end(
        &self,
        event: &ScheduleEvent,
        _expt: &Experiment,
        to_submit: usize,
        incomplete: usize,
    ) -> Result<bool> {
        if to_submit == 0 && incomplete == 0 {
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
        self.publisher
            .publish_schedule(event.clone(), Some(conf.daemon_interval()))
            .await
    }
}
