//! Submit mode: the first-time run that seeds every row.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use super::{BaseScanner, EngineDeps, ModeDriver, ScanBuckets};
use crate::error::Result;
use crate::exec::correlation;
use crate::infra::{Configer, ExptPublisher, IdGenerator, IdempotencyService};
use crate::store::Stores;
use verdex_model::{
    EvalMode, Experiment, ExptItemResult, ExptItemResultRunLog, ExptStats,
    ExptStatus, ExptTurnResult, ItemRunState, ResultState, ScheduleEvent,
    TurnRunState,
};

const PAGE_SIZE: usize = 100;
const MAX_PAGES: usize = 10_000;

pub struct SubmitMode {
    stores: Stores,
    idgen: Arc<dyn IdGenerator>,
    idempotency: Arc<dyn IdempotencyService>,
    configer: Arc<dyn Configer>,
    publisher: Arc<dyn ExptPublisher>,
    eval_sets: Arc<dyn crate::services::EvaluationSetItemService>,
    scanner: BaseScanner,
}

impl SubmitMode {
    pub fn new(deps: &EngineDeps, scanner: BaseScanner) -> Self {
        Self {
            stores: deps.stores.clone(),
            idgen: deps.idgen.clone(),
            idempotency: deps.idempotency.clone(),
            configer: deps.configer.clone(),
            publisher: deps.publisher.clone(),
            eval_sets: deps.eval_sets.clone(),
            scanner,
        }
    }
}

#[async_trait]
impl ModeDriver for SubmitMode {
    fn mode(&self) -> EvalMode {
        EvalMode::Submit
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
        info!(expt_id = %event.expt_id, run_id = %event.run_id, "seeding submit run");

        let now = Utc::now();
        let log_id = correlation::item_log_id(
            expt.source_id,
            event.expt_id,
            event.run_id,
            event.space_id,
        );
        let mut total_items: usize = 0;
        for page in 1..=MAX_PAGES {
            let page_res = self
                .eval_sets
                .list_items(event.space_id, expt.eval_set, page, PAGE_SIZE)
                .await?;
            if page_res.items.is_empty() {
                break;
            }

            let n_items = page_res.items.len();
            let n_turns: usize =
                page_res.items.iter().map(|i| i.turn_count()).sum();
            let mut ids = self
                .idgen
                .gen_multi_ids(n_items + n_turns)
                .await?
                .into_iter();

            let mut item_rows = Vec::with_capacity(n_items);
            let mut turn_rows = Vec::with_capacity(n_turns);
            for item in &page_res.items {
                item_rows.push(ExptItemResult {
                    id: ids.next().unwrap_or_default(),
                    expt_id: event.expt_id,
                    item_id: item.id,
                    item_idx: item.item_idx,
                    status: ItemRunState::Queueing,
                    result_state: ResultState::Unlogged,
                    err_msg: None,
                    expt_run_id: Some(event.run_id),
                    created_at: now,
                    updated_at: now,
                });
                for (turn_idx, turn) in item.turns.iter().enumerate() {
                    turn_rows.push(ExptTurnResult {
                        id: ids.next().unwrap_or_default(),
                        expt_id: event.expt_id,
                        item_id: item.id,
                        turn_id: turn.id,
                        turn_idx: turn_idx as i32,
                        status: TurnRunState::Queueing,
                        created_at: now,
                        updated_at: now,
                    });
                }
            }
            self.stores.items.batch_create_nx(&item_rows).await?;
            self.stores.turns.batch_create_nx(&turn_rows).await?;

            let log_ids = self.idgen.gen_multi_ids(n_items).await?;
            let run_logs: Vec<ExptItemResultRunLog> = page_res
                .items
                .iter()
                .zip(log_ids)
                .map(|(item, id)| ExptItemResultRunLog {
                    id,
                    expt_id: event.expt_id,
                    run_id: event.run_id,
                    item_id: item.id,
                    status: ItemRunState::Queueing,
                    result_state: ResultState::Unlogged,
                    err_msg: None,
                    log_id: log_id.clone(),
                    created_at: now,
                    updated_at: now,
                })
                .collect();
            self.stores.items.batch_create_run_logs_nx(&run_logs).await?;

            total_items += n_items;
            if total_items as i64 >= page_res.total {
                break;
            }
            if page == MAX_PAGES {
                warn!(expt_id = %event.expt_id, "evaluation set truncated at page cap");
            }
            tokio::time::sleep(conf.pacing.page_delay()).await;
        }

        self.stores
            .stats
            .create_nx(&ExptStats::zeroed(event.expt_id, event.space_id))
            .await?;
        // Item-count cardinality, kept as the documented accounting quirk.
        self.stores
            .stats
            .set_pending(event.expt_id, total_items as i64)
            .await?;
        self.stores
            .experiments
            .update_status(event.space_id, event.expt_id, ExptStatus::Processing, None)
            .await?;
        expt.status = ExptStatus::Processing;

        self.idempotency.set(&key, conf.marker_ttl()).await?;
        info!(expt_id = %event.expt_id, total_items, "submit run seeded");
        // Let the seed writes propagate to read replicas before scanning.
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
