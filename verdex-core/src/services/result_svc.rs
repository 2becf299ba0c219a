//! Default aggregation over the store layer.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use super::{ItemTurnResult, ResultService};
use crate::error::{ExptError, Result};
use crate::store::Stores;
use verdex_model::{
    ExptId, ExptStatsDelta, ItemId, ResultState, RunId, SpaceId, TurnId,
    TurnRunState,
};

/// Copies a finished item's run-log statuses onto the authoritative rows,
/// finalizes the item, and moves the stats counters in one delta.
#[derive(Clone, Debug)]
pub struct DefaultResultService {
    stores: Stores,
}

impl DefaultResultService {
    pub fn new(stores: Stores) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl ResultService for DefaultResultService {
    async fn record_item_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
        _space_id: SpaceId,
    ) -> Result<()> {
        let run_log = self
            .stores
            .items
            .get_run_log(expt_id, run_id, item_id)
            .await?
            .ok_or_else(|| {
                ExptError::Store(format!(
                    "item run-log missing for expt {expt_id} run {run_id} item {item_id}"
                ))
            })?;

        let item = self
            .stores
            .items
            .get(expt_id, item_id)
            .await?
            .ok_or_else(|| {
                ExptError::Store(format!(
                    "item result missing for expt {expt_id} item {item_id}"
                ))
            })?;
        if item.result_state == ResultState::Logged
            && item.expt_run_id == Some(run_id)
        {
            debug!(%expt_id, %run_id, %item_id, "item already aggregated");
            return Ok(());
        }

        let turn_logs = self
            .stores
            .turns
            .list_run_logs(expt_id, run_id, item_id)
            .await?;
        let mut delta = ExptStatsDelta::default();
        for log in &turn_logs {
            self.stores
                .turns
                .set_status(expt_id, item_id, log.turn_id, log.status)
                .await?;
            match log.status {
                TurnRunState::Success => {
                    delta.processing -= 1;
                    delta.success += 1;
                }
                TurnRunState::Fail => {
                    delta.processing -= 1;
                    delta.fail += 1;
                }
                TurnRunState::Terminal => {
                    delta.processing -= 1;
                    delta.terminated += 1;
                }
                // A turn the item never reached stays Processing; the next
                // FailRetry scan picks it up.
                TurnRunState::Queueing | TurnRunState::Processing => {
                    warn!(
                        %expt_id, %item_id, turn_id = %log.turn_id,
                        status = ?log.status,
                        "turn run-log not terminal at aggregation"
                    );
                }
            }
        }

        self.stores
            .items
            .finalize(
                expt_id,
                item_id,
                run_log.status,
                run_log.err_msg.clone(),
                ResultState::Logged,
            )
            .await?;
        self.stores.stats.arith_operate_count(expt_id, delta).await?;
        Ok(())
    }

    async fn get_expt_item_turn_results(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ItemTurnResult>> {
        let turns = self.stores.turns.list_by_item(expt_id, item_id).await?;
        let logs = self
            .stores
            .turns
            .latest_run_logs_by_item(expt_id, item_id)
            .await?;
        let mut by_turn: HashMap<TurnId, _> =
            logs.into_iter().map(|l| (l.turn_id, l)).collect();
        Ok(turns
            .into_iter()
            .map(|turn| {
                let latest_log = by_turn.remove(&turn.turn_id);
                ItemTurnResult { turn, latest_log }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StatsStore;
    use chrono::Utc;
    use std::sync::Arc;
    use verdex_model::{
        ExptItemResult, ExptItemResultRunLog, ExptStats, ExptTurnResult,
        ExptTurnResultRunLog, ItemRunState,
    };

    mockall::mock! {
        Stats {}

        #[async_trait]
        impl StatsStore for Stats {
            async fn create_nx(&self, stats: &ExptStats) -> Result<()>;
            async fn get(&self, expt_id: ExptId) -> Result<Option<ExptStats>>;
            async fn set_pending(&self, expt_id: ExptId, pending: i64) -> Result<()>;
            async fn arith_operate_count(
                &self,
                expt_id: ExptId,
                delta: ExptStatsDelta,
            ) -> Result<()>;
            async fn fold_into_pending(&self, expt_id: ExptId) -> Result<()>;
        }
    }

    const EXPT: ExptId = ExptId(1);
    const RUN: RunId = RunId(10);
    const ITEM: ItemId = ItemId(101);
    const SPACE: SpaceId = SpaceId(7);

    async fn seed(stores: &Stores, turn_statuses: &[TurnRunState]) {
        stores
            .stats
            .create_nx(&{
                let mut s = ExptStats::zeroed(EXPT, SPACE);
                s.processing_turn_cnt = turn_statuses.len() as i64;
                s
            })
            .await
            .unwrap();
        stores
            .items
            .batch_create_nx(&[ExptItemResult {
                id: 1,
                expt_id: EXPT,
                item_id: ITEM,
                item_idx: 0,
                status: ItemRunState::Processing,
                result_state: ResultState::Unlogged,
                err_msg: None,
                expt_run_id: Some(RUN),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();
        stores
            .items
            .batch_create_run_logs_nx(&[ExptItemResultRunLog {
                id: 2,
                expt_id: EXPT,
                run_id: RUN,
                item_id: ITEM,
                status: if turn_statuses.contains(&TurnRunState::Fail) {
                    ItemRunState::Fail
                } else {
                    ItemRunState::Success
                },
                result_state: ResultState::Logged,
                err_msg: None,
                log_id: "log".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }])
            .await
            .unwrap();

        let turns: Vec<_> = turn_statuses
            .iter()
            .enumerate()
            .map(|(i, _)| ExptTurnResult {
                id: 100 + i as i64,
                expt_id: EXPT,
                item_id: ITEM,
                turn_id: TurnId(200 + i as i64),
                turn_idx: i as i32,
                status: TurnRunState::Processing,
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect();
        stores.turns.batch_create_nx(&turns).await.unwrap();

        let logs: Vec<_> = turn_statuses
            .iter()
            .enumerate()
            .map(|(i, status)| ExptTurnResultRunLog {
                id: 300 + i as i64,
                expt_id: EXPT,
                run_id: RUN,
                item_id: ITEM,
                turn_id: TurnId(200 + i as i64),
                status: *status,
                target_result_id: None,
                evaluator_result_ids: HashMap::new(),
                err_msg: None,
                log_id: "log".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            })
            .collect();
        stores.turns.batch_create_run_logs_nx(&logs).await.unwrap();
    }

    #[tokio::test]
    async fn aggregation_moves_counters_and_finalizes_the_item() {
        let (stores, backend) = Stores::in_memory();
        seed(&stores, &[TurnRunState::Success, TurnRunState::Fail]).await;

        let svc = DefaultResultService::new(stores.clone());
        svc.record_item_run_logs(EXPT, RUN, ITEM, SPACE).await.unwrap();

        let stats = backend.stats_snapshot(EXPT).await.unwrap();
        assert_eq!(stats.processing_turn_cnt, 0);
        assert_eq!(stats.success_turn_cnt, 1);
        assert_eq!(stats.fail_turn_cnt, 1);

        let item = stores.items.get(EXPT, ITEM).await.unwrap().unwrap();
        assert_eq!(item.status, ItemRunState::Fail);
        assert_eq!(item.result_state, ResultState::Logged);

        let turns = stores.turns.list_by_item(EXPT, ITEM).await.unwrap();
        assert_eq!(turns[0].status, TurnRunState::Success);
        assert_eq!(turns[1].status, TurnRunState::Fail);
    }

    #[tokio::test]
    async fn aggregation_posts_exactly_one_stats_delta() {
        let (mut stores, _) = Stores::in_memory();
        seed(&stores, &[TurnRunState::Success, TurnRunState::Fail]).await;

        let mut stats = MockStats::new();
        stats
            .expect_arith_operate_count()
            .withf(|expt_id, delta| {
                *expt_id == EXPT
                    && delta.processing == -2
                    && delta.success == 1
                    && delta.fail == 1
                    && delta.terminated == 0
            })
            .times(1)
            .returning(|_, _| Ok(()));
        stores.stats = Arc::new(stats);

        let svc = DefaultResultService::new(stores);
        svc.record_item_run_logs(EXPT, RUN, ITEM, SPACE).await.unwrap();
    }

    #[tokio::test]
    async fn replayed_aggregation_is_a_no_op() {
        let (stores, backend) = Stores::in_memory();
        seed(&stores, &[TurnRunState::Success]).await;

        let svc = DefaultResultService::new(stores.clone());
        svc.record_item_run_logs(EXPT, RUN, ITEM, SPACE).await.unwrap();
        svc.record_item_run_logs(EXPT, RUN, ITEM, SPACE).await.unwrap();

        let stats = backend.stats_snapshot(EXPT).await.unwrap();
        assert_eq!(stats.success_turn_cnt, 1);
        assert_eq!(stats.processing_turn_cnt, 0);
    }

    #[tokio::test]
    async fn turn_results_join_their_latest_log() {
        let (stores, _) = Stores::in_memory();
        seed(&stores, &[TurnRunState::Success, TurnRunState::Fail]).await;

        let svc = DefaultResultService::new(stores);
        let results = svc.get_expt_item_turn_results(EXPT, ITEM).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.latest_log.is_some()));
    }
}
