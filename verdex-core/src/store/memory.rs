//! In-memory backend serving all five store traits.
//!
//! Single-process deployments and the engine tests run on this backend; it
//! honors the same create-if-absent and atomic-arithmetic contracts as the
//! Postgres backend.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

use super::{
    ExperimentStore, ItemResultStore, RunStore, StatsStore, TurnResultStore,
};
use crate::error::{ExptError, Result};
use verdex_model::{
    Experiment, ExptId, ExptItemResult, ExptItemResultRunLog, ExptRun,
    ExptStats, ExptStatsDelta, ExptStatus, ExptTurnResult,
    ExptTurnResultRunLog, ItemId, ItemRunState, ResultState, RunId, RunStatus,
    SpaceId, TurnId, TurnRunState,
};

#[derive(Default)]
struct State {
    experiments: HashMap<ExptId, Experiment>,
    runs: HashMap<(ExptId, RunId), ExptRun>,
    items: HashMap<(ExptId, ItemId), ExptItemResult>,
    item_logs: HashMap<(ExptId, RunId, ItemId), ExptItemResultRunLog>,
    /// Keyed by row id so cursor scans see a stable order.
    turns: BTreeMap<i64, ExptTurnResult>,
    turn_logs: HashMap<(ExptId, RunId, ItemId, TurnId), ExptTurnResultRunLog>,
    stats: HashMap<ExptId, ExptStats>,
}

#[derive(Default)]
pub struct MemoryStores {
    state: Mutex<State>,
}

impl std::fmt::Debug for MemoryStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStores").finish()
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stats row, for assertions.
    pub async fn stats_snapshot(&self, expt_id: ExptId) -> Option<ExptStats> {
        self.state.lock().await.stats.get(&expt_id).cloned()
    }
}

fn not_found(what: &str, id: impl std::fmt::Display) -> ExptError {
    ExptError::Store(format!("{what} {id} not found"))
}

#[async_trait]
impl ExperimentStore for MemoryStores {
    async fn upsert(&self, expt: &Experiment) -> Result<()> {
        self.state
            .lock()
            .await
            .experiments
            .insert(expt.id, expt.clone());
        Ok(())
    }

    async fn get(&self, space_id: SpaceId, expt_id: ExptId) -> Result<Experiment> {
        let state = self.state.lock().await;
        state
            .experiments
            .get(&expt_id)
            .filter(|e| e.space_id == space_id)
            .cloned()
            .ok_or_else(|| not_found("experiment", expt_id))
    }

    async fn update_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        status: ExptStatus,
        message: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let expt = state
            .experiments
            .get_mut(&expt_id)
            .filter(|e| e.space_id == space_id)
            .ok_or_else(|| not_found("experiment", expt_id))?;
        expt.status = status;
        if let Some(message) = message {
            expt.status_message = message;
        }
        expt.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStores {
    async fn create_nx(&self, run: &ExptRun) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (run.expt_id, run.id);
        if state.runs.contains_key(&key) {
            return Ok(false);
        }
        state.runs.insert(key, run.clone());
        Ok(true)
    }

    async fn get(&self, expt_id: ExptId, run_id: RunId) -> Result<Option<ExptRun>> {
        Ok(self.state.lock().await.runs.get(&(expt_id, run_id)).cloned())
    }

    async fn update_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: RunStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&(expt_id, run_id))
            .ok_or_else(|| not_found("run", run_id))?;
        run.status = status;
        run.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ItemResultStore for MemoryStores {
    async fn batch_create_nx(&self, rows: &[ExptItemResult]) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .items
                .entry((row.expt_id, row.item_id))
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn get(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResult>> {
        Ok(self
            .state
            .lock()
            .await
            .items
            .get(&(expt_id, item_id))
            .cloned())
    }

    async fn list(&self, expt_id: ExptId) -> Result<Vec<ExptItemResult>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .items
            .values()
            .filter(|r| r.expt_id == expt_id)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn update_status(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: ItemRunState,
        run_id: Option<RunId>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for item_id in item_ids {
            if let Some(row) = state.items.get_mut(&(expt_id, *item_id)) {
                row.status = status;
                if run_id.is_some() {
                    row.expt_run_id = run_id;
                }
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        status: ItemRunState,
        err_msg: Option<String>,
        result_state: ResultState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .items
            .get_mut(&(expt_id, item_id))
            .ok_or_else(|| not_found("item result", item_id))?;
        row.status = status;
        row.err_msg = err_msg;
        row.result_state = result_state;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptItemResultRunLog],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .item_logs
                .entry((row.expt_id, row.run_id, row.item_id))
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn get_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResultRunLog>> {
        Ok(self
            .state
            .lock()
            .await
            .item_logs
            .get(&(expt_id, run_id, item_id))
            .cloned())
    }

    async fn scan_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: ItemRunState,
        limit: Option<usize>,
    ) -> Result<Vec<ExptItemResultRunLog>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .item_logs
            .values()
            .filter(|r| {
                r.expt_id == expt_id && r.run_id == run_id && r.status == status
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn logged_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
    ) -> Result<Vec<ExptItemResultRunLog>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .item_logs
            .values()
            .filter(|r| {
                r.expt_id == expt_id
                    && r.run_id == run_id
                    && r.result_state == ResultState::Logged
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn update_run_log_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_ids: &[ItemId],
        status: ItemRunState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for item_id in item_ids {
            if let Some(row) = state.item_logs.get_mut(&(expt_id, run_id, *item_id))
            {
                row.status = status;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn finish_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
        status: ItemRunState,
        err_msg: Option<String>,
        result_state: ResultState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .item_logs
            .get_mut(&(expt_id, run_id, item_id))
            .ok_or_else(|| not_found("item run-log", item_id))?;
        row.status = status;
        row.err_msg = err_msg;
        row.result_state = result_state;
        row.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TurnResultStore for MemoryStores {
    async fn batch_create_nx(&self, rows: &[ExptTurnResult]) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            let exists = state.turns.values().any(|r| {
                r.expt_id == row.expt_id
                    && r.item_id == row.item_id
                    && r.turn_id == row.turn_id
            });
            if !exists {
                state.turns.insert(row.id, row.clone());
            }
        }
        Ok(())
    }

    async fn list_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResult>> {
        let state = self.state.lock().await;
        Ok(state
            .turns
            .values()
            .filter(|r| r.expt_id == expt_id && r.item_id == item_id)
            .cloned()
            .collect())
    }

    async fn count_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> Result<i64> {
        let state = self.state.lock().await;
        Ok(state
            .turns
            .values()
            .filter(|r| r.expt_id == expt_id && item_ids.contains(&r.item_id))
            .count() as i64)
    }

    async fn update_status_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: TurnRunState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in state.turns.values_mut() {
            if row.expt_id == expt_id && item_ids.contains(&row.item_id) {
                row.status = status;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn update_status_by_ids(
        &self,
        expt_id: ExptId,
        turn_ids: &[TurnId],
        status: TurnRunState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in state.turns.values_mut() {
            if row.expt_id == expt_id && turn_ids.contains(&row.turn_id) {
                row.status = status;
                row.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn set_status(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        status: TurnRunState,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let row = state
            .turns
            .values_mut()
            .find(|r| {
                r.expt_id == expt_id && r.item_id == item_id && r.turn_id == turn_id
            })
            .ok_or_else(|| not_found("turn result", turn_id))?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn scan_by_status(
        &self,
        expt_id: ExptId,
        statuses: &[TurnRunState],
        cursor: i64,
        limit: usize,
    ) -> Result<(Vec<ExptTurnResult>, Option<i64>)> {
        let state = self.state.lock().await;
        let batch: Vec<_> = state
            .turns
            .range((cursor + 1)..)
            .map(|(_, r)| r)
            .filter(|r| r.expt_id == expt_id && statuses.contains(&r.status))
            .take(limit)
            .cloned()
            .collect();
        let next = (batch.len() == limit)
            .then(|| batch.last().map(|r| r.id))
            .flatten();
        Ok((batch, next))
    }

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptTurnResultRunLog],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        for row in rows {
            state
                .turn_logs
                .entry((row.expt_id, row.run_id, row.item_id, row.turn_id))
                .or_insert_with(|| row.clone());
        }
        Ok(())
    }

    async fn list_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>> {
        let state = self.state.lock().await;
        let mut rows: Vec<_> = state
            .turn_logs
            .values()
            .filter(|r| {
                r.expt_id == expt_id && r.run_id == run_id && r.item_id == item_id
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn latest_run_logs_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>> {
        let state = self.state.lock().await;
        let mut latest: HashMap<TurnId, &ExptTurnResultRunLog> = HashMap::new();
        for row in state.turn_logs.values() {
            if row.expt_id != expt_id || row.item_id != item_id {
                continue;
            }
            match latest.get(&row.turn_id) {
                Some(seen) if (seen.created_at, seen.id) >= (row.created_at, row.id) => {}
                _ => {
                    latest.insert(row.turn_id, row);
                }
            }
        }
        let mut rows: Vec<_> = latest.into_values().cloned().collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn save_run_log(&self, log: &ExptTurnResultRunLog) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut log = log.clone();
        log.updated_at = Utc::now();
        state
            .turn_logs
            .insert((log.expt_id, log.run_id, log.item_id, log.turn_id), log);
        Ok(())
    }
}

#[async_trait]
impl StatsStore for MemoryStores {
    async fn create_nx(&self, stats: &ExptStats) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .stats
            .entry(stats.expt_id)
            .or_insert_with(|| stats.clone());
        Ok(())
    }

    async fn get(&self, expt_id: ExptId) -> Result<Option<ExptStats>> {
        Ok(self.state.lock().await.stats.get(&expt_id).cloned())
    }

    async fn set_pending(&self, expt_id: ExptId, pending: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let stats = state
            .stats
            .get_mut(&expt_id)
            .ok_or_else(|| not_found("stats", expt_id))?;
        stats.pending_turn_cnt = pending;
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn arith_operate_count(
        &self,
        expt_id: ExptId,
        delta: ExptStatsDelta,
    ) -> Result<()> {
        if delta.is_zero() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let stats = state
            .stats
            .get_mut(&expt_id)
            .ok_or_else(|| not_found("stats", expt_id))?;
        delta.apply_to(stats);
        stats.updated_at = Utc::now();
        Ok(())
    }

    async fn fold_into_pending(&self, expt_id: ExptId) -> Result<()> {
        let mut state = self.state.lock().await;
        let stats = state
            .stats
            .get_mut(&expt_id)
            .ok_or_else(|| not_found("stats", expt_id))?;
        stats.pending_turn_cnt += stats.fail_turn_cnt
            + stats.terminated_turn_cnt
            + stats.processing_turn_cnt;
        stats.fail_turn_cnt = 0;
        stats.terminated_turn_cnt = 0;
        stats.processing_turn_cnt = 0;
        stats.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verdex_model::SpaceId;

    fn item_row(expt: i64, item: i64, id: i64) -> ExptItemResult {
        ExptItemResult {
            id,
            expt_id: ExptId(expt),
            item_id: ItemId(item),
            item_idx: 0,
            status: ItemRunState::Queueing,
            result_state: ResultState::Unlogged,
            err_msg: None,
            expt_run_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn turn_row(expt: i64, item: i64, turn: i64, id: i64) -> ExptTurnResult {
        ExptTurnResult {
            id,
            expt_id: ExptId(expt),
            item_id: ItemId(item),
            turn_id: TurnId(turn),
            turn_idx: 0,
            status: TurnRunState::Queueing,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_create_nx_keeps_the_first_row() {
        let store = MemoryStores::new();
        ItemResultStore::batch_create_nx(&store, &[item_row(1, 101, 1)])
            .await
            .unwrap();
        let mut replay = item_row(1, 101, 2);
        replay.status = ItemRunState::Fail;
        ItemResultStore::batch_create_nx(&store, &[replay])
            .await
            .unwrap();

        let row = ItemResultStore::get(&store, ExptId(1), ItemId(101))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.status, ItemRunState::Queueing);
    }

    #[tokio::test]
    async fn scan_by_status_pages_with_a_cursor() {
        let store = MemoryStores::new();
        let rows: Vec<_> = (0..5)
            .map(|i| {
                let mut row = turn_row(1, 100 + i, 200 + i, 10 + i);
                row.status = TurnRunState::Fail;
                row
            })
            .collect();
        TurnResultStore::batch_create_nx(&store, &rows).await.unwrap();

        let (page, next) = store
            .scan_by_status(ExptId(1), &[TurnRunState::Fail], 0, 2)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        let cursor = next.unwrap();

        let (page, next) = store
            .scan_by_status(ExptId(1), &[TurnRunState::Fail], cursor, 10)
            .await
            .unwrap();
        assert_eq!(page.len(), 3);
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn fold_into_pending_zeroes_the_folded_counters() {
        let store = MemoryStores::new();
        let mut stats = ExptStats::zeroed(ExptId(1), SpaceId(7));
        stats.pending_turn_cnt = 2;
        stats.fail_turn_cnt = 3;
        stats.terminated_turn_cnt = 1;
        stats.processing_turn_cnt = 4;
        stats.success_turn_cnt = 6;
        StatsStore::create_nx(&store, &stats).await.unwrap();

        store.fold_into_pending(ExptId(1)).await.unwrap();
        let stats = store.stats_snapshot(ExptId(1)).await.unwrap();
        assert_eq!(stats.pending_turn_cnt, 10);
        assert_eq!(stats.fail_turn_cnt, 0);
        assert_eq!(stats.terminated_turn_cnt, 0);
        assert_eq!(stats.processing_turn_cnt, 0);
        assert_eq!(stats.success_turn_cnt, 6);
    }

    #[tokio::test]
    async fn latest_run_log_wins_per_turn() {
        let store = MemoryStores::new();
        let older = ExptTurnResultRunLog {
            id: 1,
            expt_id: ExptId(1),
            run_id: RunId(10),
            item_id: ItemId(101),
            turn_id: TurnId(201),
            status: TurnRunState::Fail,
            target_result_id: Some(7),
            evaluator_result_ids: HashMap::new(),
            err_msg: None,
            log_id: "a".into(),
            created_at: Utc::now() - chrono::Duration::seconds(60),
            updated_at: Utc::now(),
        };
        let mut newer = older.clone();
        newer.id = 2;
        newer.run_id = RunId(11);
        newer.status = TurnRunState::Success;
        newer.created_at = Utc::now();
        TurnResultStore::batch_create_run_logs_nx(&store, &[older, newer])
            .await
            .unwrap();

        let latest = store
            .latest_run_logs_by_item(ExptId(1), ItemId(101))
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].run_id, RunId(11));
        assert_eq!(latest[0].status, TurnRunState::Success);
    }
}
