//! Persistence traits for the logical tables, plus the backends.
//!
//! Every multi-row insert is create-if-absent (`*_create_nx`), which is
//! what makes at-least-once delivery safe to replay. Stats counters are
//! mutated only through [`StatsStore::arith_operate_count`]; nothing reads,
//! modifies and writes a counter.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use verdex_model::{
    Experiment, ExptItemResult, ExptItemResultRunLog, ExptRun, ExptStats,
    ExptStatsDelta, ExptStatus, ExptTurnResult, ExptTurnResultRunLog, ExptId,
    ItemId, ItemRunState, ResultState, RunId, RunStatus, SpaceId, TurnId,
    TurnRunState,
};

pub mod memory;

#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryStores;

#[cfg(feature = "database")]
pub use postgres::PostgresStores;

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Create or replace; used by experiment CRUD, which is otherwise out
    /// of scope.
    async fn upsert(&self, expt: &Experiment) -> Result<()>;
    async fn get(&self, space_id: SpaceId, expt_id: ExptId) -> Result<Experiment>;
    async fn update_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        status: ExptStatus,
        message: Option<String>,
    ) -> Result<()>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Returns false when the run row already existed.
    async fn create_nx(&self, run: &ExptRun) -> Result<bool>;
    async fn get(&self, expt_id: ExptId, run_id: RunId) -> Result<Option<ExptRun>>;
    async fn update_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: RunStatus,
    ) -> Result<()>;
}

#[async_trait]
pub trait ItemResultStore: Send + Sync {
    async fn batch_create_nx(&self, rows: &[ExptItemResult]) -> Result<()>;
    async fn get(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResult>>;
    async fn list(&self, expt_id: ExptId) -> Result<Vec<ExptItemResult>>;
    /// Move a batch of items to `status`, optionally rebinding the owning
    /// run.
    async fn update_status(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: ItemRunState,
        run_id: Option<RunId>,
    ) -> Result<()>;
    /// Aggregation write: final status plus `result_state = Logged`.
    async fn finalize(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        status: ItemRunState,
        err_msg: Option<String>,
        result_state: ResultState,
    ) -> Result<()>;

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptItemResultRunLog],
    ) -> Result<()>;
    async fn get_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResultRunLog>>;
    /// Run-log rows in `status`, oldest first. `limit = None` means all.
    async fn scan_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: ItemRunState,
        limit: Option<usize>,
    ) -> Result<Vec<ExptItemResultRunLog>>;
    /// Run-log rows whose final state has been recorded for this run.
    async fn logged_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
    ) -> Result<Vec<ExptItemResultRunLog>>;
    async fn update_run_log_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_ids: &[ItemId],
        status: ItemRunState,
    ) -> Result<()>;
    /// Item-loop completion write: terminal status, error, `Logged`.
    async fn finish_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
        status: ItemRunState,
        err_msg: Option<String>,
        result_state: ResultState,
    ) -> Result<()>;
}

#[async_trait]
pub trait TurnResultStore: Send + Sync {
    async fn batch_create_nx(&self, rows: &[ExptTurnResult]) -> Result<()>;
    async fn list_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResult>>;
    async fn count_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> Result<i64>;
    async fn update_status_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: TurnRunState,
    ) -> Result<()>;
    async fn update_status_by_ids(
        &self,
        expt_id: ExptId,
        turn_ids: &[TurnId],
        status: TurnRunState,
    ) -> Result<()>;
    async fn set_status(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        status: TurnRunState,
    ) -> Result<()>;
    /// Cursor scan over authoritative turn rows in any of `statuses`,
    /// ordered by row id. Returns the batch and the cursor for the next
    /// call (`None` when exhausted).
    async fn scan_by_status(
        &self,
        expt_id: ExptId,
        statuses: &[TurnRunState],
        cursor: i64,
        limit: usize,
    ) -> Result<(Vec<ExptTurnResult>, Option<i64>)>;

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptTurnResultRunLog],
    ) -> Result<()>;
    async fn list_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>>;
    /// Latest run-log per turn across all runs of the experiment, for
    /// FailRetry to carry cached record ids forward.
    async fn latest_run_logs_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>>;
    async fn save_run_log(&self, log: &ExptTurnResultRunLog) -> Result<()>;
}

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn create_nx(&self, stats: &ExptStats) -> Result<()>;
    async fn get(&self, expt_id: ExptId) -> Result<Option<ExptStats>>;
    /// Submit-start absolute write of the pending counter.
    async fn set_pending(&self, expt_id: ExptId, pending: i64) -> Result<()>;
    /// Single atomic arithmetic step; each field of the delta is added to
    /// its counter.
    async fn arith_operate_count(
        &self,
        expt_id: ExptId,
        delta: ExptStatsDelta,
    ) -> Result<()>;
    /// FailRetry-start recompute: pending absorbs fail + terminated +
    /// processing, which are zeroed, in one atomic step.
    async fn fold_into_pending(&self, expt_id: ExptId) -> Result<()>;
}

/// The five store handles the engine threads around.
#[derive(Clone)]
pub struct Stores {
    pub experiments: Arc<dyn ExperimentStore>,
    pub runs: Arc<dyn RunStore>,
    pub items: Arc<dyn ItemResultStore>,
    pub turns: Arc<dyn TurnResultStore>,
    pub stats: Arc<dyn StatsStore>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish()
    }
}

impl Stores {
    /// All five handles served by one in-memory backend.
    pub fn in_memory() -> (Self, Arc<MemoryStores>) {
        let backend = Arc::new(MemoryStores::new());
        let stores = Self {
            experiments: backend.clone(),
            runs: backend.clone(),
            items: backend.clone(),
            turns: backend.clone(),
            stats: backend.clone(),
        };
        (stores, backend)
    }

    #[cfg(feature = "database")]
    pub fn postgres(backend: Arc<PostgresStores>) -> Self {
        Self {
            experiments: backend.clone(),
            runs: backend.clone(),
            items: backend.clone(),
            turns: backend.clone(),
            stats: backend,
        }
    }
}
