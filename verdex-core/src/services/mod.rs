//! Traits for the external collaborators the engine drives.
//!
//! Targets, evaluators, the evaluation-set source and the benefit service
//! are remote systems in production; the engine only ever sees these
//! traits. `verdex-server` wires in-process implementations for local runs
//! and tests.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use verdex_model::{
    EvalSetRef, EvaluationSetItem, EvaluatorRecord, EvaluatorVersionId, ExptId,
    ExptTurnResult, ExptTurnResultRunLog, ItemId, Message, Session, SpaceId,
    TargetRecord, TargetRef, TurnId,
};

mod result_svc;

pub use result_svc::DefaultResultService;

/// One target invocation: mapped input fields plus prior conversation.
#[derive(Debug, Clone)]
pub struct ExecuteTargetRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub target: TargetRef,
    pub fields: HashMap<String, String>,
    pub history: Vec<Message>,
    pub session: Session,
    pub ext: HashMap<String, String>,
}

#[async_trait]
pub trait TargetService: Send + Sync {
    async fn execute_target(
        &self,
        req: ExecuteTargetRequest,
    ) -> Result<TargetRecord>;

    /// Reload a persisted record by id, for runs that reuse a prior turn's
    /// target output instead of re-invoking.
    async fn get_record_by_id(
        &self,
        space_id: SpaceId,
        record_id: i64,
    ) -> Result<Option<TargetRecord>>;
}

/// One evaluator invocation against one turn.
#[derive(Debug, Clone)]
pub struct RunEvaluatorRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub evaluator_version_id: EvaluatorVersionId,
    pub fields: HashMap<String, String>,
    /// Persisted target record feeding this score, when one exists.
    pub target_record_id: Option<i64>,
    pub session: Session,
    pub ext: HashMap<String, String>,
}

#[async_trait]
pub trait EvaluatorService: Send + Sync {
    async fn run_evaluator(
        &self,
        req: RunEvaluatorRequest,
    ) -> Result<EvaluatorRecord>;
}

#[async_trait]
pub trait EvaluatorRecordService: Send + Sync {
    /// Reload persisted records by id, for runs that reuse a prior turn's
    /// scores instead of re-invoking. Unknown ids are omitted.
    async fn batch_get_evaluator_records(
        &self,
        space_id: SpaceId,
        record_ids: &[i64],
    ) -> Result<Vec<EvaluatorRecord>>;
}

/// One page of evaluation-set items, with the version total.
#[derive(Debug, Clone)]
pub struct ItemPage {
    pub items: Vec<EvaluationSetItem>,
    pub total: i64,
}

#[async_trait]
pub trait EvaluationSetItemService: Send + Sync {
    /// Page through the pinned set version. `page` starts at 1.
    async fn list_items(
        &self,
        space_id: SpaceId,
        eval_set: EvalSetRef,
        page: usize,
        page_size: usize,
    ) -> Result<ItemPage>;

    async fn batch_get_items(
        &self,
        space_id: SpaceId,
        eval_set: EvalSetRef,
        item_ids: &[ItemId],
    ) -> Result<Vec<EvaluationSetItem>>;
}

/// Why the benefit service refused a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenefitDenyReason {
    /// The account owes usage; the experiment must terminate.
    InDebt,
    Denied(String),
}

#[derive(Debug, Clone)]
pub struct CheckBenefitRequest {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    /// Free-tier experiments check quota but deduct nothing.
    pub free_cost: bool,
    pub session: Session,
    pub ext: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct BenefitCheck {
    pub deny_reason: Option<BenefitDenyReason>,
}

impl BenefitCheck {
    pub fn allowed() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait BenefitService: Send + Sync {
    async fn check_and_deduct_eval_benefit(
        &self,
        req: CheckBenefitRequest,
    ) -> Result<BenefitCheck>;
}

/// Authoritative turn row joined with its most recent run-log, for runs
/// that resume over earlier results.
#[derive(Debug, Clone)]
pub struct ItemTurnResult {
    pub turn: ExptTurnResult,
    pub latest_log: Option<ExptTurnResultRunLog>,
}

#[async_trait]
pub trait ResultService: Send + Sync {
    /// Aggregate one finished item's run-logs into the authoritative rows
    /// and the stats counters. Idempotent: an already-consumed item is a
    /// no-op.
    async fn record_item_run_logs(
        &self,
        expt_id: ExptId,
        run_id: verdex_model::RunId,
        item_id: ItemId,
        space_id: SpaceId,
    ) -> Result<()>;

    async fn get_expt_item_turn_results(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ItemTurnResult>>;
}
