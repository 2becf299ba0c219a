//! The execution engine: scheduler loop, item eval loop, mode drivers,
//! turn evaluator, error classifier, lifecycle manager, and the worker
//! runtime that feeds the loops from an event source.

use std::sync::Arc;

use crate::infra::{
    Configer, ExptMetric, ExptPublisher, IdGenerator, IdempotencyService,
    Locker,
};
use crate::services::{
    BenefitService, EvaluationSetItemService, EvaluatorRecordService,
    EvaluatorService, ResultService, TargetService,
};
use crate::store::Stores;

pub mod classifier;
pub mod correlation;
pub mod item_loop;
pub mod manager;
pub mod modes;
pub mod runtime;
pub mod scheduler;
pub mod turn_eval;

pub use classifier::ErrorClassifier;
pub use item_loop::ItemEvalLoop;
pub use manager::{CompleteOpts, ExptManager};
pub use modes::{ModeDriver, ModeFactory, ScanBuckets};
pub use runtime::{ExptExecRuntime, RuntimeConf};
pub use scheduler::SchedulerLoop;
pub use turn_eval::TurnEvaluator;

/// Every collaborator the engine components share. Cheap to clone; all
/// handles are `Arc`.
#[derive(Clone)]
pub struct EngineDeps {
    pub stores: Stores,
    pub publisher: Arc<dyn ExptPublisher>,
    pub locker: Arc<dyn Locker>,
    pub idempotency: Arc<dyn IdempotencyService>,
    pub idgen: Arc<dyn IdGenerator>,
    pub metric: Arc<dyn ExptMetric>,
    pub configer: Arc<dyn Configer>,
    pub targets: Arc<dyn TargetService>,
    pub evaluators: Arc<dyn EvaluatorService>,
    pub evaluator_records: Arc<dyn EvaluatorRecordService>,
    pub eval_sets: Arc<dyn EvaluationSetItemService>,
    pub benefits: Arc<dyn BenefitService>,
    pub results: Arc<dyn ResultService>,
}

impl std::fmt::Debug for EngineDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineDeps").finish()
    }
}
