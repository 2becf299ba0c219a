//! Core data model definitions shared across Verdex crates.
#![allow(missing_docs)]

pub mod error;
pub mod eval_set;
pub mod event;
pub mod experiment;
pub mod ids;
pub mod record;
pub mod result;
pub mod run;
pub mod stats;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use eval_set::{EvaluationSetItem, FieldData, Turn};
pub use event::{ItemEvalEvent, ScheduleEvent, Session};
pub use experiment::{
    ConnectorConf, CreditCost, EvalConf, EvalSetRef, EvaluatorIngressConf,
    EvaluatorsConf, Experiment, ExptStatus, ExptType, FieldAdapter, FieldConf,
    TargetConf, TargetIngressConf, TargetRef,
};
pub use ids::{
    EvalSetId, EvalSetVersionId, EvaluatorVersionId, ExptId, ItemId, RunId,
    SpaceId, TargetId, TargetVersionId, TurnId,
};
pub use record::{EvaluatorRecord, Message, RecordStatus, RunError, TargetRecord};
pub use result::{
    ExptItemResult, ExptItemResultRunLog, ExptTurnResult, ExptTurnResultRunLog,
    ItemRunState, ResultState, TurnRunState,
};
pub use run::{EvalMode, ExptRun, RunStatus};
pub use stats::{ExptStats, ExptStatsDelta};
