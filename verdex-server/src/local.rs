//! In-process collaborator services.
//!
//! Production deployments point the engine at RPC clients for the target,
//! evaluator, evaluation-set and benefit platforms. The local services here
//! back single-process runs and the `--demo` flow: the target echoes its
//! mapped input fields, the evaluator scores deterministically, and the
//! benefit service approves everything.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use verdex_core::error::Result;
use verdex_core::services::{
    BenefitCheck, BenefitService, CheckBenefitRequest, EvaluationSetItemService,
    EvaluatorRecordService, EvaluatorService, ExecuteTargetRequest, ItemPage,
    RunEvaluatorRequest, TargetService,
};
use verdex_model::{
    EvalSetId, EvalSetRef, EvaluationSetItem, EvaluatorRecord, ItemId,
    RecordStatus, SpaceId, TargetRecord,
};

/// Evaluation sets held in memory, keyed by set id. Version pinning is a
/// no-op locally; there is only ever one version of each set.
#[derive(Debug, Default)]
pub struct LocalEvalSets {
    sets: DashMap<EvalSetId, Vec<EvaluationSetItem>>,
}

impl LocalEvalSets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, set_id: EvalSetId, items: Vec<EvaluationSetItem>) {
        self.sets.insert(set_id, items);
    }
}

#[async_trait]
impl EvaluationSetItemService for LocalEvalSets {
    async fn list_items(
        &self,
        _space_id: SpaceId,
        eval_set: EvalSetRef,
        page: usize,
        page_size: usize,
    ) -> Result<ItemPage> {
        let items = self
            .sets
            .get(&eval_set.set_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        let total = items.len() as i64;
        let start = page.saturating_sub(1).saturating_mul(page_size);
        let page_items = items
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect();
        Ok(ItemPage {
            items: page_items,
            total,
        })
    }

    async fn batch_get_items(
        &self,
        _space_id: SpaceId,
        eval_set: EvalSetRef,
        item_ids: &[ItemId],
    ) -> Result<Vec<EvaluationSetItem>> {
        let items = self
            .sets
            .get(&eval_set.set_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter(|item| item_ids.contains(&item.id))
            .collect())
    }
}

/// Target that echoes its mapped input fields back as output fields and
/// persists every record for later reload.
#[derive(Debug, Default)]
pub struct EchoTarget {
    records: DashMap<i64, TargetRecord>,
    seq: AtomicI64,
}

impl EchoTarget {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TargetService for EchoTarget {
    async fn execute_target(
        &self,
        req: ExecuteTargetRequest,
    ) -> Result<TargetRecord> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut output_fields = req.fields.clone();
        let mut parts: Vec<String> = req
            .fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        parts.sort();
        output_fields.insert("actual_output".to_string(), parts.join(" "));

        let record = TargetRecord {
            id,
            target_id: Some(req.target.target_id),
            status: RecordStatus::Success,
            output_fields,
            run_error: None,
        };
        self.records.insert(id, record.clone());
        Ok(record)
    }

    async fn get_record_by_id(
        &self,
        _space_id: SpaceId,
        record_id: i64,
    ) -> Result<Option<TargetRecord>> {
        Ok(self.records.get(&record_id).map(|entry| entry.clone()))
    }
}

/// Evaluator that always returns the configured score and persists every
/// record for later reload.
#[derive(Debug)]
pub struct StaticEvaluator {
    score: f64,
    records: DashMap<i64, EvaluatorRecord>,
    seq: AtomicI64,
}

impl StaticEvaluator {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            records: DashMap::new(),
            seq: AtomicI64::new(0),
        }
    }
}

#[async_trait]
impl EvaluatorService for StaticEvaluator {
    async fn run_evaluator(
        &self,
        req: RunEvaluatorRequest,
    ) -> Result<EvaluatorRecord> {
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = EvaluatorRecord {
            id,
            evaluator_version_id: req.evaluator_version_id,
            status: RecordStatus::Success,
            score: Some(self.score),
            reasoning: Some(format!("scored {} input fields", req.fields.len())),
            run_error: None,
        };
        self.records.insert(id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl EvaluatorRecordService for StaticEvaluator {
    async fn batch_get_evaluator_records(
        &self,
        _space_id: SpaceId,
        record_ids: &[i64],
    ) -> Result<Vec<EvaluatorRecord>> {
        Ok(record_ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|entry| entry.clone()))
            .collect())
    }
}

/// Benefit service that approves every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenBenefit;

#[async_trait]
impl BenefitService for OpenBenefit {
    async fn check_and_deduct_eval_benefit(
        &self,
        _req: CheckBenefitRequest,
    ) -> Result<BenefitCheck> {
        Ok(BenefitCheck::allowed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use verdex_model::{
        EvalSetVersionId, ExptId, FieldData, Session, TargetRef, TargetId,
        TargetVersionId, Turn, TurnId,
    };

    fn set_ref() -> EvalSetRef {
        EvalSetRef {
            set_id: EvalSetId(5),
            version_id: EvalSetVersionId(50),
        }
    }

    fn item(id: i64) -> EvaluationSetItem {
        EvaluationSetItem {
            id: ItemId(id),
            item_idx: id as i32,
            turns: vec![Turn {
                id: TurnId(id * 10),
                field_data: vec![FieldData {
                    name: "input".into(),
                    content: format!("question {id}"),
                }],
            }],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn paging_walks_the_whole_set() {
        let sets = LocalEvalSets::new();
        sets.insert(EvalSetId(5), (1..=5).map(item).collect());

        let first = sets.list_items(SpaceId(1), set_ref(), 1, 2).await.unwrap();
        assert_eq!(first.total, 5);
        assert_eq!(first.items.len(), 2);
        let third = sets.list_items(SpaceId(1), set_ref(), 3, 2).await.unwrap();
        assert_eq!(third.items.len(), 1);
        assert_eq!(third.items[0].id, ItemId(5));
        let past = sets.list_items(SpaceId(1), set_ref(), 4, 2).await.unwrap();
        assert!(past.items.is_empty());
    }

    #[tokio::test]
    async fn static_evaluator_persists_and_reloads_records() {
        let evaluator = StaticEvaluator::new(0.8);
        let record = evaluator
            .run_evaluator(RunEvaluatorRequest {
                space_id: SpaceId(1),
                expt_id: ExptId(1),
                item_id: ItemId(1),
                turn_id: TurnId(10),
                evaluator_version_id: verdex_model::EvaluatorVersionId(7),
                fields: HashMap::from([(
                    "output".to_string(),
                    "answer".to_string(),
                )]),
                target_record_id: None,
                session: Session::new("tester"),
                ext: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(record.score, Some(0.8));

        let reloaded = evaluator
            .batch_get_evaluator_records(SpaceId(1), &[record.id, 999])
            .await
            .unwrap();
        assert_eq!(reloaded, vec![record]);
    }

    #[tokio::test]
    async fn echo_target_persists_and_reloads_records() {
        let target = EchoTarget::new();
        let record = target
            .execute_target(ExecuteTargetRequest {
                space_id: SpaceId(1),
                expt_id: ExptId(1),
                item_id: ItemId(1),
                turn_id: TurnId(10),
                target: TargetRef {
                    target_id: TargetId(3),
                    version_id: TargetVersionId(30),
                },
                fields: HashMap::from([(
                    "input".to_string(),
                    "question 1".to_string(),
                )]),
                history: Vec::new(),
                session: Session::new("tester"),
                ext: HashMap::new(),
            })
            .await
            .unwrap();
        assert_eq!(
            record.output_fields.get("actual_output").map(String::as_str),
            Some("input=question 1")
        );

        let reloaded = target
            .get_record_by_id(SpaceId(1), record.id)
            .await
            .unwrap()
            .expect("record persisted");
        assert_eq!(reloaded, record);
        assert!(
            target
                .get_record_by_id(SpaceId(1), 999)
                .await
                .unwrap()
                .is_none()
        );
    }
}
