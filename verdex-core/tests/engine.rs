//! End-to-end engine tests over the in-memory backend and the in-process
//! event bus, with scripted target / evaluator / benefit services.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::timeout;

use verdex_core::config::{
    AggRetryConf, DaemonInterval, ErrConvertConf, ErrRetryConf, ExecPacingConf,
    ExptExecConf, ExptItemEvalConf, ZombieInterval,
};
use verdex_core::error::Result;
use verdex_core::exec::{
    EngineDeps, ExptManager, ItemEvalLoop, SchedulerLoop,
};
use verdex_core::infra::{
    CaptureMetric, ExptEventSource, IdempotencyService, InProcExptBus,
    MemoryIdGenerator, MemoryIdempotency, MemoryLocker, StaticConfiger,
};
use verdex_core::services::{
    BenefitCheck, BenefitDenyReason, BenefitService, CheckBenefitRequest,
    DefaultResultService, EvaluationSetItemService, EvaluatorRecordService,
    EvaluatorService, ExecuteTargetRequest, ItemPage, RunEvaluatorRequest,
    TargetService,
};
use verdex_core::store::Stores;
use verdex_model::{
    CreditCost, EvalConf, EvalMode, EvalSetId, EvalSetRef, EvalSetVersionId,
    EvaluationSetItem, EvaluatorIngressConf, EvaluatorRecord,
    EvaluatorVersionId, Experiment, ExptId, ExptRun, ExptStatus, ExptType,
    FieldAdapter, FieldConf, FieldData, ItemEvalEvent, ItemId, ItemRunState,
    RecordStatus, ResultState, RunError, RunId, RunStatus, ScheduleEvent,
    Session, SpaceId, TargetId, TargetRecord, TargetRef, TargetVersionId, Turn,
    TurnId, TurnRunState,
};

const SPACE: SpaceId = SpaceId(7);
const EVALUATOR: EvaluatorVersionId = EvaluatorVersionId(301);

// --- scripted collaborators -------------------------------------------------

#[derive(Default)]
struct FixedEvalSets {
    items: Vec<EvaluationSetItem>,
}

#[async_trait]
impl EvaluationSetItemService for FixedEvalSets {
    async fn list_items(
        &self,
        _space_id: SpaceId,
        _eval_set: EvalSetRef,
        page: usize,
        page_size: usize,
    ) -> Result<ItemPage> {
        let start = page.saturating_sub(1) * page_size;
        Ok(ItemPage {
            items: self
                .items
                .iter()
                .skip(start)
                .take(page_size)
                .cloned()
                .collect(),
            total: self.items.len() as i64,
        })
    }

    async fn batch_get_items(
        &self,
        _space_id: SpaceId,
        _eval_set: EvalSetRef,
        item_ids: &[ItemId],
    ) -> Result<Vec<EvaluationSetItem>> {
        Ok(self
            .items
            .iter()
            .filter(|item| item_ids.contains(&item.id))
            .cloned()
            .collect())
    }
}

/// Target whose per-turn failures are scripted: `fail_times(turn, n)` makes
/// the next `n` invocations of that turn report a business error.
#[derive(Default)]
struct ScriptedTarget {
    seq: AtomicI64,
    records: Mutex<HashMap<i64, TargetRecord>>,
    fail_remaining: Mutex<HashMap<TurnId, u32>>,
    calls: Mutex<Vec<TurnId>>,
}

impl ScriptedTarget {
    fn fail_times(&self, turn_id: TurnId, n: u32) {
        self.fail_remaining.lock().unwrap().insert(turn_id, n);
    }

    fn calls_for(&self, turn_id: TurnId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|t| **t == turn_id)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TargetService for ScriptedTarget {
    async fn execute_target(
        &self,
        req: ExecuteTargetRequest,
    ) -> Result<TargetRecord> {
        self.calls.lock().unwrap().push(req.turn_id);
        let fail = {
            let mut remaining = self.fail_remaining.lock().unwrap();
            match remaining.get_mut(&req.turn_id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = if fail {
            TargetRecord {
                id,
                target_id: Some(req.target.target_id),
                status: RecordStatus::Fail,
                output_fields: HashMap::new(),
                run_error: Some(RunError {
                    code: 500,
                    message: "target backend unavailable".to_string(),
                }),
            }
        } else {
            TargetRecord {
                id,
                target_id: Some(req.target.target_id),
                status: RecordStatus::Success,
                output_fields: HashMap::from([(
                    "actual_output".to_string(),
                    format!("answer for turn {}", req.turn_id),
                )]),
                run_error: None,
            }
        };
        self.records.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }

    async fn get_record_by_id(
        &self,
        _space_id: SpaceId,
        record_id: i64,
    ) -> Result<Option<TargetRecord>> {
        Ok(self.records.lock().unwrap().get(&record_id).cloned())
    }
}

/// Evaluator with the same scripted-failure hooks as the target; records
/// are persisted so cached-score reloads hit real state.
#[derive(Default)]
struct ScriptedEvaluator {
    seq: AtomicI64,
    records: Mutex<HashMap<i64, EvaluatorRecord>>,
    fail_remaining: Mutex<HashMap<TurnId, u32>>,
    calls: Mutex<Vec<(TurnId, EvaluatorVersionId)>>,
}

impl ScriptedEvaluator {
    fn fail_times(&self, turn_id: TurnId, n: u32) {
        self.fail_remaining.lock().unwrap().insert(turn_id, n);
    }

    fn calls_for(&self, turn_id: TurnId) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| *t == turn_id)
            .count()
    }

    fn record(&self, record_id: i64) -> Option<EvaluatorRecord> {
        self.records.lock().unwrap().get(&record_id).cloned()
    }
}

#[async_trait]
impl EvaluatorService for ScriptedEvaluator {
    async fn run_evaluator(
        &self,
        req: RunEvaluatorRequest,
    ) -> Result<EvaluatorRecord> {
        self.calls
            .lock()
            .unwrap()
            .push((req.turn_id, req.evaluator_version_id));
        let fail = {
            let mut remaining = self.fail_remaining.lock().unwrap();
            match remaining.get_mut(&req.turn_id) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let record = if fail {
            EvaluatorRecord {
                id,
                evaluator_version_id: req.evaluator_version_id,
                status: RecordStatus::Fail,
                score: None,
                reasoning: None,
                run_error: Some(RunError {
                    code: 500,
                    message: "evaluator backend unavailable".to_string(),
                }),
            }
        } else {
            EvaluatorRecord {
                id,
                evaluator_version_id: req.evaluator_version_id,
                status: RecordStatus::Success,
                score: Some(0.5),
                reasoning: None,
                run_error: None,
            }
        };
        self.records.lock().unwrap().insert(id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl EvaluatorRecordService for ScriptedEvaluator {
    async fn batch_get_evaluator_records(
        &self,
        _space_id: SpaceId,
        record_ids: &[i64],
    ) -> Result<Vec<EvaluatorRecord>> {
        let records = self.records.lock().unwrap();
        Ok(record_ids
            .iter()
            .filter_map(|id| records.get(id).cloned())
            .collect())
    }
}

#[derive(Default)]
struct ScriptedBenefit {
    deny: Mutex<Option<BenefitDenyReason>>,
}

impl ScriptedBenefit {
    fn deny_in_debt(&self) {
        *self.deny.lock().unwrap() = Some(BenefitDenyReason::InDebt);
    }
}

#[async_trait]
impl BenefitService for ScriptedBenefit {
    async fn check_and_deduct_eval_benefit(
        &self,
        _req: CheckBenefitRequest,
    ) -> Result<BenefitCheck> {
        Ok(BenefitCheck {
            deny_reason: self.deny.lock().unwrap().clone(),
        })
    }
}

// --- harness ----------------------------------------------------------------

fn test_exec_conf() -> ExptExecConf {
    ExptExecConf {
        zombie_interval_secs: ZombieInterval(600),
        daemon_interval_secs: DaemonInterval(0),
        item_eval: ExptItemEvalConf {
            concur_num: 5,
            interval_ms: 0,
            zombie_secs: 600,
        },
        pacing: ExecPacingConf::immediate(),
        aggregation: AggRetryConf {
            max_elapsed_ms: 200,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
        },
        ..ExptExecConf::default()
    }
}

fn no_retry() -> ErrRetryConf {
    ErrRetryConf {
        retry_times: 0,
        retry_interval_secs: 0,
        is_in_debt: false,
    }
}

fn retries(n: u32) -> ErrRetryConf {
    ErrRetryConf {
        retry_times: n,
        retry_interval_secs: 0,
        is_in_debt: false,
    }
}

struct Harness {
    stores: Stores,
    bus: Arc<InProcExptBus>,
    scheduler: Arc<SchedulerLoop>,
    item_loop: Arc<ItemEvalLoop>,
    manager: Arc<ExptManager>,
    metric: Arc<CaptureMetric>,
    target: Arc<ScriptedTarget>,
    evaluator: Arc<ScriptedEvaluator>,
    benefit: Arc<ScriptedBenefit>,
    idempotency: Arc<MemoryIdempotency>,
}

fn harness(items: Vec<EvaluationSetItem>, retry: ErrRetryConf) -> Harness {
    let (stores, _) = Stores::in_memory();
    let bus = Arc::new(InProcExptBus::new());
    let metric = Arc::new(CaptureMetric::new());
    let target = Arc::new(ScriptedTarget::default());
    let evaluator = Arc::new(ScriptedEvaluator::default());
    let benefit = Arc::new(ScriptedBenefit::default());
    let idempotency = Arc::new(MemoryIdempotency::new());

    let deps = EngineDeps {
        stores: stores.clone(),
        publisher: bus.clone(),
        locker: Arc::new(MemoryLocker::new()),
        idempotency: idempotency.clone(),
        idgen: Arc::new(MemoryIdGenerator::new()),
        metric: metric.clone(),
        configer: Arc::new(StaticConfiger {
            exec: test_exec_conf(),
            retry,
            err_convert: ErrConvertConf::default(),
        }),
        targets: target.clone(),
        evaluators: evaluator.clone(),
        evaluator_records: evaluator.clone(),
        eval_sets: Arc::new(FixedEvalSets { items }),
        benefits: benefit.clone(),
        results: Arc::new(DefaultResultService::new(stores.clone())),
    };
    let manager = ExptManager::new(&deps);
    let scheduler = SchedulerLoop::new(deps.clone(), manager.clone());
    let item_loop = ItemEvalLoop::new(deps, manager.clone());

    Harness {
        stores,
        bus,
        scheduler,
        item_loop,
        manager,
        metric,
        target,
        evaluator,
        benefit,
        idempotency,
    }
}

impl Harness {
    /// Consume both queues, items first, until the engine goes quiet.
    async fn pump(&self) {
        for _ in 0..200 {
            let mut progressed = false;
            while let Ok(Some(event)) =
                timeout(Duration::from_millis(20), self.bus.next_item()).await
            {
                self.item_loop.handle(event).await.unwrap();
                progressed = true;
            }
            if let Ok(Some(event)) =
                timeout(Duration::from_millis(20), self.bus.next_schedule()).await
            {
                self.scheduler.handle(event).await.unwrap();
                progressed = true;
            }
            if !progressed {
                return;
            }
        }
        panic!("engine did not quiesce");
    }

    async fn pump_items(&self) {
        while let Ok(Some(event)) =
            timeout(Duration::from_millis(20), self.bus.next_item()).await
        {
            self.item_loop.handle(event).await.unwrap();
        }
    }

    async fn drop_schedule_events(&self) {
        while timeout(Duration::from_millis(20), self.bus.next_schedule())
            .await
            .is_ok()
        {}
    }

    async fn experiment(&self, expt_id: ExptId) -> Experiment {
        self.stores.experiments.get(SPACE, expt_id).await.unwrap()
    }

    async fn run_row(&self, expt_id: ExptId, run_id: RunId) -> ExptRun {
        self.stores
            .runs
            .get(expt_id, run_id)
            .await
            .unwrap()
            .expect("run row")
    }
}

fn adapter(field_name: &str, from_field: &str) -> FieldAdapter {
    FieldAdapter {
        field_confs: vec![FieldConf {
            field_name: field_name.to_string(),
            from_field: from_field.to_string(),
            value: None,
        }],
    }
}

fn experiment(expt_id: ExptId) -> Experiment {
    let now = Utc::now();
    let mut eval_conf = EvalConf::default();
    eval_conf.connector.target_conf.ingress_conf.eval_set_adapter =
        adapter("input", "input");
    eval_conf.connector.evaluators_conf.default_conf =
        Some(EvaluatorIngressConf {
            target_adapter: adapter("output", "actual_output"),
            eval_set_adapter: adapter("input", "input"),
        });
    Experiment {
        id: expt_id,
        space_id: SPACE,
        name: "accuracy sweep".to_string(),
        source_id: 9,
        expt_type: ExptType::Offline,
        status: ExptStatus::Pending,
        status_message: String::new(),
        target: Some(TargetRef {
            target_id: TargetId(3),
            version_id: TargetVersionId(30),
        }),
        evaluator_version_ids: vec![EVALUATOR],
        eval_set: EvalSetRef {
            set_id: EvalSetId(5),
            version_id: EvalSetVersionId(50),
        },
        eval_conf,
        max_alive_time_ms: 0,
        start_at: now,
        credit_cost: CreditCost::Cost,
        created_at: now,
        updated_at: now,
    }
}

/// Items 1..=n, turn ids `item * 10 + turn_idx` starting at 1.
fn eval_items(n_items: i64, turns_per: i64) -> Vec<EvaluationSetItem> {
    (1..=n_items)
        .map(|i| EvaluationSetItem {
            id: ItemId(i),
            item_idx: i as i32,
            turns: (1..=turns_per)
                .map(|t| Turn {
                    id: TurnId(i * 10 + t),
                    field_data: vec![FieldData {
                        name: "input".to_string(),
                        content: format!("question {i}.{t}"),
                    }],
                })
                .collect(),
            created_at: Utc::now(),
        })
        .collect()
}

async fn submit(h: &Harness, expt_id: ExptId, run_id: RunId, mode: EvalMode) {
    h.manager
        .run(expt_id, run_id, SPACE, Session::new("tester"), mode)
        .await
        .unwrap();
}

// --- scenarios --------------------------------------------------------------

#[tokio::test]
async fn submit_run_completes_every_item() {
    let mut items = eval_items(2, 2);
    // A zero-turn item succeeds without any target or evaluator call.
    items.push(EvaluationSetItem {
        id: ItemId(3),
        item_idx: 3,
        turns: Vec::new(),
        created_at: Utc::now(),
    });
    let h = harness(items, no_retry());
    let expt_id = ExptId(1);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;

    let expt = h.experiment(expt_id).await;
    assert_eq!(expt.status, ExptStatus::Success);
    assert_eq!(h.run_row(expt_id, RunId(1)).await.status, RunStatus::Completed);

    for item_id in [ItemId(1), ItemId(2), ItemId(3)] {
        let item = h
            .stores
            .items
            .get(expt_id, item_id)
            .await
            .unwrap()
            .expect("item row");
        assert_eq!(item.status, ItemRunState::Success);
        assert_eq!(item.result_state, ResultState::Logged);
    }
    for turn_id in [TurnId(11), TurnId(12), TurnId(21), TurnId(22)] {
        let logs = h
            .stores
            .turns
            .latest_run_logs_by_item(expt_id, ItemId(turn_id.0 / 10))
            .await
            .unwrap();
        let log = logs
            .iter()
            .find(|l| l.turn_id == turn_id)
            .expect("turn run-log");
        assert_eq!(log.status, TurnRunState::Success);
        assert!(log.target_result_id.is_some());
        assert!(log.evaluator_result_ids.contains_key(&EVALUATOR));
    }

    assert_eq!(h.target.total_calls(), 4);
    assert_eq!(h.evaluator.calls.lock().unwrap().len(), 4);
    let stats = h.stores.stats.get(expt_id).await.unwrap().expect("stats");
    assert_eq!(stats.success_turn_cnt, 4);
    assert_eq!(stats.fail_turn_cnt, 0);
    assert_eq!(stats.terminated_turn_cnt, 0);
}

#[tokio::test]
async fn transient_target_error_retries_and_succeeds() {
    let h = harness(eval_items(1, 1), retries(2));
    let expt_id = ExptId(2);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();
    h.target.fail_times(TurnId(11), 1);

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;

    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
    // First attempt fails, the republished attempt succeeds.
    assert_eq!(h.target.calls_for(TurnId(11)), 2);
    let results = h.metric.item_results();
    assert!(results.iter().any(|m| m.failed && m.will_retry));
    assert!(results.iter().any(|m| !m.failed));
}

#[tokio::test]
async fn fail_retry_reruns_only_the_failed_turn() {
    let h = harness(eval_items(2, 2), no_retry());
    let expt_id = ExptId(3);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();
    // Item 1: first turn succeeds, second turn keeps failing in run 1.
    h.target.fail_times(TurnId(12), 1);

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;
    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Failed);
    assert_eq!(h.target.calls_for(TurnId(11)), 1);
    assert_eq!(h.target.calls_for(TurnId(12)), 1);

    // Upstream retry: reset the experiment and submit a FailRetry run.
    h.stores
        .experiments
        .update_status(SPACE, expt_id, ExptStatus::Pending, None)
        .await
        .unwrap();
    submit(&h, expt_id, RunId(2), EvalMode::FailRetry).await;
    h.pump().await;

    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
    // The cached first turn is reused; only the failed turn re-executes.
    assert_eq!(h.target.calls_for(TurnId(11)), 1);
    assert_eq!(h.target.calls_for(TurnId(12)), 2);
    assert_eq!(h.evaluator.calls_for(TurnId(11)), 1);
    assert_eq!(h.evaluator.calls_for(TurnId(12)), 1);
    // Item 2 finished in run 1 and is never re-run.
    assert_eq!(h.target.calls_for(TurnId(21)), 1);
    let stats = h.stores.stats.get(expt_id).await.unwrap().expect("stats");
    assert_eq!(stats.fail_turn_cnt, 0);
}

#[tokio::test]
async fn in_debt_terminates_the_experiment() {
    let h = harness(eval_items(2, 1), retries(3));
    let expt_id = ExptId(4);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();
    h.benefit.deny_in_debt();

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;

    let expt = h.experiment(expt_id).await;
    assert_eq!(expt.status, ExptStatus::Terminated);
    assert!(expt.status_message.contains("benefit"));
    assert_eq!(h.run_row(expt_id, RunId(1)).await.status, RunStatus::Completed);
    // In-debt never consumes the retry budget.
    assert!(h.metric.item_results().iter().all(|m| !m.will_retry));
    assert!(
        h.idempotency
            .exist("terminate:indebt:1:expt")
            .await
            .unwrap()
    );
    // No target calls were wasted after the denial.
    assert_eq!(h.target.total_calls(), 0);
}

#[tokio::test]
async fn redelivered_item_event_is_dropped() {
    let h = harness(eval_items(1, 1), no_retry());
    let expt_id = ExptId(5);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;
    assert_eq!(h.target.calls_for(TurnId(11)), 1);

    // At-least-once delivery: the same event shows up again.
    let duplicate = ItemEvalEvent {
        expt_id,
        run_id: RunId(1),
        space_id: SPACE,
        mode: EvalMode::Submit,
        eval_set_item_id: ItemId(1),
        create_at: Utc::now().timestamp(),
        retry_times: 0,
        ext: HashMap::new(),
        session: Session::new("tester"),
    };
    h.item_loop.handle(duplicate).await.unwrap();

    assert_eq!(h.target.calls_for(TurnId(11)), 1);
    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
}

#[tokio::test]
async fn zombie_schedule_event_fails_the_experiment() {
    let h = harness(eval_items(1, 1), no_retry());
    let expt_id = ExptId(6);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();
    let now = Utc::now();
    h.stores
        .runs
        .create_nx(&ExptRun {
            id: RunId(1),
            expt_id,
            space_id: SPACE,
            mode: EvalMode::Submit,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

    let stale = ScheduleEvent {
        expt_id,
        run_id: RunId(1),
        space_id: SPACE,
        mode: EvalMode::Submit,
        session: Session::new("tester"),
        created_at: now.timestamp() - 700,
        ext: HashMap::new(),
    };
    h.scheduler.handle(stale).await.unwrap();

    let expt = h.experiment(expt_id).await;
    assert_eq!(expt.status, ExptStatus::Failed);
    assert!(expt.status_message.contains("zombie"));
    assert_eq!(h.run_row(expt_id, RunId(1)).await.status, RunStatus::Completed);
    assert!(h.idempotency.exist("exptexec:onerr:1:run").await.unwrap());
    // Nothing was scheduled or executed.
    assert_eq!(h.target.total_calls(), 0);
}

#[tokio::test]
async fn append_run_drains_after_the_alive_window() {
    let h = harness(eval_items(1, 1), no_retry());
    let expt_id = ExptId(7);
    let run_id = RunId(1);
    let now = Utc::now();

    let mut expt = experiment(expt_id);
    expt.status = ExptStatus::Processing;
    expt.max_alive_time_ms = 60_000;
    h.stores.experiments.upsert(&expt).await.unwrap();
    h.stores
        .runs
        .create_nx(&ExptRun {
            id: run_id,
            expt_id,
            space_id: SPACE,
            mode: EvalMode::Append,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();
    h.stores
        .stats
        .create_nx(&verdex_model::ExptStats::zeroed(expt_id, SPACE))
        .await
        .unwrap();
    // Upstream append: item, turn, and a queued run-log.
    h.stores
        .items
        .batch_create_nx(&[verdex_model::ExptItemResult {
            id: 1,
            expt_id,
            item_id: ItemId(1),
            item_idx: 1,
            status: ItemRunState::Queueing,
            result_state: ResultState::Unlogged,
            err_msg: None,
            expt_run_id: Some(run_id),
            created_at: now,
            updated_at: now,
        }])
        .await
        .unwrap();
    h.stores
        .turns
        .batch_create_nx(&[verdex_model::ExptTurnResult {
            id: 2,
            expt_id,
            item_id: ItemId(1),
            turn_id: TurnId(11),
            turn_idx: 0,
            status: TurnRunState::Queueing,
            created_at: now,
            updated_at: now,
        }])
        .await
        .unwrap();
    h.stores
        .items
        .batch_create_run_logs_nx(&[verdex_model::ExptItemResultRunLog {
            id: 3,
            expt_id,
            run_id,
            item_id: ItemId(1),
            status: ItemRunState::Queueing,
            result_state: ResultState::Unlogged,
            err_msg: None,
            log_id: "9:7:1:7".to_string(),
            created_at: now,
            updated_at: now,
        }])
        .await
        .unwrap();

    let event = ScheduleEvent {
        expt_id,
        run_id,
        space_id: SPACE,
        mode: EvalMode::Append,
        session: Session::new("tester"),
        created_at: Utc::now().timestamp(),
        ext: HashMap::new(),
    };

    // Tick 1: the appended item is submitted and evaluated.
    h.scheduler.handle(event.clone()).await.unwrap();
    h.pump_items().await;
    h.drop_schedule_events().await;
    assert_eq!(h.target.calls_for(TurnId(11)), 1);

    // Tick 2: nothing left, the run parks.
    h.scheduler
        .handle(event.clone().refreshed(Utc::now()))
        .await
        .unwrap();
    h.drop_schedule_events().await;
    assert_eq!(h.run_row(expt_id, run_id).await.status, RunStatus::Pended);
    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Pending);

    // Alive window elapses; the next tick drains and finalizes.
    let mut expt = h.experiment(expt_id).await;
    expt.start_at = Utc::now() - chrono::Duration::seconds(120);
    h.stores.experiments.upsert(&expt).await.unwrap();
    h.scheduler
        .handle(event.refreshed(Utc::now()))
        .await
        .unwrap();
    h.drop_schedule_events().await;

    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
    assert_eq!(h.run_row(expt_id, run_id).await.status, RunStatus::Completed);
}

#[tokio::test]
async fn online_experiment_never_calls_the_target() {
    let h = harness(eval_items(1, 2), no_retry());
    let expt_id = ExptId(8);
    let mut expt = experiment(expt_id);
    expt.expt_type = ExptType::Online;
    expt.target = None;
    h.stores.experiments.upsert(&expt).await.unwrap();

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;

    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
    assert_eq!(h.target.total_calls(), 0);
    assert_eq!(h.evaluator.calls.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn failed_evaluator_record_is_not_reused() {
    let h = harness(eval_items(1, 1), retries(2));
    let expt_id = ExptId(10);
    h.stores.experiments.upsert(&experiment(expt_id)).await.unwrap();
    // Target succeeds; the evaluator reports a business error once.
    h.evaluator.fail_times(TurnId(11), 1);

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    h.pump().await;

    assert_eq!(h.experiment(expt_id).await.status, ExptStatus::Success);
    // The retry pass rejects the failed cached record and re-runs the
    // evaluator, while the successful target record is reused.
    assert_eq!(h.evaluator.calls_for(TurnId(11)), 2);
    assert_eq!(h.target.calls_for(TurnId(11)), 1);

    let logs = h
        .stores
        .turns
        .latest_run_logs_by_item(expt_id, ItemId(1))
        .await
        .unwrap();
    let log = logs
        .iter()
        .find(|l| l.turn_id == TurnId(11))
        .expect("turn run-log");
    assert_eq!(log.status, TurnRunState::Success);
    let record_id = log
        .evaluator_result_ids
        .get(&EVALUATOR)
        .copied()
        .expect("evaluator record id");
    let record = h.evaluator.record(record_id).expect("persisted record");
    assert_eq!(record.status, RecordStatus::Success);
    assert!(record.run_error.is_none());
    let stats = h.stores.stats.get(expt_id).await.unwrap().expect("stats");
    assert_eq!(stats.fail_turn_cnt, 0);
}

#[tokio::test]
async fn schedule_event_for_a_missing_experiment_is_acked() {
    let h = harness(eval_items(1, 1), no_retry());
    // No experiment row, no run row: the cycle fails and so does the
    // failure bookkeeping. The event must still be acknowledged.
    let event = ScheduleEvent {
        expt_id: ExptId(99),
        run_id: RunId(1),
        space_id: SPACE,
        mode: EvalMode::Submit,
        session: Session::new("tester"),
        created_at: Utc::now().timestamp(),
        ext: HashMap::new(),
    };
    h.scheduler.handle(event).await.unwrap();
    assert_eq!(h.target.total_calls(), 0);
}

#[tokio::test]
async fn item_concur_num_bounds_the_submit_batch() {
    let h = harness(eval_items(3, 1), no_retry());
    let expt_id = ExptId(9);
    let mut expt = experiment(expt_id);
    expt.eval_conf.item_concur_num = Some(1);
    h.stores.experiments.upsert(&expt).await.unwrap();

    submit(&h, expt_id, RunId(1), EvalMode::Submit).await;
    let event = timeout(Duration::from_millis(100), h.bus.next_schedule())
        .await
        .unwrap()
        .expect("initial schedule event");
    h.scheduler.handle(event).await.unwrap();

    // Only one item of three is in flight after the first cycle.
    let depths = h.bus.snapshot().await;
    assert_eq!(depths.item, 1);
}
