//! # Verdex Server
//!
//! Daemon around the Verdex evaluation engine: loads configuration, wires
//! the persistence and infrastructure backends, starts the scheduler and
//! item-eval worker pools over the in-process event bus, and runs until
//! ctrl-c.
//!
//! With the default memory backend everything lives in process; the
//! `database` feature plus a configured `database_url`/`redis_url` switch
//! persistence to Postgres and the lock/marker services to Redis.

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use verdex_core::exec::{EngineDeps, ExptExecRuntime, ExptManager, RuntimeConf};
use verdex_core::infra::{
    Configer, IdempotencyService, InProcExptBus, Locker, MemoryIdGenerator,
    MemoryIdempotency, MemoryLocker, StaticConfiger, TracingMetric,
};
use verdex_core::services::DefaultResultService;
use verdex_core::store::Stores;
use verdex_model::{
    CreditCost, EvalConf, EvalMode, EvalSetId, EvalSetRef, EvalSetVersionId,
    EvaluationSetItem, EvaluatorVersionId, Experiment, ExptId, ExptStatus,
    ExptType, FieldAdapter, FieldConf, FieldData, ItemId, RunId, Session,
    SpaceId, TargetId, TargetRef, TargetVersionId, Turn, TurnId,
};

mod config;
mod local;

use config::{BackendKind, ConfigLoad};

#[derive(Parser, Debug)]
#[command(name = "verdex-server")]
#[command(about = "Evaluation experiment engine daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "VERDEX_CONFIG")]
    config: Option<PathBuf>,

    /// Seed a small demo experiment against the local services and run it.
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let load = config::load(cli.config.as_deref())?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,expt::metric=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    report_load(&load);
    let conf = load.config;

    let (stores, locker, idempotency) = match conf.backend.kind {
        BackendKind::Memory => {
            info!("using in-memory backend");
            let (stores, _) = Stores::in_memory();
            (
                stores,
                Arc::new(MemoryLocker::new()) as Arc<dyn Locker>,
                Arc::new(MemoryIdempotency::new()) as Arc<dyn IdempotencyService>,
            )
        }
        BackendKind::Postgres => database_backend(&conf.backend).await?,
    };

    let bus = Arc::new(InProcExptBus::new());
    let configer = Arc::new(StaticConfiger {
        exec: conf.exec.clone(),
        retry: conf.retry,
        err_convert: conf.err_convert.clone(),
    }) as Arc<dyn Configer>;
    let eval_sets = Arc::new(local::LocalEvalSets::new());
    let evaluator = Arc::new(local::StaticEvaluator::new(1.0));

    let deps = EngineDeps {
        stores: stores.clone(),
        publisher: bus.clone(),
        locker,
        idempotency,
        idgen: Arc::new(MemoryIdGenerator::new()),
        metric: Arc::new(TracingMetric),
        configer,
        targets: Arc::new(local::EchoTarget::new()),
        evaluators: evaluator.clone(),
        evaluator_records: evaluator,
        eval_sets: eval_sets.clone(),
        benefits: Arc::new(local::OpenBenefit),
        results: Arc::new(DefaultResultService::new(stores.clone())),
    };
    let manager = ExptManager::new(&deps);
    let runtime = ExptExecRuntime::start(
        deps,
        manager.clone(),
        bus.clone(),
        RuntimeConf {
            schedule_workers: conf.workers.schedule,
            item_workers: conf.workers.item,
        },
    );

    let depth_bus = bus.clone();
    let depth_task = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.tick().await;
        loop {
            tick.tick().await;
            let depths = depth_bus.snapshot().await;
            info!(
                schedule = depths.schedule,
                item = depths.item,
                "queue depth"
            );
        }
    });

    if cli.demo {
        seed_demo(&stores, &eval_sets, &manager).await?;
    }

    info!("verdex-server running, ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    depth_task.abort();
    runtime.shutdown().await;
    Ok(())
}

fn report_load(load: &ConfigLoad) {
    if load.env_file_loaded {
        info!("loaded .env file");
    }
    match &load.path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no config file, using defaults"),
    }
    for warning in &load.warnings {
        warn!("{warning}");
    }
}

#[cfg(feature = "database")]
async fn database_backend(
    backend: &config::BackendConf,
) -> anyhow::Result<(Stores, Arc<dyn Locker>, Arc<dyn IdempotencyService>)> {
    use verdex_core::infra::{RedisIdempotency, RedisLocker};
    use verdex_core::store::PostgresStores;

    let database_url = backend
        .database_url
        .as_deref()
        .context("postgres backend requires database_url")?;
    let redis_url = backend
        .redis_url
        .as_deref()
        .context("postgres backend requires redis_url")?;

    let postgres =
        PostgresStores::connect(database_url, backend.max_connections).await?;
    let locker = RedisLocker::new(redis_url).await?;
    let idempotency = RedisIdempotency::new(redis_url).await?;
    info!("using postgres + redis backend");
    Ok((
        Stores::postgres(Arc::new(postgres)),
        Arc::new(locker),
        Arc::new(idempotency),
    ))
}

#[cfg(not(feature = "database"))]
async fn database_backend(
    _backend: &config::BackendConf,
) -> anyhow::Result<(Stores, Arc<dyn Locker>, Arc<dyn IdempotencyService>)> {
    anyhow::bail!("built without the `database` feature; only the memory backend is available")
}

/// Seed a three-item demo experiment against the local echo target and
/// static evaluator, then submit it.
async fn seed_demo(
    stores: &Stores,
    eval_sets: &local::LocalEvalSets,
    manager: &ExptManager,
) -> anyhow::Result<()> {
    let space_id = SpaceId(1);
    let expt_id = ExptId(1);
    let set_id = EvalSetId(1);
    let now = Utc::now();

    let items: Vec<EvaluationSetItem> = (1..=3)
        .map(|i| EvaluationSetItem {
            id: ItemId(i),
            item_idx: i as i32,
            turns: (0..2)
                .map(|t| Turn {
                    id: TurnId(i * 10 + t),
                    field_data: vec![FieldData {
                        name: "input".to_string(),
                        content: format!("demo question {i}.{t}"),
                    }],
                })
                .collect(),
            created_at: now,
        })
        .collect();
    eval_sets.insert(set_id, items);

    let mut eval_conf = EvalConf::default();
    eval_conf
        .connector
        .target_conf
        .ingress_conf
        .eval_set_adapter = FieldAdapter {
        field_confs: vec![FieldConf {
            field_name: "input".to_string(),
            from_field: "input".to_string(),
            value: None,
        }],
    };
    eval_conf.connector.evaluators_conf.default_conf = Some(Default::default());

    stores
        .experiments
        .upsert(&Experiment {
            id: expt_id,
            space_id,
            name: "demo".to_string(),
            source_id: 1,
            expt_type: ExptType::Offline,
            status: ExptStatus::Pending,
            status_message: String::new(),
            target: Some(TargetRef {
                target_id: TargetId(1),
                version_id: TargetVersionId(1),
            }),
            evaluator_version_ids: vec![EvaluatorVersionId(1)],
            eval_set: EvalSetRef {
                set_id,
                version_id: EvalSetVersionId(1),
            },
            eval_conf,
            max_alive_time_ms: 0,
            start_at: now,
            credit_cost: CreditCost::Free,
            created_at: now,
            updated_at: now,
        })
        .await?;

    info!("submitting demo experiment");
    manager
        .run(expt_id, RunId(1), space_id, Session::new("demo"), EvalMode::Submit)
        .await?;
    Ok(())
}
