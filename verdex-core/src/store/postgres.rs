//! Postgres backend serving all five store traits from one pool.
//!
//! Inserts are `ON CONFLICT DO NOTHING` and the stats updates are single
//! arithmetic statements, so at-least-once event delivery never double
//! counts. Experiment configuration rides in JSONB columns; the hot result
//! columns stay relational for the status scans.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;

use super::{
    ExperimentStore, ItemResultStore, RunStore, StatsStore, TurnResultStore,
};
use crate::error::{ExptError, Result};
use verdex_model::{
    CreditCost, EvalConf, EvalMode, EvalSetRef, Experiment, ExptId,
    ExptItemResult, ExptItemResultRunLog, ExptRun, ExptStats, ExptStatsDelta,
    ExptStatus, ExptTurnResult, ExptTurnResultRunLog, ExptType, ItemId,
    ItemRunState, ResultState, RunId, RunStatus, SpaceId, TargetRef, TurnId,
    TurnRunState,
};

#[derive(Clone, Debug)]
pub struct PostgresStores {
    pool: PgPool,
}

impl PostgresStores {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        info!("Connecting to Postgres store backend");
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        crate::MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| ExptError::Store(format!("migration failed: {e}")))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn expt_status_code(status: ExptStatus) -> i16 {
    match status {
        ExptStatus::Pending => 1,
        ExptStatus::Processing => 2,
        ExptStatus::Draining => 3,
        ExptStatus::Success => 4,
        ExptStatus::Failed => 5,
        ExptStatus::Terminated => 6,
    }
}

fn expt_status_from(code: i16) -> Result<ExptStatus> {
    match code {
        1 => Ok(ExptStatus::Pending),
        2 => Ok(ExptStatus::Processing),
        3 => Ok(ExptStatus::Draining),
        4 => Ok(ExptStatus::Success),
        5 => Ok(ExptStatus::Failed),
        6 => Ok(ExptStatus::Terminated),
        other => Err(ExptError::Store(format!("unknown experiment status {other}"))),
    }
}

fn expt_type_code(t: ExptType) -> i16 {
    match t {
        ExptType::Offline => 1,
        ExptType::Online => 2,
    }
}

fn expt_type_from(code: i16) -> Result<ExptType> {
    match code {
        1 => Ok(ExptType::Offline),
        2 => Ok(ExptType::Online),
        other => Err(ExptError::Store(format!("unknown experiment type {other}"))),
    }
}

fn credit_cost_code(c: CreditCost) -> i16 {
    match c {
        CreditCost::Free => 1,
        CreditCost::Cost => 2,
    }
}

fn credit_cost_from(code: i16) -> Result<CreditCost> {
    match code {
        1 => Ok(CreditCost::Free),
        2 => Ok(CreditCost::Cost),
        other => Err(ExptError::Store(format!("unknown credit cost {other}"))),
    }
}

fn store_err(e: verdex_model::ModelError) -> ExptError {
    ExptError::Store(e.to_string())
}

fn experiment_from_row(row: &PgRow) -> Result<Experiment> {
    let target = match (
        row.try_get::<Option<i64>, _>("target_id")?,
        row.try_get::<Option<i64>, _>("target_version_id")?,
    ) {
        (Some(target_id), Some(version_id)) => Some(TargetRef {
            target_id: target_id.into(),
            version_id: version_id.into(),
        }),
        _ => None,
    };
    Ok(Experiment {
        id: ExptId(row.try_get("id")?),
        space_id: SpaceId(row.try_get("space_id")?),
        name: row.try_get("name")?,
        source_id: row.try_get("source_id")?,
        expt_type: expt_type_from(row.try_get("expt_type")?)?,
        status: expt_status_from(row.try_get("status")?)?,
        status_message: row.try_get("status_message")?,
        target,
        evaluator_version_ids: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("evaluator_version_ids")?,
        )?,
        eval_set: EvalSetRef {
            set_id: row.try_get::<i64, _>("eval_set_id")?.into(),
            version_id: row.try_get::<i64, _>("eval_set_version_id")?.into(),
        },
        eval_conf: serde_json::from_value::<EvalConf>(
            row.try_get::<serde_json::Value, _>("eval_conf")?,
        )?,
        max_alive_time_ms: row.try_get("max_alive_time_ms")?,
        start_at: row.try_get("start_at")?,
        credit_cost: credit_cost_from(row.try_get("credit_cost")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<ExptItemResult> {
    Ok(ExptItemResult {
        id: row.try_get("id")?,
        expt_id: ExptId(row.try_get("expt_id")?),
        item_id: ItemId(row.try_get("item_id")?),
        item_idx: row.try_get("item_idx")?,
        status: ItemRunState::from_i32(row.try_get::<i16, _>("status")? as i32)
            .map_err(store_err)?,
        result_state: ResultState::from_i32(
            row.try_get::<i16, _>("result_state")? as i32,
        )
        .map_err(store_err)?,
        err_msg: row.try_get("err_msg")?,
        expt_run_id: row.try_get::<Option<i64>, _>("expt_run_id")?.map(RunId),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn item_log_from_row(row: &PgRow) -> Result<ExptItemResultRunLog> {
    Ok(ExptItemResultRunLog {
        id: row.try_get("id")?,
        expt_id: ExptId(row.try_get("expt_id")?),
        run_id: RunId(row.try_get("run_id")?),
        item_id: ItemId(row.try_get("item_id")?),
        status: ItemRunState::from_i32(row.try_get::<i16, _>("status")? as i32)
            .map_err(store_err)?,
        result_state: ResultState::from_i32(
            row.try_get::<i16, _>("result_state")? as i32,
        )
        .map_err(store_err)?,
        err_msg: row.try_get("err_msg")?,
        log_id: row.try_get("log_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn turn_from_row(row: &PgRow) -> Result<ExptTurnResult> {
    Ok(ExptTurnResult {
        id: row.try_get("id")?,
        expt_id: ExptId(row.try_get("expt_id")?),
        item_id: ItemId(row.try_get("item_id")?),
        turn_id: TurnId(row.try_get("turn_id")?),
        turn_idx: row.try_get("turn_idx")?,
        status: TurnRunState::from_i32(row.try_get::<i16, _>("status")? as i32)
            .map_err(store_err)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn turn_log_from_row(row: &PgRow) -> Result<ExptTurnResultRunLog> {
    Ok(ExptTurnResultRunLog {
        id: row.try_get("id")?,
        expt_id: ExptId(row.try_get("expt_id")?),
        run_id: RunId(row.try_get("run_id")?),
        item_id: ItemId(row.try_get("item_id")?),
        turn_id: TurnId(row.try_get("turn_id")?),
        status: TurnRunState::from_i32(row.try_get::<i16, _>("status")? as i32)
            .map_err(store_err)?,
        target_result_id: row.try_get("target_result_id")?,
        evaluator_result_ids: serde_json::from_value(
            row.try_get::<serde_json::Value, _>("evaluator_result_ids")?,
        )?,
        err_msg: row.try_get("err_msg")?,
        log_id: row.try_get("log_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn stats_from_row(row: &PgRow) -> Result<ExptStats> {
    Ok(ExptStats {
        expt_id: ExptId(row.try_get("expt_id")?),
        space_id: SpaceId(row.try_get("space_id")?),
        pending_turn_cnt: row.try_get("pending_turn_cnt")?,
        queueing_turn_cnt: row.try_get("queueing_turn_cnt")?,
        processing_turn_cnt: row.try_get("processing_turn_cnt")?,
        success_turn_cnt: row.try_get("success_turn_cnt")?,
        fail_turn_cnt: row.try_get("fail_turn_cnt")?,
        terminated_turn_cnt: row.try_get("terminated_turn_cnt")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn ids(item_ids: &[ItemId]) -> Vec<i64> {
    item_ids.iter().map(|i| i.0).collect()
}

#[async_trait]
impl ExperimentStore for PostgresStores {
    async fn upsert(&self, expt: &Experiment) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO experiment (
                id, space_id, name, source_id, expt_type, status,
                status_message, target_id, target_version_id,
                evaluator_version_ids, eval_set_id, eval_set_version_id,
                eval_conf, max_alive_time_ms, start_at, credit_cost,
                created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                status_message = EXCLUDED.status_message,
                eval_conf = EXCLUDED.eval_conf,
                max_alive_time_ms = EXCLUDED.max_alive_time_ms,
                start_at = EXCLUDED.start_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(expt.id.0)
        .bind(expt.space_id.0)
        .bind(&expt.name)
        .bind(expt.source_id)
        .bind(expt_type_code(expt.expt_type))
        .bind(expt_status_code(expt.status))
        .bind(&expt.status_message)
        .bind(expt.target.map(|t| t.target_id.as_i64()))
        .bind(expt.target.map(|t| t.version_id.as_i64()))
        .bind(serde_json::to_value(&expt.evaluator_version_ids)?)
        .bind(expt.eval_set.set_id.as_i64())
        .bind(expt.eval_set.version_id.as_i64())
        .bind(serde_json::to_value(&expt.eval_conf)?)
        .bind(expt.max_alive_time_ms)
        .bind(expt.start_at)
        .bind(credit_cost_code(expt.credit_cost))
        .bind(expt.created_at)
        .bind(expt.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, space_id: SpaceId, expt_id: ExptId) -> Result<Experiment> {
        let row = sqlx::query("SELECT * FROM experiment WHERE id = $1 AND space_id = $2")
            .bind(expt_id.0)
            .bind(space_id.0)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| ExptError::Store(format!("experiment {expt_id} not found")))?;
        experiment_from_row(&row)
    }

    async fn update_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        status: ExptStatus,
        message: Option<String>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE experiment
            SET status = $3,
                status_message = COALESCE($4, status_message),
                updated_at = now()
            WHERE id = $1 AND space_id = $2
            "#,
        )
        .bind(expt_id.0)
        .bind(space_id.0)
        .bind(expt_status_code(status))
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresStores {
    async fn create_nx(&self, run: &ExptRun) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO expt_run (id, expt_id, space_id, mode, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (expt_id, id) DO NOTHING
            "#,
        )
        .bind(run.id.0)
        .bind(run.expt_id.0)
        .bind(run.space_id.0)
        .bind(run.mode.as_u8() as i16)
        .bind(run.status.as_i32() as i16)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, expt_id: ExptId, run_id: RunId) -> Result<Option<ExptRun>> {
        let row = sqlx::query("SELECT * FROM expt_run WHERE expt_id = $1 AND id = $2")
            .bind(expt_id.0)
            .bind(run_id.0)
            .fetch_optional(self.pool())
            .await?;
        row.map(|row| {
            Ok(ExptRun {
                id: RunId(row.try_get("id")?),
                expt_id: ExptId(row.try_get("expt_id")?),
                space_id: SpaceId(row.try_get("space_id")?),
                mode: EvalMode::try_from(row.try_get::<i16, _>("mode")? as u8)
                    .map_err(store_err)?,
                status: RunStatus::from_i32(row.try_get::<i16, _>("status")? as i32)
                    .map_err(store_err)?,
                created_at: row.try_get("created_at")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    async fn update_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: RunStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE expt_run SET status = $3, updated_at = now() WHERE expt_id = $1 AND id = $2",
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(status.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ItemResultStore for PostgresStores {
    async fn batch_create_nx(&self, rows: &[ExptItemResult]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO expt_item_result (
                    id, expt_id, item_id, item_idx, status, result_state,
                    err_msg, expt_run_id, created_at, updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                ON CONFLICT (expt_id, item_id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.expt_id.0)
            .bind(row.item_id.0)
            .bind(row.item_idx)
            .bind(row.status.as_i32() as i16)
            .bind(row.result_state.as_i32() as i16)
            .bind(&row.err_msg)
            .bind(row.expt_run_id.map(|r| r.0))
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResult>> {
        let row = sqlx::query(
            "SELECT * FROM expt_item_result WHERE expt_id = $1 AND item_id = $2",
        )
        .bind(expt_id.0)
        .bind(item_id.0)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn list(&self, expt_id: ExptId) -> Result<Vec<ExptItemResult>> {
        let rows = sqlx::query(
            "SELECT * FROM expt_item_result WHERE expt_id = $1 ORDER BY id",
        )
        .bind(expt_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn update_status(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: ItemRunState,
        run_id: Option<RunId>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_item_result
            SET status = $3,
                expt_run_id = COALESCE($4, expt_run_id),
                updated_at = now()
            WHERE expt_id = $1 AND item_id = ANY($2)
            "#,
        )
        .bind(expt_id.0)
        .bind(ids(item_ids))
        .bind(status.as_i32() as i16)
        .bind(run_id.map(|r| r.0))
        .execute(self.pool())
        .await?;
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
        sqlx::query(
            r#"
            UPDATE expt_item_result
            SET status = $3, err_msg = $4, result_state = $5, updated_at = now()
            WHERE expt_id = $1 AND item_id = $2
            "#,
        )
        .bind(expt_id.0)
        .bind(item_id.0)
        .bind(status.as_i32() as i16)
        .bind(err_msg)
        .bind(result_state.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptItemResultRunLog],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO expt_item_result_run_log (
                    id, expt_id, run_id, item_id, status, result_state,
                    err_msg, log_id, created_at, updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
                ON CONFLICT (expt_id, run_id, item_id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.expt_id.0)
            .bind(row.run_id.0)
            .bind(row.item_id.0)
            .bind(row.status.as_i32() as i16)
            .bind(row.result_state.as_i32() as i16)
            .bind(&row.err_msg)
            .bind(&row.log_id)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Option<ExptItemResultRunLog>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM expt_item_result_run_log
            WHERE expt_id = $1 AND run_id = $2 AND item_id = $3
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(item_id.0)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(item_log_from_row).transpose()
    }

    async fn scan_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        status: ItemRunState,
        limit: Option<usize>,
    ) -> Result<Vec<ExptItemResultRunLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM expt_item_result_run_log
            WHERE expt_id = $1 AND run_id = $2 AND status = $3
            ORDER BY id
            LIMIT $4
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(status.as_i32() as i16)
        .bind(limit.map(|l| l as i64).unwrap_or(i64::MAX))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(item_log_from_row).collect()
    }

    async fn logged_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
    ) -> Result<Vec<ExptItemResultRunLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM expt_item_result_run_log
            WHERE expt_id = $1 AND run_id = $2 AND result_state = $3
            ORDER BY id
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(ResultState::Logged.as_i32() as i16)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(item_log_from_row).collect()
    }

    async fn update_run_log_status(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_ids: &[ItemId],
        status: ItemRunState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_item_result_run_log
            SET status = $4, updated_at = now()
            WHERE expt_id = $1 AND run_id = $2 AND item_id = ANY($3)
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(ids(item_ids))
        .bind(status.as_i32() as i16)
        .execute(self.pool())
        .await?;
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
        sqlx::query(
            r#"
            UPDATE expt_item_result_run_log
            SET status = $4, err_msg = $5, result_state = $6, updated_at = now()
            WHERE expt_id = $1 AND run_id = $2 AND item_id = $3
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(item_id.0)
        .bind(status.as_i32() as i16)
        .bind(err_msg)
        .bind(result_state.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TurnResultStore for PostgresStores {
    async fn batch_create_nx(&self, rows: &[ExptTurnResult]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO expt_turn_result (
                    id, expt_id, item_id, turn_id, turn_idx, status,
                    created_at, updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
                ON CONFLICT (expt_id, item_id, turn_id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.expt_id.0)
            .bind(row.item_id.0)
            .bind(row.turn_id.0)
            .bind(row.turn_idx)
            .bind(row.status.as_i32() as i16)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResult>> {
        let rows = sqlx::query(
            "SELECT * FROM expt_turn_result WHERE expt_id = $1 AND item_id = $2 ORDER BY id",
        )
        .bind(expt_id.0)
        .bind(item_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    async fn count_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM expt_turn_result WHERE expt_id = $1 AND item_id = ANY($2)",
        )
        .bind(expt_id.0)
        .bind(ids(item_ids))
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("cnt")?)
    }

    async fn update_status_by_items(
        &self,
        expt_id: ExptId,
        item_ids: &[ItemId],
        status: TurnRunState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_turn_result SET status = $3, updated_at = now()
            WHERE expt_id = $1 AND item_id = ANY($2)
            "#,
        )
        .bind(expt_id.0)
        .bind(ids(item_ids))
        .bind(status.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_status_by_ids(
        &self,
        expt_id: ExptId,
        turn_ids: &[TurnId],
        status: TurnRunState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_turn_result SET status = $3, updated_at = now()
            WHERE expt_id = $1 AND turn_id = ANY($2)
            "#,
        )
        .bind(expt_id.0)
        .bind(turn_ids.iter().map(|t| t.0).collect::<Vec<i64>>())
        .bind(status.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        status: TurnRunState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_turn_result SET status = $4, updated_at = now()
            WHERE expt_id = $1 AND item_id = $2 AND turn_id = $3
            "#,
        )
        .bind(expt_id.0)
        .bind(item_id.0)
        .bind(turn_id.0)
        .bind(status.as_i32() as i16)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn scan_by_status(
        &self,
        expt_id: ExptId,
        statuses: &[TurnRunState],
        cursor: i64,
        limit: usize,
    ) -> Result<(Vec<ExptTurnResult>, Option<i64>)> {
        let codes: Vec<i16> = statuses.iter().map(|s| s.as_i32() as i16).collect();
        let rows = sqlx::query(
            r#"
            SELECT * FROM expt_turn_result
            WHERE expt_id = $1 AND status = ANY($2) AND id > $3
            ORDER BY id
            LIMIT $4
            "#,
        )
        .bind(expt_id.0)
        .bind(codes)
        .bind(cursor)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;
        let batch: Vec<ExptTurnResult> =
            rows.iter().map(turn_from_row).collect::<Result<_>>()?;
        let next = (batch.len() == limit)
            .then(|| batch.last().map(|r| r.id))
            .flatten();
        Ok((batch, next))
    }

    async fn batch_create_run_logs_nx(
        &self,
        rows: &[ExptTurnResultRunLog],
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO expt_turn_result_run_log (
                    id, expt_id, run_id, item_id, turn_id, status,
                    target_result_id, evaluator_result_ids, err_msg, log_id,
                    created_at, updated_at
                )
                VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
                ON CONFLICT (expt_id, run_id, item_id, turn_id) DO NOTHING
                "#,
            )
            .bind(row.id)
            .bind(row.expt_id.0)
            .bind(row.run_id.0)
            .bind(row.item_id.0)
            .bind(row.turn_id.0)
            .bind(row.status.as_i32() as i16)
            .bind(row.target_result_id)
            .bind(serde_json::to_value(&row.evaluator_result_ids)?)
            .bind(&row.err_msg)
            .bind(&row.log_id)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_run_logs(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM expt_turn_result_run_log
            WHERE expt_id = $1 AND run_id = $2 AND item_id = $3
            ORDER BY id
            "#,
        )
        .bind(expt_id.0)
        .bind(run_id.0)
        .bind(item_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(turn_log_from_row).collect()
    }

    async fn latest_run_logs_by_item(
        &self,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Result<Vec<ExptTurnResultRunLog>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (turn_id) *
            FROM expt_turn_result_run_log
            WHERE expt_id = $1 AND item_id = $2
            ORDER BY turn_id, created_at DESC, id DESC
            "#,
        )
        .bind(expt_id.0)
        .bind(item_id.0)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(turn_log_from_row).collect()
    }

    async fn save_run_log(&self, log: &ExptTurnResultRunLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO expt_turn_result_run_log (
                id, expt_id, run_id, item_id, turn_id, status,
                target_result_id, evaluator_result_ids, err_msg, log_id,
                created_at, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11, now())
            ON CONFLICT (expt_id, run_id, item_id, turn_id) DO UPDATE SET
                status = EXCLUDED.status,
                target_result_id = EXCLUDED.target_result_id,
                evaluator_result_ids = EXCLUDED.evaluator_result_ids,
                err_msg = EXCLUDED.err_msg,
                updated_at = now()
            "#,
        )
        .bind(log.id)
        .bind(log.expt_id.0)
        .bind(log.run_id.0)
        .bind(log.item_id.0)
        .bind(log.turn_id.0)
        .bind(log.status.as_i32() as i16)
        .bind(log.target_result_id)
        .bind(serde_json::to_value(&log.evaluator_result_ids)?)
        .bind(&log.err_msg)
        .bind(&log.log_id)
        .bind(log.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StatsStore for PostgresStores {
    async fn create_nx(&self, stats: &ExptStats) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO expt_stats (
                expt_id, space_id, pending_turn_cnt, queueing_turn_cnt,
                processing_turn_cnt, success_turn_cnt, fail_turn_cnt,
                terminated_turn_cnt, updated_at
            )
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            ON CONFLICT (expt_id) DO NOTHING
            "#,
        )
        .bind(stats.expt_id.0)
        .bind(stats.space_id.0)
        .bind(stats.pending_turn_cnt)
        .bind(stats.queueing_turn_cnt)
        .bind(stats.processing_turn_cnt)
        .bind(stats.success_turn_cnt)
        .bind(stats.fail_turn_cnt)
        .bind(stats.terminated_turn_cnt)
        .bind(stats.updated_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get(&self, expt_id: ExptId) -> Result<Option<ExptStats>> {
        let row = sqlx::query("SELECT * FROM expt_stats WHERE expt_id = $1")
            .bind(expt_id.0)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(stats_from_row).transpose()
    }

    async fn set_pending(&self, expt_id: ExptId, pending: i64) -> Result<()> {
        sqlx::query(
            "UPDATE expt_stats SET pending_turn_cnt = $2, updated_at = now() WHERE expt_id = $1",
        )
        .bind(expt_id.0)
        .bind(pending)
        .execute(self.pool())
        .await?;
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
        sqlx::query(
            r#"
            UPDATE expt_stats SET
                pending_turn_cnt = pending_turn_cnt + $2,
                queueing_turn_cnt = queueing_turn_cnt + $3,
                processing_turn_cnt = processing_turn_cnt + $4,
                success_turn_cnt = success_turn_cnt + $5,
                fail_turn_cnt = fail_turn_cnt + $6,
                terminated_turn_cnt = terminated_turn_cnt + $7,
                updated_at = now()
            WHERE expt_id = $1
            "#,
        )
        .bind(expt_id.0)
        .bind(delta.pending)
        .bind(delta.queueing)
        .bind(delta.processing)
        .bind(delta.success)
        .bind(delta.fail)
        .bind(delta.terminated)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn fold_into_pending(&self, expt_id: ExptId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE expt_stats SET
                pending_turn_cnt = pending_turn_cnt + fail_turn_cnt
                    + terminated_turn_cnt + processing_turn_cnt,
                fail_turn_cnt = 0,
                terminated_turn_cnt = 0,
                processing_turn_cnt = 0,
                updated_at = now()
            WHERE expt_id = $1
            "#,
        )
        .bind(expt_id.0)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
