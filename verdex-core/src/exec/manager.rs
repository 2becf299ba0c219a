//! Lifecycle operations shared by the loops and the external entry point.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::EngineDeps;
use crate::error::Result;
use crate::infra::{Configer, ExptPublisher, IdempotencyService};
use crate::store::Stores;
use verdex_model::{
    EvalMode, Experiment, ExptId, ExptRun, ExptStatus, RunId, RunStatus,
    ScheduleEvent, Session, SpaceId,
};

/// Options for [`ExptManager::complete_expt`]. A `cid` makes the call
/// idempotent; without an explicit `status` the final status is computed
/// from the stats counters.
#[derive(Debug, Clone, Default)]
pub struct CompleteOpts {
    pub cid: Option<String>,
    pub status: Option<ExptStatus>,
    pub status_message: Option<String>,
}

impl CompleteOpts {
    pub fn with_cid(cid: impl Into<String>) -> Self {
        Self {
            cid: Some(cid.into()),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: ExptStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }
}

/// Lifecycle manager. Injected into both loops as an `Arc`; never global.
pub struct ExptManager {
    stores: Stores,
    publisher: Arc<dyn ExptPublisher>,
    idempotency: Arc<dyn IdempotencyService>,
    configer: Arc<dyn Configer>,
}

impl std::fmt::Debug for ExptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExptManager").finish()
    }
}

impl ExptManager {
    pub fn new(deps: &EngineDeps) -> Arc<Self> {
        Arc::new(Self {
            stores: deps.stores.clone(),
            publisher: deps.publisher.clone(),
            idempotency: deps.idempotency.clone(),
            configer: deps.configer.clone(),
        })
    }

    /// External entry point: create the run row (create-if-absent) and
    /// publish the initial schedule event. Replays are harmless.
    pub async fn run(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        space_id: SpaceId,
        session: Session,
        mode: EvalMode,
    ) -> Result<()> {
        let now = Utc::now();
        let created = self
            .stores
            .runs
            .create_nx(&ExptRun {
                id: run_id,
                expt_id,
                space_id,
                mode,
                status: RunStatus::Running,
                created_at: now,
                updated_at: now,
            })
            .await?;
        if !created {
            info!(%expt_id, %run_id, "run row already exists, republishing schedule");
        }
        self.publisher
            .publish_schedule(
                ScheduleEvent {
                    expt_id,
                    run_id,
                    space_id,
                    mode,
                    session,
                    created_at: now.timestamp(),
                    ext: HashMap::new(),
                },
                None,
            )
            .await
    }

    pub async fn get_detail(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> Result<Experiment> {
        self.stores.experiments.get(space_id, expt_id).await
    }

    pub async fn get_run_log(
        &self,
        expt_id: ExptId,
        run_id: RunId,
    ) -> Result<Option<ExptRun>> {
        self.stores.runs.get(expt_id, run_id).await
    }

    /// Mark the run Completed. With a `cid`, replays are no-ops.
    pub async fn complete_run(
        &self,
        expt_id: ExptId,
        run_id: RunId,
        space_id: SpaceId,
        cid: Option<&str>,
    ) -> Result<()> {
        if let Some(cid) = cid {
            let key = format!("{cid}:run");
            if self.idempotency.exist(&key).await? {
                return Ok(());
            }
            self.mark(space_id, &key).await?;
        }
        self.stores
            .runs
            .update_status(expt_id, run_id, RunStatus::Completed)
            .await
    }

    /// Finish the experiment. Finished experiments are left untouched;
    /// without an explicit status the outcome is derived from the stats
    /// counters (any failed or terminated turn fails the experiment).
    pub async fn complete_expt(
        &self,
        expt_id: ExptId,
        space_id: SpaceId,
        opts: CompleteOpts,
    ) -> Result<()> {
        if let Some(cid) = &opts.cid {
            let key = format!("{cid}:expt");
            if self.idempotency.exist(&key).await? {
                return Ok(());
            }
            self.mark(space_id, &key).await?;
        }

        let expt = self.stores.experiments.get(space_id, expt_id).await?;
        if expt.is_finished() {
            info!(%expt_id, status = ?expt.status, "experiment already finished");
            return Ok(());
        }

        let status = match opts.status {
            Some(status) => status,
            None => {
                let stats = self.stores.stats.get(expt_id).await?;
                match stats {
                    Some(s) if s.fail_turn_cnt > 0 || s.terminated_turn_cnt > 0 => {
                        ExptStatus::Failed
                    }
                    Some(_) => ExptStatus::Success,
                    None => {
                        warn!(%expt_id, "completing experiment without stats");
                        ExptStatus::Success
                    }
                }
            }
        };
        let message = opts
            .status_message
            .map(|m| self.configer.err_ctrl().convert_err_msg(&m));
        info!(%expt_id, ?status, "completing experiment");
        self.stores
            .experiments
            .update_status(space_id, expt_id, status, message)
            .await
    }

    /// Park an Append run while it has no work.
    pub async fn pend_run(&self, expt_id: ExptId, run_id: RunId) -> Result<()> {
        self.stores
            .runs
            .update_status(expt_id, run_id, RunStatus::Pended)
            .await
    }

    pub async fn pend_expt(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> Result<()> {
        self.stores
            .experiments
            .update_status(space_id, expt_id, ExptStatus::Pending, None)
            .await
    }

    async fn mark(&self, space_id: SpaceId, key: &str) -> Result<()> {
        let ttl = self.configer.expt_exec_conf(space_id).marker_ttl();
        self.idempotency.set(key, ttl).await
    }
}
