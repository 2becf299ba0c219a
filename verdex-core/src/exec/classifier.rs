//! Retry / terminate / succeed policy.
//!
//! A pure function of `(space, error)` over the [`Configer`]: the policy
//! table decides how many republishes an item event gets, and whether an
//! error means the whole experiment must terminate.

use std::sync::Arc;

use crate::config::ErrRetryConf;
use crate::error::{ErrKind, ExptError};
use crate::infra::Configer;
use verdex_model::SpaceId;

#[derive(Clone)]
pub struct ErrorClassifier {
    configer: Arc<dyn Configer>,
}

impl std::fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorClassifier").finish()
    }
}

impl ErrorClassifier {
    pub fn new(configer: Arc<dyn Configer>) -> Self {
        Self { configer }
    }

    pub fn retry_conf(&self, space_id: SpaceId, err: &ExptError) -> ErrRetryConf {
        self.configer.err_retry_conf(space_id, err)
    }

    /// `(stable, code, kind)` — "stable" means the error has a known
    /// classification and the policy table applies to it.
    pub fn parse_status_error(err: &ExptError) -> (bool, i32, ErrKind) {
        (err.is_stable(), err.code(), err.kind())
    }

    /// Whether this attempt should be republished. Zombie and in-debt
    /// errors are fatal regardless of the attempt counter.
    pub fn eval_err_need_retry(
        &self,
        space_id: SpaceId,
        retry_times: u32,
        err: &ExptError,
    ) -> bool {
        let conf = self.retry_conf(space_id, err);
        if conf.is_in_debt || matches!(err, ExptError::Zombie { .. }) {
            return false;
        }
        retry_times < conf.retry_times
    }

    /// Whether this error must terminate the experiment.
    pub fn eval_err_need_terminate_expt(
        &self,
        space_id: SpaceId,
        err: &ExptError,
    ) -> bool {
        self.retry_conf(space_id, err).is_in_debt
    }
}
