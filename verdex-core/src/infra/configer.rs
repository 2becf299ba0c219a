//! Config access and error-message sanitization.
//!
//! Config is pulled through [`Configer`] per call and must not be memoized
//! beyond a single cycle; the loops re-fetch it every tick so operators can
//! change pacing and retry policy without a restart.

use std::sync::Arc;

use crate::config::{ErrConvertConf, ErrRetryConf, ExptExecConf};
use crate::error::ExptError;
use verdex_model::SpaceId;

pub trait Configer: Send + Sync {
    fn expt_exec_conf(&self, space_id: SpaceId) -> ExptExecConf;
    fn err_retry_conf(&self, space_id: SpaceId, err: &ExptError) -> ErrRetryConf;
    fn err_ctrl(&self) -> ErrCtrl;
}

/// Operator-configured redaction and truncation of user-visible error
/// messages.
#[derive(Clone, Debug)]
pub struct ErrCtrl {
    max_chars: usize,
    patterns: Arc<Vec<regex::Regex>>,
}

impl Default for ErrCtrl {
    fn default() -> Self {
        Self::from_conf(&ErrConvertConf::default())
    }
}

impl ErrCtrl {
    pub fn from_conf(conf: &ErrConvertConf) -> Self {
        let patterns = conf
            .redact_patterns
            .iter()
            .filter_map(|p| match regex::Regex::new(p) {
                Ok(re) => Some(re),
                Err(err) => {
                    tracing::warn!(pattern = %p, %err, "skipping invalid redact pattern");
                    None
                }
            })
            .collect();
        Self {
            max_chars: conf.max_chars,
            patterns: Arc::new(patterns),
        }
    }

    /// Redact, then truncate on a char boundary.
    pub fn convert_err_msg(&self, msg: &str) -> String {
        let mut out = msg.to_string();
        for re in self.patterns.iter() {
            out = re.replace_all(&out, "[redacted]").into_owned();
        }
        if out.chars().count() > self.max_chars {
            out = out.chars().take(self.max_chars).collect();
        }
        out
    }
}

/// Serves one fixed configuration for every space. The production daemon
/// builds it from the loaded config file; tests tweak the fields directly.
#[derive(Clone, Debug)]
pub struct StaticConfiger {
    pub exec: ExptExecConf,
    pub retry: ErrRetryConf,
    pub err_convert: ErrConvertConf,
}

impl Default for StaticConfiger {
    fn default() -> Self {
        Self {
            exec: ExptExecConf::default(),
            retry: ErrRetryConf::default(),
            err_convert: ErrConvertConf::default(),
        }
    }
}

impl StaticConfiger {
    pub fn new(exec: ExptExecConf) -> Self {
        Self {
            exec,
            ..Self::default()
        }
    }
}

impl Configer for StaticConfiger {
    fn expt_exec_conf(&self, _space_id: SpaceId) -> ExptExecConf {
        self.exec.clone()
    }

    fn err_retry_conf(&self, _space_id: SpaceId, err: &ExptError) -> ErrRetryConf {
        let mut conf = self.retry;
        // Benefit exhaustion is in-debt regardless of the policy table.
        if matches!(err, ExptError::InDebt(_)) {
            conf.is_in_debt = true;
        }
        conf
    }

    fn err_ctrl(&self) -> ErrCtrl {
        ErrCtrl::from_conf(&self.err_convert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_redacts_then_truncates() {
        let ctrl = ErrCtrl::from_conf(&ErrConvertConf {
            max_chars: 24,
            redact_patterns: vec![r"token=\S+".to_string()],
        });
        let msg = ctrl.convert_err_msg("call failed token=abc123 on host db-7 with more detail");
        assert!(msg.contains("[redacted]"));
        assert!(!msg.contains("abc123"));
        assert!(msg.chars().count() <= 24);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let ctrl = ErrCtrl::from_conf(&ErrConvertConf {
            max_chars: 4,
            redact_patterns: vec![],
        });
        assert_eq!(ctrl.convert_err_msg("héllo wörld"), "héll");
    }

    #[test]
    fn in_debt_errors_force_the_flag() {
        let configer = StaticConfiger::default();
        let conf = configer
            .err_retry_conf(SpaceId(7), &ExptError::InDebt("quota".into()));
        assert!(conf.is_in_debt);
        let conf = configer
            .err_retry_conf(SpaceId(7), &ExptError::internal("boom"));
        assert!(!conf.is_in_debt);
    }
}
