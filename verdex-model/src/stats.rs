//! Aggregate turn counters per experiment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ExptId, SpaceId};

/// Aggregate counters for one experiment. Mutated only through
/// [`ExptStatsDelta`] arithmetic, never read-modify-write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExptStats {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub pending_turn_cnt: i64,
    pub queueing_turn_cnt: i64,
    pub processing_turn_cnt: i64,
    pub success_turn_cnt: i64,
    pub fail_turn_cnt: i64,
    pub terminated_turn_cnt: i64,
    pub updated_at: DateTime<Utc>,
}

impl ExptStats {
    pub fn zeroed(expt_id: ExptId, space_id: SpaceId) -> Self {
        Self {
            expt_id,
            space_id,
            pending_turn_cnt: 0,
            queueing_turn_cnt: 0,
            processing_turn_cnt: 0,
            success_turn_cnt: 0,
            fail_turn_cnt: 0,
            terminated_turn_cnt: 0,
            updated_at: Utc::now(),
        }
    }
}

/// One atomic arithmetic step applied to [`ExptStats`]; each field is added
/// to its counter in a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExptStatsDelta {
    pub pending: i64,
    pub queueing: i64,
    pub processing: i64,
    pub success: i64,
    pub fail: i64,
    pub terminated: i64,
}

impl ExptStatsDelta {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply_to(&self, stats: &mut ExptStats) {
        stats.pending_turn_cnt += self.pending;
        stats.queueing_turn_cnt += self.queueing;
        stats.processing_turn_cnt += self.processing;
        stats.success_turn_cnt += self.success;
        stats.fail_turn_cnt += self.fail;
        stats.terminated_turn_cnt += self.terminated;
    }
}
