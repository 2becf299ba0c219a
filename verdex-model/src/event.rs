//! Wire-stable queue events.
//!
//! Field names are fixed; both event kinds are delivered at-least-once and
//! consumers are made idempotent by locks and create-if-absent inserts, so
//! re-serialization must never change the shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::ids::{ExptId, ItemId, RunId, SpaceId};
use crate::run::EvalMode;

/// Caller identity threaded through every downstream call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "userID", default)]
    pub user_id: String,
    #[serde(rename = "appID", default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<i32>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            app_id: None,
        }
    }
}

/// One scheduler tick for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    #[serde(rename = "exptID")]
    pub expt_id: ExptId,
    #[serde(rename = "runID")]
    pub run_id: RunId,
    #[serde(rename = "spaceID")]
    pub space_id: SpaceId,
    pub mode: EvalMode,
    #[serde(default)]
    pub session: Session,
    /// Unix seconds. Advanced each NextTick in Append mode only; zombie
    /// detection compares against it.
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(default)]
    pub ext: HashMap<String, String>,
}

impl ScheduleEvent {
    /// Seconds elapsed since the event was (last) stamped.
    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.created_at
    }

    /// Re-stamp `created_at` to `now` (Append NextTick).
    pub fn refreshed(mut self, now: DateTime<Utc>) -> Self {
        self.created_at = now.timestamp();
        self
    }
}

/// One unit of per-item work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemEvalEvent {
    #[serde(rename = "exptID")]
    pub expt_id: ExptId,
    #[serde(rename = "runID")]
    pub run_id: RunId,
    #[serde(rename = "spaceID")]
    pub space_id: SpaceId,
    pub mode: EvalMode,
    #[serde(rename = "evalSetItemID")]
    pub eval_set_item_id: ItemId,
    /// Unix seconds at publish time.
    #[serde(rename = "createAt")]
    pub create_at: i64,
    #[serde(rename = "retryTimes", default)]
    pub retry_times: u32,
    #[serde(default)]
    pub ext: HashMap<String, String>,
    #[serde(default)]
    pub session: Session,
}

impl ItemEvalEvent {
    /// Clone for a retry republish, with the attempt counter bumped.
    pub fn next_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_times += 1;
        next
    }
}
