//! Correlation log-ids threaded through run-logs and downstream RPCs.
//!
//! The item-scope id is `sourceID:exptID:runID:spaceID`; the turn-scope id
//! appends the turn. Both land in the `log_id` columns so a stuck item can
//! be traced back to the upstream task that created it.

use verdex_model::{ExptId, RunId, SpaceId, TurnId};

pub fn item_log_id(
    source_id: i64,
    expt_id: ExptId,
    run_id: RunId,
    space_id: SpaceId,
) -> String {
    format!("{source_id}:{expt_id}:{run_id}:{space_id}")
}

pub fn turn_log_id(
    source_id: i64,
    expt_id: ExptId,
    run_id: RunId,
    space_id: SpaceId,
    turn_id: TurnId,
) -> String {
    format!("{}:{turn_id}", item_log_id(source_id, expt_id, run_id, space_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_id_extends_the_item_id() {
        let item = item_log_id(42, ExptId(1), RunId(10), SpaceId(7));
        let turn = turn_log_id(42, ExptId(1), RunId(10), SpaceId(7), TurnId(201));
        assert_eq!(item, "42:1:10:7");
        assert_eq!(turn, "42:1:10:7:201");
    }
}
