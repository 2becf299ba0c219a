//! Evaluation-set items as seen from a pinned set version.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ItemId, TurnId};

/// One named field of a turn (input text, reference output, span id, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldData {
    pub name: String,
    pub content: String,
}

/// One conversational round of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub field_data: Vec<FieldData>,
}

impl Turn {
    /// Content of the named field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.field_data
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.content.as_str())
    }
}

/// One row of the evaluation set, with its ordered turns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSetItem {
    pub id: ItemId,
    pub item_idx: i32,
    pub turns: Vec<Turn>,
    pub created_at: DateTime<Utc>,
}

impl EvaluationSetItem {
    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_lookup_by_name() {
        let turn = Turn {
            id: TurnId(201),
            field_data: vec![
                FieldData {
                    name: "input".into(),
                    content: "hello".into(),
                },
                FieldData {
                    name: "span_id".into(),
                    content: "s-1".into(),
                },
            ],
        };
        assert_eq!(turn.field("input"), Some("hello"));
        assert_eq!(turn.field("span_id"), Some("s-1"));
        assert_eq!(turn.field("missing"), None);
    }
}
