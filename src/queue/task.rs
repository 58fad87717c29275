use std::collections::HashMap;

use crate::domain::types::UserId;

use super::QueueError;

/// Field carrying the author id as a decimal string.
pub const USER_ID_FIELD: &str = "user_id";

/// Recompute the feeds of every friend of `author_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarmTask {
    pub author_id: UserId,
}

impl WarmTask {
    pub fn new(author_id: UserId) -> Self {
        Self { author_id }
    }

    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        vec![(USER_ID_FIELD, self.author_id.to_string())]
    }
}

/// One delivered log entry. `id` is what gets acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

impl QueueEntry {
    pub fn task(&self) -> Result<WarmTask, QueueError> {
        let raw = self
            .fields
            .get(USER_ID_FIELD)
            .ok_or_else(|| QueueError::malformed(&self.id, "missing `user_id` field"))?;
        let author_id = raw
            .parse::<UserId>()
            .map_err(|err| QueueError::malformed(&self.id, format!("invalid `user_id` {raw:?}: {err}")))?;
        Ok(WarmTask { author_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> QueueEntry {
        QueueEntry {
            id: "1-0".to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn decodes_user_id_field() {
        let task = entry(&[("user_id", "31")]).task().expect("valid entry");
        assert_eq!(task.author_id, UserId::new(31));
    }

    #[test]
    fn rejects_missing_and_non_numeric_ids() {
        assert!(matches!(
            entry(&[]).task(),
            Err(QueueError::Malformed { .. })
        ));
        assert!(matches!(
            entry(&[("user_id", "abc")]).task(),
            Err(QueueError::Malformed { .. })
        ));
    }

    #[test]
    fn encodes_as_single_decimal_field() {
        let fields = WarmTask::new(UserId::new(12)).to_fields();
        assert_eq!(fields, vec![("user_id", "12".to_string())]);
    }
}
