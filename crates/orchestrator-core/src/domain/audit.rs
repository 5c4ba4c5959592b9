use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An append-only, write-only audit record.
///
/// Audit entries are never read back by the core itself; they exist for
/// operators and the external API collaborator (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_agent_id: Option<Uuid>,
    pub action: String,
    pub subject_id: Uuid,
    pub details: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor_agent_id: Option<Uuid>,
        action: impl Into<String>,
        subject_id: Uuid,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            actor_agent_id,
            action: action.into(),
            subject_id,
            details,
            at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_carries_given_fields() {
        let subject = Uuid::now_v7();
        let entry = AuditEntry::new(None, "task.run_now", subject, serde_json::json!({}));
        assert_eq!(entry.action, "task.run_now");
        assert_eq!(entry.subject_id, subject);
    }
}
