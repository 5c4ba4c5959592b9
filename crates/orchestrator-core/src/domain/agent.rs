use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// The caller who owns one or more tasks.
///
/// Agents are created by an administrator and are never mutated
/// destructively; disabling an agent is a soft operation left to the
/// external API collaborator (see SPEC_FULL.md §1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Agent {
    pub id: Uuid,
    pub name: String,
    pub scopes: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, scopes: BTreeSet<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            scopes,
            created_at: Utc::now(),
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_agent_has_no_scopes_by_default() {
        let agent = Agent::new("ops", BTreeSet::new());
        assert!(!agent.has_scope("admin"));
    }

    #[test]
    fn has_scope_checks_membership() {
        let mut scopes = BTreeSet::new();
        scopes.insert("tasks:write".to_string());
        let agent = Agent::new("ops", scopes);
        assert!(agent.has_scope("tasks:write"));
        assert!(!agent.has_scope("tasks:read"));
    }
}
