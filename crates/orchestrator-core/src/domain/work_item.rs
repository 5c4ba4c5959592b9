use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A durable queue row representing one pending execution of a task.
///
/// `id` is monotone (insertion order) so ties in `(run_at, priority)`
/// ordering resolve deterministically (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub id: i64,
    pub task_id: Uuid,
    pub run_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// Whether the item is eligible for leasing at `now`, per the
    /// eligibility predicate in SPEC_FULL.md §4.1.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
            && match self.locked_until {
                Some(until) => until < now,
                None => true,
            }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn item(run_at: DateTime<Utc>, locked_until: Option<DateTime<Utc>>) -> WorkItem {
        WorkItem {
            id: 1,
            task_id: Uuid::now_v7(),
            run_at,
            locked_until,
            locked_by: locked_until.map(|_| "worker-1".to_string()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn not_yet_due_is_ineligible() {
        let now = Utc::now();
        let item = item(now + Duration::seconds(10), None);
        assert!(!item.is_eligible(now));
    }

    #[test]
    fn due_and_unlocked_is_eligible() {
        let now = Utc::now();
        let item = item(now - Duration::seconds(1), None);
        assert!(item.is_eligible(now));
    }

    #[test]
    fn locked_in_future_is_ineligible() {
        let now = Utc::now();
        let item = item(now - Duration::seconds(5), Some(now + Duration::seconds(30)));
        assert!(!item.is_eligible(now));
    }

    #[test]
    fn expired_lock_is_eligible_again() {
        let now = Utc::now();
        let item = item(now - Duration::seconds(5), Some(now - Duration::seconds(1)));
        assert!(item.is_eligible(now));
    }
}
