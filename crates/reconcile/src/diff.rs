//! Action computation and dry-run plans

use crate::lifecycle::Action;
use serde::Serialize;
use statekit::{ResourceStatus, StateRecord, Value};
use std::fmt;

/// Decide what to do with a declared resource given its stored record
///
/// `declared` must already have its bindings resolved. A record left behind
/// by an interrupted or failed attempt is retried: as a create if no create
/// ever completed, otherwise as an update.
pub fn compute_action(
    declared: &Value,
    record: Option<&StateRecord>,
    force: bool,
    adopt: bool,
) -> Action {
    let create = if adopt { Action::Adopt } else { Action::Create };
    let Some(record) = record else {
        return create;
    };

    match record.status {
        ResourceStatus::Pending
        | ResourceStatus::Creating
        | ResourceStatus::Updating
        | ResourceStatus::Deleting
        | ResourceStatus::Fail => {
            if record.has_been_created() {
                Action::Update
            } else {
                create
            }
        }
        ResourceStatus::Created
        | ResourceStatus::Updated
        | ResourceStatus::Deleted
        | ResourceStatus::Success => {
            if force || record.props != *declared {
                Action::Update
            } else {
                Action::Noop
            }
        }
    }
}

/// The would-be action for one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanEntry {
    pub fqn: String,
    pub kind: String,
    pub action: Action,
    /// Props depend on an upstream output that only exists after apply
    pub known_after_apply: bool,
}

/// Result of a dry run: declared resources in declaration order, then orphans
#[derive(Debug, Clone, Default, Serialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn get(&self, fqn: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.fqn == fqn)
    }

    /// Entries whose action invokes a handler
    pub fn changes(&self) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(|e| e.action.is_mutation())
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary::from_entries(&self.entries)
    }
}

/// Plan summary statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Number of resources to create (including adoptions)
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub noops: usize,
}

impl PlanSummary {
    pub fn from_entries(entries: &[PlanEntry]) -> Self {
        let mut summary = Self::default();
        for entry in entries {
            match entry.action {
                Action::Create | Action::Adopt => summary.creates += 1,
                Action::Update => summary.updates += 1,
                Action::Delete => summary.deletes += 1,
                Action::Noop => summary.noops += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.creates, self.updates, self.deletes, self.noops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: ResourceStatus, seq: u64, name: &str) -> StateRecord {
        let mut record = StateRecord::new("app/dev/a", "bucket", "a");
        record.status = status;
        record.seq = seq;
        record.props = Value::map([("name", name)]);
        record
    }

    fn props(name: &str) -> Value {
        Value::map([("name", name)])
    }

    #[test]
    fn test_basic_actions() {
        assert_eq!(compute_action(&props("b1"), None, false, false), Action::Create);
        assert_eq!(compute_action(&props("b1"), None, false, true), Action::Adopt);

        let stored = record(ResourceStatus::Created, 1, "b1");
        assert_eq!(compute_action(&props("b1"), Some(&stored), false, false), Action::Noop);
        assert_eq!(compute_action(&props("b2"), Some(&stored), false, false), Action::Update);
        assert_eq!(compute_action(&props("b1"), Some(&stored), true, false), Action::Update);
    }

    #[test]
    fn test_recovery_actions() {
        let never_created = record(ResourceStatus::Creating, 0, "b1");
        assert_eq!(
            compute_action(&props("b1"), Some(&never_created), false, false),
            Action::Create
        );
        assert_eq!(
            compute_action(&props("b1"), Some(&never_created), false, true),
            Action::Adopt
        );

        for status in [ResourceStatus::Fail, ResourceStatus::Updating, ResourceStatus::Pending] {
            let interrupted = record(status, 3, "b1");
            assert_eq!(
                compute_action(&props("b1"), Some(&interrupted), false, false),
                Action::Update,
                "{status}"
            );
        }
    }

    #[test]
    fn test_plan_summary() {
        let entry = |fqn: &str, action| PlanEntry {
            fqn: fqn.into(),
            kind: "bucket".into(),
            action,
            known_after_apply: false,
        };
        let plan = Plan {
            entries: vec![
                entry("a", Action::Create),
                entry("b", Action::Adopt),
                entry("c", Action::Noop),
                entry("d", Action::Delete),
            ],
        };
        let summary = plan.summary();
        assert_eq!(summary.creates, 2);
        assert_eq!(summary.total(), 3);
        assert!(summary.has_changes());
        assert_eq!(plan.changes().count(), 3);
        assert_eq!(
            summary.to_string(),
            "2 to create, 0 to update, 1 to delete, 1 unchanged"
        );
    }
}
