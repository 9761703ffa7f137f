//! Core types for runs: modes, phases, options and reports

use crate::error::ApplyError;
use crate::executor::CancelToken;
use crate::lifecycle::Action;
use serde::{Deserialize, Serialize};
use statekit::ResourceStatus;
use std::fmt;
use std::str::FromStr;

/// Deployment mode of a scope
///
/// The mode is handed to provider handlers; it does not change how state is
/// persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Real resources on the target platform
    #[default]
    Live,
    /// Locally emulated resources
    Local,
    /// Local where an emulator exists, live otherwise
    Hybrid,
}

/// What a run does with the declared scope tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Create, update and prune to match the declaration
    #[default]
    Up,
    /// Delete everything recorded under the app and stage
    Destroy,
    /// Load stored outputs without invoking handlers
    Read,
}

macro_rules! impl_str_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($ty), " '{}' (expected one of: ", $($name, " "),+, ")"),
                        other
                    )),
                }
            }
        }
    };
}

impl_str_enum!(Mode { Live => "live", Local => "local", Hybrid => "hybrid" });
impl_str_enum!(Phase { Up => "up", Destroy => "destroy", Read => "read" });
impl_str_enum!(FailurePolicy {
    HaltDependents => "halt-dependents",
    HaltAll => "halt-all",
});

/// What to do with the rest of the graph after a resource fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Skip dependents of the failed resource, continue independent branches
    #[default]
    HaltDependents,
    /// Start nothing new after the first failure
    HaltAll,
}

/// Options for apply and destroy runs
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of handlers in flight
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    /// Update every existing resource even when its props are unchanged
    pub force: bool,
    /// Stops new work from starting; in-flight handlers complete
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            failure_policy: FailurePolicy::default(),
            force: false,
            cancel: CancelToken::new(),
        }
    }
}

/// Result of processing one resource in a run
#[derive(Debug)]
pub struct Outcome {
    pub fqn: String,
    pub kind: String,
    /// Action computed for the resource; `None` if it was never reached
    pub action: Option<Action>,
    pub status: ResourceStatus,
    /// Revision after the run
    pub seq: u64,
    pub message: Option<String>,
    pub error: Option<ApplyError>,
}

impl Outcome {
    pub fn is_failed(&self) -> bool {
        self.error.as_ref().is_some_and(|e| !e.is_skip())
    }

    pub fn is_skipped(&self) -> bool {
        self.error.as_ref().is_some_and(ApplyError::is_skip)
    }
}

/// Per-resource outcomes of a run, in processing order
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub outcomes: Vec<Outcome>,
}

impl ApplyReport {
    pub fn get(&self, fqn: &str) -> Option<&Outcome> {
        self.outcomes.iter().find(|o| o.fqn == fqn)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.is_skipped())
    }

    /// Check if every resource reached its desired state
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.error.is_none())
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for outcome in &self.outcomes {
            summary.add_outcome(outcome);
        }
        summary
    }
}

/// Counts of what a run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.unchanged + self.failed + self.skipped
    }

    /// Check if the run was fully successful (no failures, nothing skipped)
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.skipped == 0
    }

    /// Add one outcome to the counts
    pub fn add_outcome(&mut self, outcome: &Outcome) {
        if outcome.is_failed() {
            self.failed += 1;
            return;
        }
        if outcome.is_skipped() {
            self.skipped += 1;
            return;
        }
        match outcome.status {
            ResourceStatus::Created => self.created += 1,
            ResourceStatus::Updated => self.updated += 1,
            ResourceStatus::Deleted => self.deleted += 1,
            _ => self.unchanged += 1,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} deleted, {} unchanged",
            self.created, self.updated, self.deleted, self.unchanged
        )?;
        if self.failed > 0 {
            write!(f, ", {} failed", self.failed)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: ResourceStatus, error: Option<ApplyError>) -> Outcome {
        Outcome {
            fqn: "app/dev/x".into(),
            kind: "bucket".into(),
            action: None,
            status,
            seq: 0,
            message: None,
            error,
        }
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("LOCAL".parse::<Mode>().unwrap(), Mode::Local);
        assert_eq!("destroy".parse::<Phase>().unwrap(), Phase::Destroy);
        assert_eq!(
            "halt-all".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::HaltAll
        );
        let err = "sideways".parse::<Phase>().unwrap_err();
        assert!(err.contains("sideways"));
        assert!(err.contains("destroy"));
    }

    #[test]
    fn test_default_options() {
        let opts = ApplyOptions::default();
        assert_eq!(opts.concurrency, 4);
        assert_eq!(opts.failure_policy, FailurePolicy::HaltDependents);
        assert!(!opts.force);
    }

    #[test]
    fn test_summary_counts() {
        let report = ApplyReport {
            outcomes: vec![
                outcome(ResourceStatus::Created, None),
                outcome(ResourceStatus::Success, None),
                outcome(ResourceStatus::Fail, Some(ApplyError::Handler("boom".into()))),
                outcome(
                    ResourceStatus::Pending,
                    Some(ApplyError::DependencyFailure("app/dev/x".into())),
                ),
            ],
        };
        let summary = report.summary();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.total(), 4);
        assert!(!summary.is_success());
        assert_eq!(
            summary.to_string(),
            "1 created, 0 updated, 0 deleted, 1 unchanged, 1 failed, 1 skipped"
        );
    }
}
