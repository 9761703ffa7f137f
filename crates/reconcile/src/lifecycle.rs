//! Resource lifecycle state machine
//!
//! ```text
//! pending ─┬─> creating ─┬─> created
//!          │             └─> fail
//!          ├─> updating ─┬─> updated
//!          │             └─> fail
//!          ├─> deleting ─┬─> deleted
//!          │             └─> fail
//!          ├─> success            (no-op: already satisfied)
//!          └─> fail               (rejected before any handler ran)
//! ```
//!
//! Each run starts every resource at `pending`. `created`, `updated`,
//! `deleted` and `success` are terminal-success states, `fail` is
//! terminal-failure.

use crate::error::TransitionError;
use serde::{Deserialize, Serialize};
use statekit::ResourceStatus;
use std::fmt;

/// State machine queries on [`ResourceStatus`]
pub trait Lifecycle: Sized {
    fn is_terminal(&self) -> bool;

    fn is_in_progress(&self) -> bool;

    /// Terminal and not `fail`
    fn is_success(&self) -> bool;

    fn can_transition(&self, to: ResourceStatus) -> bool;

    /// Validate a transition, returning the new status
    fn transition(self, fqn: &str, to: ResourceStatus) -> Result<ResourceStatus, TransitionError>;
}

impl Lifecycle for ResourceStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Created | Self::Updated | Self::Deleted | Self::Success | Self::Fail
        )
    }

    fn is_in_progress(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }

    fn is_success(&self) -> bool {
        self.is_terminal() && *self != Self::Fail
    }

    fn can_transition(&self, to: ResourceStatus) -> bool {
        use ResourceStatus::{
            Created, Creating, Deleted, Deleting, Fail, Pending, Success, Updated, Updating,
        };
        matches!(
            (self, to),
            (Pending, Creating | Updating | Deleting | Success | Fail)
                | (Creating, Created | Fail)
                | (Updating, Updated | Fail)
                | (Deleting, Deleted | Fail)
        )
    }

    fn transition(self, fqn: &str, to: ResourceStatus) -> Result<ResourceStatus, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError {
                fqn: fqn.to_string(),
                from: self,
                to,
            })
        }
    }
}

/// What the orchestrator does with a resource in one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    /// Create, claiming an existing object if one is found
    Adopt,
    Update,
    Delete,
    /// Stored props already match; nothing to do
    Noop,
}

impl Action {
    /// Status while the handler runs; `None` for a no-op
    pub fn in_progress_status(&self) -> Option<ResourceStatus> {
        match self {
            Self::Create | Self::Adopt => Some(ResourceStatus::Creating),
            Self::Update => Some(ResourceStatus::Updating),
            Self::Delete => Some(ResourceStatus::Deleting),
            Self::Noop => None,
        }
    }

    /// Terminal status on success
    pub fn done_status(&self) -> ResourceStatus {
        match self {
            Self::Create | Self::Adopt => ResourceStatus::Created,
            Self::Update => ResourceStatus::Updated,
            Self::Delete => ResourceStatus::Deleted,
            Self::Noop => ResourceStatus::Success,
        }
    }

    /// Whether a handler is invoked
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Noop)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Adopt => "adopt",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ResourceStatus::*;

    const ALL: [ResourceStatus; 9] = [
        Pending, Creating, Created, Updating, Updated, Deleting, Deleted, Success, Fail,
    ];

    #[test]
    fn test_valid_paths() {
        for action in [Action::Create, Action::Adopt, Action::Update, Action::Delete] {
            let Some(in_progress) = action.in_progress_status() else {
                panic!("{action} should have an in-progress status");
            };
            let status = Pending.transition("x", in_progress).unwrap();
            assert!(status.is_in_progress());
            let done = status.transition("x", action.done_status()).unwrap();
            assert!(done.is_success());
            assert!(status.can_transition(Fail));
        }
        assert_eq!(Pending.transition("x", Success).unwrap(), Success);
    }

    #[test]
    fn test_terminal_states_do_not_move() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition(to), "{from} -> {to} must be rejected");
            }
        }
    }

    #[test]
    fn test_rejected_transition() {
        let err = Pending.transition("app/dev/a", Created).unwrap_err();
        assert_eq!(err.from, Pending);
        assert_eq!(err.to, Created);
        assert!(err.to_string().contains("app/dev/a"));
        assert!(Creating.transition("x", Updated).is_err());
        assert!(!Fail.is_success());
        assert!(Fail.is_terminal());
    }
}
