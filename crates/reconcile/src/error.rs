//! Error types for declaration, graph building and apply runs

use crate::types::ApplyReport;
use statekit::ResourceStatus;
use thiserror::Error;

/// Why a single resource did not reach its desired state
#[derive(Error, Debug)]
pub enum ApplyError {
    /// Identity collision with an existing object and `adopt` not set
    #[error("conflict: {0}")]
    Conflict(String),

    /// Props rejected before any handler ran
    #[error("invalid props: {0}")]
    Validation(String),

    /// The provider's create/update/delete call failed
    #[error("handler failed: {0}")]
    Handler(String),

    /// Reading or writing this resource's record failed
    #[error("state store error: {0}")]
    StateStore(#[from] statekit::Error),

    /// An upstream resource failed, so this one was never attempted
    #[error("dependency '{0}' did not succeed")]
    DependencyFailure(String),

    /// Not attempted because the run was halted or cancelled
    #[error("not attempted: {0}")]
    Cancelled(String),

    /// Internal lifecycle invariant violated
    #[error(transparent)]
    Lifecycle(#[from] TransitionError),
}

impl ApplyError {
    /// Returns true if the resource's action was never attempted
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::DependencyFailure(_) | Self::Cancelled(_))
    }

    /// Classify a handler error by the marker types providers return
    pub fn from_handler(err: anyhow::Error) -> Self {
        if let Some(conflict) = err.downcast_ref::<crate::provider::Conflict>() {
            return Self::Conflict(conflict.to_string());
        }
        if let Some(invalid) = err.downcast_ref::<crate::provider::Invalid>() {
            return Self::Validation(invalid.to_string());
        }
        match err.downcast::<statekit::Error>() {
            Ok(store) => Self::StateStore(store),
            Err(err) => Self::Handler(format!("{err:#}")),
        }
    }
}

/// Invalid declaration: bad ids, duplicates, unknown kinds or dependencies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeclareError {
    #[error("invalid id '{0}': ids must match [A-Za-z0-9._-]+")]
    InvalidId(String),

    #[error("'{id}' is already declared in scope '{scope}'")]
    Duplicate { scope: String, id: String },

    #[error("scope '{0}' is sealed; its declaration block has completed")]
    Sealed(String),

    #[error("'{fqn}' depends on '{dependency}', which is neither declared nor stored")]
    UnknownDependency { fqn: String, dependency: String },

    #[error("no provider registered for kind '{kind}' (resource '{fqn}')")]
    UnknownKind { fqn: String, kind: String },

    #[error("provider for kind '{0}' is already registered")]
    DuplicateKind(String),
}

/// Invalid dependency graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle between: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

/// A status change the lifecycle state machine does not allow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid status transition for '{fqn}': {from} -> {to}")]
pub struct TransitionError {
    pub fqn: String,
    pub from: ResourceStatus,
    pub to: ResourceStatus,
}

/// Failure of a whole apply, destroy, plan or read run
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Declare(#[from] DeclareError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The store itself is unusable; no orchestration is possible
    #[error("state store failure: {0}")]
    Store(#[from] statekit::Error),

    #[error("failed to start executor: {0}")]
    Executor(String),

    /// Some resources failed or were skipped; the report has every outcome
    #[error("{}", summarize(.report))]
    Failed { report: Box<ApplyReport> },
}

impl RunError {
    /// The per-resource report, when the run got far enough to produce one
    pub fn report(&self) -> Option<&ApplyReport> {
        match self {
            Self::Failed { report } => Some(report),
            _ => None,
        }
    }
}

fn summarize(report: &ApplyReport) -> String {
    let failed: Vec<String> = report
        .failed()
        .map(|o| format!("{} ({})", o.fqn, o.message.as_deref().unwrap_or("failed")))
        .collect();
    let skipped: Vec<&str> = report.skipped().map(|o| o.fqn.as_str()).collect();

    let mut text = format!("{} resource(s) failed", failed.len());
    if !failed.is_empty() {
        text.push_str(&format!(": {}", failed.join(", ")));
    }
    if !skipped.is_empty() {
        text.push_str(&format!("; {} skipped: {}", skipped.len(), skipped.join(", ")));
    }
    text
}

/// Result type for declaration operations
pub type Result<T> = std::result::Result<T, DeclareError>;
