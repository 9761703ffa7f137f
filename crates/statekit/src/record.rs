//! Persisted resource state

use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Creating,
    Created,
    Updating,
    Updated,
    Deleting,
    Deleted,
    /// Already satisfied, no action taken
    Success,
    Fail,
}

impl ResourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Updating => "updating",
            Self::Updated => "updated",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Success => "success",
            Self::Fail => "fail",
        }
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted form of a resource
///
/// This is what a [`StateStore`](crate::StateStore) keeps between runs and the
/// only source of truth for what currently exists.
#[derive(Debug, Clone, PartialEq)]
pub struct StateRecord {
    /// Fully-qualified name, also the store key
    pub fqn: String,
    /// Resource type tag
    pub kind: String,
    /// Short id within the enclosing scope
    pub id: String,
    /// Revision, bumped on every successful create or update
    pub seq: u64,
    pub status: ResourceStatus,
    /// Resolved input props of the last attempt
    pub props: Value,
    /// Output of the last successful handler call
    pub output: Value,
    /// FQNs this resource depended on when last applied
    pub deps: Vec<String>,
    /// Failure message of the last attempt, if it failed
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StateRecord {
    /// A fresh record that has not completed any handler yet
    pub fn new(fqn: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            kind: kind.into(),
            id: id.into(),
            seq: 0,
            status: ResourceStatus::Pending,
            props: Value::Null,
            output: Value::Null,
            deps: Vec::new(),
            message: None,
            updated_at: Utc::now(),
        }
    }

    /// Props with the output overlaid, as exposed to dependents
    pub fn merged_output(&self) -> Value {
        self.props.merged(&self.output)
    }

    /// True once a create has completed at least once
    pub fn has_been_created(&self) -> bool {
        self.seq > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ResourceStatus::Creating).unwrap();
        assert_eq!(json, "\"creating\"");
        let back: ResourceStatus = serde_json::from_str("\"fail\"").unwrap();
        assert_eq!(back, ResourceStatus::Fail);
        assert_eq!(ResourceStatus::Success.to_string(), "success");
    }

    #[test]
    fn test_new_record_defaults() {
        let record = StateRecord::new("app/dev/a", "bucket", "a");
        assert_eq!(record.seq, 0);
        assert_eq!(record.status, ResourceStatus::Pending);
        assert!(!record.has_been_created());
        assert!(record.output.is_null());
    }

    #[test]
    fn test_merged_output() {
        let mut record = StateRecord::new("app/dev/a", "bucket", "a");
        record.props = Value::map([("name", "b1")]);
        record.output = Value::map([("arn", "arn:b1")]);
        let merged = record.merged_output();
        assert_eq!(merged.get("name"), Some(&Value::from("b1")));
        assert_eq!(merged.get("arn"), Some(&Value::from("arn:b1")));
    }
}
