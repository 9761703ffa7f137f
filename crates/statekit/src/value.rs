//! Structured property values
//!
//! [`Value`] is the data model for resource props and outputs. Besides plain
//! JSON-like data it carries two special variants:
//!
//! - [`Value::Secret`]: a sensitive scalar that never prints its plaintext and is
//!   encrypted whenever a record is persisted
//! - [`Value::Ref`]: an unresolved binding to another resource's output, replaced
//!   by the concrete value once the upstream resource has been applied

use crate::error::{Error, Result};
use crate::secret::Secret;
use std::collections::BTreeMap;
use std::fmt;

/// Reference to (a field of) another resource's output
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Fully-qualified name of the upstream resource
    pub fqn: String,
    /// Field path inside the upstream output; empty means the whole output
    pub path: Vec<String>,
}

impl OutputRef {
    pub fn new(fqn: impl Into<String>) -> Self {
        Self {
            fqn: fqn.into(),
            path: Vec::new(),
        }
    }

    /// Narrow the reference to a nested field
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.path.push(name.into());
        self
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}", self.fqn)?;
        for segment in &self.path {
            write!(f, ".{segment}")?;
        }
        write!(f, "}}")
    }
}

/// A property or output value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Secret(Secret),
    Ref(OutputRef),
}

impl Value {
    /// Build a map value from key/value pairs
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list value
    pub fn list<V: Into<Value>, I: IntoIterator<Item = V>>(items: I) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }

    /// Wrap a plaintext as a secret value
    pub fn secret(plaintext: impl Into<String>) -> Self {
        Self::Secret(Secret::new(plaintext))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Number(n) => n.as_u64(),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_secret(&self) -> Option<&Secret> {
        match self {
            Self::Secret(s) => Some(s),
            _ => None,
        }
    }

    /// Look up a key of a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Follow a field path through nested maps (and list indices)
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Option<&Value> {
        let mut current = self;
        for segment in path {
            let segment = segment.as_ref();
            current = match current {
                Self::Map(m) => m.get(segment)?,
                Self::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// All output references embedded in this value, in encounter order
    pub fn refs(&self) -> Vec<&OutputRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Ref(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            Self::Map(m) => m.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }

    /// True if no output reference remains anywhere in the value
    pub fn is_resolved(&self) -> bool {
        match self {
            Self::Ref(_) => false,
            Self::List(items) => items.iter().all(Value::is_resolved),
            Self::Map(m) => m.values().all(Value::is_resolved),
            _ => true,
        }
    }

    /// Replace every output reference with the value returned by `lookup`
    ///
    /// `lookup` receives the upstream FQN and returns that resource's (merged)
    /// output; the reference path is then followed inside it.
    pub fn resolve<F>(&self, lookup: F) -> Result<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        self.resolve_with(&lookup)
    }

    fn resolve_with<F>(&self, lookup: &F) -> Result<Value>
    where
        F: Fn(&str) -> Option<Value>,
    {
        match self {
            Self::Ref(r) => {
                let unresolved = || Error::UnresolvedBinding {
                    fqn: r.fqn.clone(),
                    path: r.path.clone(),
                };
                let output = lookup(&r.fqn).ok_or_else(unresolved)?;
                output.get_path(&r.path).cloned().ok_or_else(unresolved)
            }
            Self::List(items) => items
                .iter()
                .map(|v| v.resolve_with(lookup))
                .collect::<Result<Vec<_>>>()
                .map(Self::List),
            Self::Map(m) => m
                .iter()
                .map(|(k, v)| Ok((k.clone(), v.resolve_with(lookup)?)))
                .collect::<Result<BTreeMap<_, _>>>()
                .map(Self::Map),
            other => Ok(other.clone()),
        }
    }

    /// Overlay `output` on top of these props
    ///
    /// Map outputs are merged key by key (output wins); any other non-null output
    /// replaces the props entirely.
    pub fn merged(&self, output: &Value) -> Value {
        match (self, output) {
            (Self::Map(props), Self::Map(out)) => {
                let mut merged = props.clone();
                merged.extend(out.iter().map(|(k, v)| (k.clone(), v.clone())));
                Self::Map(merged)
            }
            (props, Self::Null) => props.clone(),
            (_, out) => out.clone(),
        }
    }

    /// Convert plain JSON into a value (no secrets, no references)
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => Self::Number(n),
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(m) => Self::Map(
                m.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render as JSON for display: secrets are redacted, references shown as `${fqn.path}`
    pub fn to_json_redacted(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Number(n) => serde_json::Value::Number(n.clone()),
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::Secret(s) => serde_json::Value::String(s.to_string()),
            Self::Ref(r) => serde_json::Value::String(r.to_string()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json_redacted).collect())
            }
            Self::Map(m) => serde_json::Value::Object(
                m.iter()
                    .map(|(k, v)| (k.clone(), v.to_json_redacted()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json_redacted())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::Number(n.into())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

impl From<Secret> for Value {
    fn from(s: Secret) -> Self {
        Self::Secret(s)
    }
}

impl From<OutputRef> for Value {
    fn from(r: OutputRef) -> Self {
        Self::Ref(r)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Self::Map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Self::from_json(json)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Self::Null, Into::into)
    }
}
