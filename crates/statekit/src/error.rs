//! Error types for state storage and the secret codec

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading, writing or decoding state
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored record could not be parsed
    #[error("corrupt state record '{key}': {reason}")]
    CorruptRecord { key: String, reason: String },

    /// A secret field could not be decrypted (wrong passphrase, tampered or truncated payload)
    #[error("failed to decrypt secret{}: {reason}", .key.as_deref().map(|k| format!(" in '{k}'")).unwrap_or_default())]
    Decryption { key: Option<String>, reason: String },

    /// A secret was found but no passphrase was configured
    #[error("state contains secrets but no passphrase was configured")]
    MissingPassphrase,

    /// A value still contains a reference to another resource's output
    #[error("unresolved binding to '{fqn}'{}", if .path.is_empty() { String::new() } else { format!(".{}", .path.join(".")) })]
    UnresolvedBinding { fqn: String, path: Vec<String> },

    /// Key is not usable by this backend
    #[error("invalid state key '{0}'")]
    InvalidKey(String),

    /// Backend cannot be reached at all
    #[error("state store unreachable: {0}")]
    Unreachable(String),

    /// HTTP error talking to a remote backend
    #[error("HTTP error{}: {message}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Http { message: String, status: Option<u16> },

    /// The durable worker hosting the store could not be provisioned
    #[error("failed to provision state worker '{worker}': {reason}")]
    Provisioning { worker: String, reason: String },

    /// The durable worker stopped answering
    #[error("state worker '{0}' is no longer running")]
    WorkerGone(String),

    /// Store was used before `init()`
    #[error("state store not initialized")]
    NotInitialized,

    /// Path outside of the store root
    #[error("path escapes state root: {}", .0.display())]
    OutsideRoot(PathBuf),
}

impl Error {
    /// Returns true if the failure concerns the store as a whole rather than one record.
    ///
    /// Connectivity failures abort a run; record-level failures are attributed to the
    /// resource that owns the record.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Unreachable(_)
                | Error::Http { .. }
                | Error::Provisioning { .. }
                | Error::WorkerGone(_)
                | Error::NotInitialized
        )
    }

    /// Attach the record key to a decryption error raised without one
    pub fn for_key(self, key: &str) -> Self {
        match self {
            Error::Decryption { key: None, reason } => Error::Decryption {
                key: Some(key.to_string()),
                reason,
            },
            other => other,
        }
    }
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::StatusCode(code) => Self::Http {
                message: format!("HTTP {code}"),
                status: Some(code),
            },
            other => Self::Http {
                message: other.to_string(),
                status: None,
            },
        }
    }
}

/// Result type for state operations
pub type Result<T> = std::result::Result<T, Error>;
