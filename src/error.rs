//! Error Taxonomy
//!
//! Every failure that can end a task maps onto an [`ErrorKind`], which is what
//! callers see on the wire. Component errors (adapter, memory) convert into
//! [`TaskError`] one level up.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire-level error classification carried by completion reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller error, never retried
    InvalidInput,
    /// A required field is missing from a native shape
    SchemaMismatch,
    /// A value cannot be coerced into the canonical schema
    UnsupportedType,
    /// No agent declares the task type as a capability
    Unsupported,
    /// Transient failures exhausted the retry budget
    ActionFailure,
    /// The environment reported a failure that retrying cannot fix
    PermanentActionFailure,
    /// The task exceeded its deadline
    Timeout,
    /// The memory store faulted
    MemoryFault,
    /// Every strategy was denied approval
    Rejected,
    /// The task was cancelled by the caller
    Cancelled,
    /// Anything else
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::SchemaMismatch => "schema_mismatch",
            Self::UnsupportedType => "unsupported_type",
            Self::Unsupported => "unsupported",
            Self::ActionFailure => "action_failure",
            Self::PermanentActionFailure => "permanent_action_failure",
            Self::Timeout => "timeout",
            Self::MemoryFault => "memory_fault",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Only exhausted transient failures justify another strategy
    pub fn allows_alternative(&self) -> bool {
        matches!(self, Self::ActionFailure)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter translation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("schema mismatch: missing required field '{field}'")]
    SchemaMismatch { field: String },

    #[error("unsupported type for '{field}': expected {expected}")]
    UnsupportedType { field: String, expected: String },
}

impl AdapterError {
    pub fn missing(field: &str) -> Self {
        Self::SchemaMismatch {
            field: field.to_string(),
        }
    }

    pub fn unsupported(field: &str, expected: &str) -> Self {
        Self::UnsupportedType {
            field: field.to_string(),
            expected: expected.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Self::UnsupportedType { .. } => ErrorKind::UnsupportedType,
        }
    }
}

/// Memory store errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory fault: {0}")]
    Fault(String),

    #[error("no backup snapshot for '{0}'")]
    Unrecoverable(String),

    #[error("stale write for '{key}': stored version is newer")]
    StaleWrite { key: String },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoryError {
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::Fault(msg.into())
    }
}

/// Errors that terminate (or escalate) a task
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("task type '{0}' is not supported")]
    Unsupported(String),

    #[error("action failed after {attempts} attempts: {message}")]
    ActionFailure { attempts: u32, message: String },

    #[error("permanent action failure: {0}")]
    PermanentActionFailure(String),

    #[error("task timed out after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Adapter(e) => e.kind(),
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::ActionFailure { .. } => ErrorKind::ActionFailure,
            Self::PermanentActionFailure(_) => ErrorKind::PermanentActionFailure,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Memory(_) => ErrorKind::MemoryFault,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
