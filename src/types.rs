//! Canonical Types
//!
//! The envelope shapes exchanged between the controller, agents, the
//! environment and memory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::error::{ErrorKind, TaskError};

fn default_priority() -> u8 {
    3
}

fn default_resources() -> u32 {
    1
}

/// A unit of work submitted to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub payload: Value,
    /// Deadline in milliseconds; 0 means the configured default
    #[serde(default)]
    pub timeout_ms: u64,
    /// Resource estimate in abstract units
    #[serde(default = "default_resources")]
    pub resources: u32,
    /// Memory key; defaults to the task type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(task_id: &str, kind: &str, payload: Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            priority: default_priority(),
            payload,
            timeout_ms: 0,
            resources: default_resources(),
            domain: None,
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_resources(mut self, units: u32) -> Self {
        self.resources = units;
        self
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_string());
        self
    }

    /// Key under which this task's context lives in memory
    pub fn context_key(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.kind)
    }

    /// Reject malformed requests before anything else touches them
    pub fn validate(&self, resource_ceiling: u32, max_timeout_ms: u64) -> Result<(), TaskError> {
        if self.task_id.trim().is_empty() {
            return Err(TaskError::InvalidInput("task_id must be a non-empty string".into()));
        }
        if self.kind.trim().is_empty() {
            return Err(TaskError::InvalidInput("type must be a non-empty string".into()));
        }
        if !(1..=5).contains(&self.priority) {
            return Err(TaskError::InvalidInput(format!(
                "priority must be within 1..=5, got {}",
                self.priority
            )));
        }
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(TaskError::InvalidInput("payload must be an object".into()));
        }
        if self.resources == 0 || self.resources > resource_ceiling {
            return Err(TaskError::InvalidInput(format!(
                "resources must be within 1..={}, got {}",
                resource_ceiling, self.resources
            )));
        }
        if self.timeout_ms > max_timeout_ms {
            return Err(TaskError::InvalidInput(format!(
                "timeout_ms exceeds the maximum of {}",
                max_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Cached historical state for a task domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub key: String,
    #[serde(default)]
    pub history: Vec<Value>,
    #[serde(default)]
    pub cached_schema: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ContextRecord {
    /// A fresh record with no history
    pub fn empty(key: &str) -> Self {
        Self {
            key: key.to_string(),
            history: Vec::new(),
            cached_schema: None,
            timestamp: Utc::now(),
            version: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty() && self.cached_schema.is_none()
    }
}

/// Context as seen by a single task, with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub record: ContextRecord,
    /// True when the primary lookup failed and this came from a fallback
    pub degraded: bool,
}

/// Limits an approved task must run within
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub resource_units: u32,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl Constraints {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The controller's decision for one strategy of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlSignal {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub agent: String,
    pub constraints: Constraints,
    pub context_snapshot: ContextSnapshot,
    pub use_cached_schema: bool,
    pub task: TaskRequest,
}

/// One side-effecting request from an agent to the environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub task_id: String,
    pub sequence: u32,
    pub kind: String,
    pub payload: Value,
    pub correlation_id: String,
    pub idempotency_key: String,
}

impl ActionCommand {
    pub fn new(task: &TaskRequest, sequence: u32) -> Self {
        Self {
            task_id: task.task_id.clone(),
            sequence,
            kind: task.kind.clone(),
            payload: task.payload.clone(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            idempotency_key: Self::derive_key(&task.task_id, sequence),
        }
    }

    /// Key = SHA256(task_id ":" sequence)
    pub fn derive_key(task_id: &str, sequence: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(task_id.as_bytes());
        hasher.update(b":");
        hasher.update(sequence.to_be_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Observation status reported by the environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationStatus {
    Success,
    Partial,
    TransientError,
    PermanentError,
}

/// Response to an [`ActionCommand`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub status: ObservationStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default, alias = "error_code", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl Observation {
    pub fn success(data: Value) -> Self {
        Self {
            status: ObservationStatus::Success,
            data,
            error_kind: None,
        }
    }

    pub fn partial(data: Value) -> Self {
        Self {
            status: ObservationStatus::Partial,
            data,
            error_kind: None,
        }
    }

    pub fn transient(error: &str) -> Self {
        Self {
            status: ObservationStatus::TransientError,
            data: Value::Null,
            error_kind: Some(error.to_string()),
        }
    }

    pub fn permanent(error: &str) -> Self {
        Self {
            status: ObservationStatus::PermanentError,
            data: Value::Null,
            error_kind: Some(error.to_string()),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.status == ObservationStatus::TransientError
    }

    /// Whether a side effect took place and the result must be replayed
    pub fn is_settled(&self) -> bool {
        !self.is_transient()
    }
}

/// Terminal outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    Partial,
    Aborted,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Partial => "partial",
            Self::Aborted => "aborted",
        }
    }
}

/// Resources consumed by a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub units: u32,
    pub actions: u32,
    pub retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

/// Terminal record of a task, appended to the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub task_id: String,
    pub outcome: Outcome,
    pub duration_ms: u64,
    pub resources_used: ResourceUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub alternatives_attempted: u32,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub completed_at: DateTime<Utc>,
}

impl CompletionReport {
    pub fn completed(task_id: &str, outcome: Outcome, data: Value, duration: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            outcome,
            duration_ms: duration.as_millis() as u64,
            resources_used: ResourceUsage::default(),
            error: None,
            alternatives_attempted: 0,
            degraded: false,
            agent: None,
            // Serialized `null` reads back as `None`
            data: (!data.is_null()).then_some(data),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(task_id: &str, error: &TaskError, duration: Duration) -> Self {
        let kind = error.kind();
        let outcome = if kind == ErrorKind::Cancelled {
            Outcome::Aborted
        } else {
            Outcome::Failure
        };
        Self {
            task_id: task_id.to_string(),
            outcome,
            duration_ms: duration.as_millis() as u64,
            resources_used: ResourceUsage::default(),
            error: Some(ErrorDetail {
                kind,
                message: error.to_string(),
            }),
            alternatives_attempted: 0,
            degraded: false,
            agent: None,
            data: None,
            completed_at: Utc::now(),
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
