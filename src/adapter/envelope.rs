//! Canonical JSON envelope codec
//!
//! `decode(encode(x)) == x` for every representable request and report.

use serde_json::Value;

use super::type_name;
use crate::error::AdapterError;
use crate::types::{CompletionReport, TaskRequest};

const REQUIRED_REQUEST_FIELDS: [&str; 2] = ["task_id", "type"];
const REQUIRED_REPORT_FIELDS: [&str; 4] = ["task_id", "outcome", "duration_ms", "completed_at"];

/// Encode a request as its canonical envelope
pub fn encode(task: &TaskRequest) -> Value {
    // Derived Serialize on plain data cannot fail
    serde_json::to_value(task).unwrap_or(Value::Null)
}

/// Decode a canonical envelope into a request
pub fn decode(envelope: &Value) -> Result<TaskRequest, AdapterError> {
    let map = envelope
        .as_object()
        .ok_or_else(|| AdapterError::unsupported("envelope", "object"))?;

    for field in REQUIRED_REQUEST_FIELDS {
        if !map.contains_key(field) {
            return Err(AdapterError::missing(field));
        }
    }

    if let Some(payload) = map.get("payload") {
        if !(payload.is_object() || payload.is_null()) {
            return Err(AdapterError::unsupported(
                "payload",
                &format!("object, got {}", type_name(payload)),
            ));
        }
    }

    serde_json::from_value(envelope.clone())
        .map_err(|e| AdapterError::unsupported("envelope", &e.to_string()))
}

/// Encode a report as its canonical envelope
pub fn encode_report(report: &CompletionReport) -> Value {
    serde_json::to_value(report).unwrap_or(Value::Null)
}

/// Decode a canonical report envelope
pub fn decode_report(envelope: &Value) -> Result<CompletionReport, AdapterError> {
    let map = envelope
        .as_object()
        .ok_or_else(|| AdapterError::unsupported("envelope", "object"))?;

    for field in REQUIRED_REPORT_FIELDS {
        if !map.contains_key(field) {
            return Err(AdapterError::missing(field));
        }
    }

    serde_json::from_value(envelope.clone())
        .map_err(|e| AdapterError::unsupported("envelope", &e.to_string()))
}
