//! Legacy Agent API Adapter
//!
//! Bridges the legacy job API to the canonical envelopes.
//!
//! Native job: `{id, type, priority, payload, metadata?}` where `priority` may be
//! an integer-like string and `payload` may be a JSON string.
//! Native result: `{status, result_code, output, timestamp}`.
//! Native response: `{success, code, data, created_at, completed_at}`.

use chrono::Duration as ChronoDuration;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{type_name, ModuleAdapter};
use crate::error::{AdapterError, ErrorKind};
use crate::types::{ActionCommand, CompletionReport, Observation, Outcome, TaskRequest};

/// Canonical task type -> legacy action name
const ACTION_ALIASES: [(&str, &str); 4] = [
    ("data_processing", "process_data"),
    ("classification", "classify"),
    ("summarization", "summarize"),
    ("ingestion", "ingest"),
];

const PRIORITY_MIN: i64 = 1;
const PRIORITY_MAX: i64 = 5;

/// Adapter for the legacy job API
#[derive(Debug, Clone, Default)]
pub struct LegacyAdapter;

impl LegacyAdapter {
    pub fn new() -> Self {
        Self
    }

    fn require<'a>(job: &'a Map<String, Value>, field: &str) -> Result<&'a Value, AdapterError> {
        job.get(field).ok_or_else(|| AdapterError::missing(field))
    }

    /// Coerce a priority to 1..=5; integer-like strings are accepted, booleans are not
    pub fn coerce_priority(value: &Value) -> Result<u8, AdapterError> {
        let raw = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or_else(|| AdapterError::unsupported("priority", "integer 1..5"))?;

        Ok(raw.clamp(PRIORITY_MIN, PRIORITY_MAX) as u8)
    }

    /// Payload must end up an object; null and empty strings become `{}`
    pub fn normalize_payload(value: Option<&Value>) -> Result<Value, AdapterError> {
        match value {
            None | Some(Value::Null) => Ok(Value::Object(Map::new())),
            Some(obj @ Value::Object(_)) => Ok(obj.clone()),
            Some(Value::String(s)) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(Value::Object(Map::new()));
                }
                match serde_json::from_str::<Value>(s) {
                    Ok(parsed @ Value::Object(_)) => Ok(parsed),
                    Ok(other) => Err(AdapterError::unsupported(
                        "payload",
                        &format!("JSON object, got {}", type_name(&other)),
                    )),
                    Err(_) => Err(AdapterError::unsupported("payload", "valid JSON object string")),
                }
            }
            Some(other) => Err(AdapterError::unsupported(
                "payload",
                &format!("object or JSON string, got {}", type_name(other)),
            )),
        }
    }

    /// Legacy action name for a canonical task type
    pub fn native_action(kind: &str) -> &str {
        ACTION_ALIASES
            .iter()
            .find(|(canonical, _)| *canonical == kind)
            .map(|(_, native)| *native)
            .unwrap_or(kind)
    }

    /// Reverse of [`ModuleAdapter::to_canonical`] for normalized jobs
    pub fn to_native(&self, task: &TaskRequest) -> Value {
        let mut job = Map::new();
        job.insert("id".into(), Value::String(task.task_id.clone()));
        job.insert("type".into(), Value::String(task.kind.clone()));
        job.insert("priority".into(), json!(task.priority));
        job.insert("payload".into(), task.payload.clone());
        if !task.metadata.is_empty() {
            job.insert("metadata".into(), Value::Object(task.metadata.clone()));
        }
        Value::Object(job)
    }

    /// Legacy `execute_task` params for an action
    pub fn native_params(cmd: &ActionCommand) -> Value {
        json!({
            "action": Self::native_action(&cmd.kind),
            "data": cmd.payload,
        })
    }

    /// Translate a legacy `execute_task` result into an observation
    pub fn observation_from_native(result: &Value) -> Result<Observation, AdapterError> {
        let map = result
            .as_object()
            .ok_or_else(|| AdapterError::unsupported("result", "object"))?;

        let code = Self::require(map, "result_code")?
            .as_i64()
            .ok_or_else(|| AdapterError::unsupported("result_code", "integer"))?;

        let data = json!({
            "status": map.get("status").cloned().unwrap_or(Value::Null),
            "output": map.get("output").cloned().unwrap_or(Value::Null),
            "timestamp": map.get("timestamp").cloned().unwrap_or(Value::Null),
        });

        let observation = match code {
            200 => Observation::success(data),
            206 => Observation::partial(data),
            408 | 429 | 503 => Observation::transient(&format!("legacy_{}", code)),
            _ => Observation::permanent(&format!("legacy_{}", code)),
        };
        debug!("Legacy result {} -> {:?}", code, observation.status);
        Ok(observation)
    }

    fn code_for(report: &CompletionReport) -> u16 {
        match (report.outcome, report.error_kind()) {
            (Outcome::Success, _) => 200,
            (Outcome::Partial, _) => 206,
            (_, Some(kind)) => Self::code_for_kind(kind),
            _ => 500,
        }
    }

    fn code_for_kind(kind: ErrorKind) -> u16 {
        match kind {
            ErrorKind::InvalidInput | ErrorKind::SchemaMismatch | ErrorKind::UnsupportedType => 400,
            ErrorKind::Unsupported => 404,
            ErrorKind::Timeout => 408,
            ErrorKind::Cancelled => 409,
            ErrorKind::Rejected => 503,
            _ => 500,
        }
    }

    /// Conservative response used when strict translation fails; never fails itself
    pub fn safe_response(job: &Value, error: &AdapterError) -> Value {
        let job_id = job
            .get("id")
            .and_then(|id| match id {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| "unknown".to_string());

        let now = chrono::Utc::now().to_rfc3339();
        json!({
            "success": false,
            "code": Self::code_for_kind(error.kind()),
            "data": {
                "job_id": job_id,
                "result": format!("Error: {}", error),
                "error_kind": error.kind(),
                "metrics": {"duration_ms": 0, "resources_used": 0},
            },
            "created_at": now,
            "completed_at": now,
        })
    }

    /// Status query response for a job
    pub fn status_response(job_id: &str, report: Option<&CompletionReport>) -> Value {
        let (status, success, code) = match report.map(|r| r.outcome) {
            Some(Outcome::Success) | Some(Outcome::Partial) => ("COMPLETED", true, 200),
            Some(Outcome::Failure) | Some(Outcome::Aborted) => ("FAILED", false, 500),
            None => ("UNKNOWN", false, 206),
        };

        json!({
            "success": success,
            "code": code,
            "data": {"job_id": job_id, "status": status},
            "completed_at": report.map(|r| r.completed_at.to_rfc3339()),
        })
    }
}

impl ModuleAdapter for LegacyAdapter {
    fn name(&self) -> &str {
        "legacy"
    }

    fn to_canonical(&self, native: &Value) -> Result<TaskRequest, AdapterError> {
        let job = native
            .as_object()
            .ok_or_else(|| AdapterError::unsupported("job", "object"))?;

        let id = match Self::require(job, "id")? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            _ => String::new(),
        };
        if id.is_empty() {
            return Err(AdapterError::unsupported("id", "non-empty string"));
        }

        let kind = Self::require(job, "type")?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AdapterError::unsupported("type", "non-empty string"))?;

        let priority = Self::coerce_priority(Self::require(job, "priority")?)?;
        let payload = Self::normalize_payload(job.get("payload"))?;

        let metadata = match job.get("metadata") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(m)) => m.clone(),
            Some(other) => {
                return Err(AdapterError::unsupported(
                    "metadata",
                    &format!("object, got {}", type_name(other)),
                ))
            }
        };

        let mut task = TaskRequest::new(&id, kind, payload).with_priority(priority);
        task.metadata = metadata;
        Ok(task)
    }

    fn from_canonical(&self, report: &CompletionReport) -> Value {
        let created_at = report.completed_at - ChronoDuration::milliseconds(report.duration_ms as i64);
        let result = match (&report.data, &report.error) {
            (Some(data), _) => data.clone(),
            (None, Some(err)) => Value::String(format!("Error: {}", err.message)),
            (None, None) => Value::Null,
        };

        json!({
            "success": report.outcome == Outcome::Success,
            "code": Self::code_for(report),
            "data": {
                "job_id": report.task_id,
                "result": result,
                "error_kind": report.error_kind(),
                "metrics": {
                    "duration_ms": report.duration_ms,
                    "resources_used": report.resources_used.units,
                },
            },
            "created_at": created_at.to_rfc3339(),
            "completed_at": report.completed_at.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use std::time::Duration;

    fn modern_job() -> Value {
        json!({
            "id": "job_2025_001",
            "type": "data_processing",
            "priority": 3,
            "payload": {"input_file": "data.csv", "operations": ["filter", "transform", "aggregate"]},
            "metadata": {"user": "admin", "department": "analytics"}
        })
    }

    #[test]
    fn test_to_canonical_modern_job() {
        let task = LegacyAdapter::new().to_canonical(&modern_job()).unwrap();
        assert_eq!(task.task_id, "job_2025_001");
        assert_eq!(task.kind, "data_processing");
        assert_eq!(task.priority, 3);
        assert_eq!(task.payload["input_file"], "data.csv");
        assert_eq!(task.metadata["department"], "analytics");
    }

    #[test]
    fn test_native_round_trip() {
        let adapter = LegacyAdapter::new();
        let job = modern_job();
        let task = adapter.to_canonical(&job).unwrap();
        assert_eq!(adapter.to_native(&task), job);
    }

    #[test]
    fn test_missing_required_field() {
        let mut job = modern_job();
        job.as_object_mut().unwrap().remove("priority");
        assert_eq!(
            LegacyAdapter::new().to_canonical(&job).unwrap_err(),
            AdapterError::missing("priority")
        );
    }

    #[test]
    fn test_priority_coercion() {
        assert_eq!(LegacyAdapter::coerce_priority(&json!("4")).unwrap(), 4);
        assert_eq!(LegacyAdapter::coerce_priority(&json!(9)).unwrap(), 5);
        assert_eq!(LegacyAdapter::coerce_priority(&json!(-2)).unwrap(), 1);
        assert_eq!(LegacyAdapter::coerce_priority(&json!(2.9)).unwrap(), 2);
        assert!(matches!(
            LegacyAdapter::coerce_priority(&json!(true)),
            Err(AdapterError::UnsupportedType { .. })
        ));
        assert!(LegacyAdapter::coerce_priority(&json!("high")).is_err());
    }

    #[test]
    fn test_payload_normalization() {
        assert_eq!(LegacyAdapter::normalize_payload(None).unwrap(), json!({}));
        assert_eq!(
            LegacyAdapter::normalize_payload(Some(&json!("  "))).unwrap(),
            json!({})
        );
        assert_eq!(
            LegacyAdapter::normalize_payload(Some(&json!(r#"{"a": [1]}"#))).unwrap(),
            json!({"a": [1]})
        );
        assert!(LegacyAdapter::normalize_payload(Some(&json!("[1, 2]"))).is_err());
        assert!(LegacyAdapter::normalize_payload(Some(&json!("{broken"))).is_err());
        assert!(LegacyAdapter::normalize_payload(Some(&json!(7))).is_err());
    }

    #[test]
    fn test_native_action_aliases() {
        assert_eq!(LegacyAdapter::native_action("data_processing"), "process_data");
        assert_eq!(LegacyAdapter::native_action("summarization"), "summarize");
        assert_eq!(LegacyAdapter::native_action("process_dataset"), "process_dataset");
    }

    #[test]
    fn test_observation_from_native_codes() {
        let ok = LegacyAdapter::observation_from_native(&json!({
            "status": "completed", "result_code": 200, "output": "done", "timestamp": "t"
        }))
        .unwrap();
        assert_eq!(ok.status, crate::types::ObservationStatus::Success);
        assert_eq!(ok.data["output"], "done");

        let busy = LegacyAdapter::observation_from_native(&json!({"result_code": 503})).unwrap();
        assert!(busy.is_transient());

        let broken = LegacyAdapter::observation_from_native(&json!({"result_code": 418})).unwrap();
        assert_eq!(broken.status, crate::types::ObservationStatus::PermanentError);

        assert_eq!(
            LegacyAdapter::observation_from_native(&json!({"status": "completed"})).unwrap_err(),
            AdapterError::missing("result_code")
        );
    }

    #[test]
    fn test_from_canonical_shapes() {
        let adapter = LegacyAdapter::new();
        let ok = CompletionReport::completed(
            "job_1",
            Outcome::Success,
            json!({"output": "done"}),
            Duration::from_millis(40),
        );
        let native = adapter.from_canonical(&ok);
        assert_eq!(native["success"], true);
        assert_eq!(native["code"], 200);
        assert_eq!(native["data"]["job_id"], "job_1");
        assert_eq!(native["data"]["metrics"]["duration_ms"], 40);

        let timed_out = CompletionReport::failed("job_2", &TaskError::Timeout(5), Duration::ZERO);
        let native = adapter.from_canonical(&timed_out);
        assert_eq!(native["success"], false);
        assert_eq!(native["code"], 408);
        assert_eq!(native["data"]["error_kind"], "timeout");
    }

    #[test]
    fn test_safe_response_never_fails() {
        let resp = LegacyAdapter::safe_response(&json!("garbage"), &AdapterError::missing("id"));
        assert_eq!(resp["success"], false);
        assert_eq!(resp["code"], 400);
        assert_eq!(resp["data"]["job_id"], "unknown");

        let resp = LegacyAdapter::safe_response(
            &json!({"id": " job_9 "}),
            &AdapterError::unsupported("priority", "integer 1..5"),
        );
        assert_eq!(resp["data"]["job_id"], "job_9");
        assert_eq!(resp["data"]["error_kind"], "unsupported_type");
    }

    #[test]
    fn test_status_response() {
        let unknown = LegacyAdapter::status_response("job_1", None);
        assert_eq!(unknown["data"]["status"], "UNKNOWN");
        assert_eq!(unknown["code"], 206);

        let report = CompletionReport::completed("job_1", Outcome::Success, json!({}), Duration::ZERO);
        let done = LegacyAdapter::status_response("job_1", Some(&report));
        assert_eq!(done["data"]["status"], "COMPLETED");
        assert_eq!(done["success"], true);
    }
}
