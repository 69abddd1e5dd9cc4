//! Module Adapters
//!
//! Translation boundary between a heterogeneous module's native shapes and the
//! canonical [`TaskRequest`] / [`CompletionReport`] envelopes. Translations are
//! pure: no I/O, no clocks beyond what the input carries.
//!
//! ```text
//! native call ──► ModuleAdapter::to_canonical ──► TaskRequest ──► controller
//! native result ◄── ModuleAdapter::from_canonical ◄── CompletionReport
//! ```

pub mod envelope;
pub mod legacy;

use serde_json::{Map, Value};

use crate::error::AdapterError;
use crate::types::{CompletionReport, TaskRequest};

pub use legacy::LegacyAdapter;

/// A bridge between one module's native API and the canonical schema
pub trait ModuleAdapter: Send + Sync {
    /// Adapter name, used in logs and routes
    fn name(&self) -> &str;

    /// Translate a native call into a canonical request
    fn to_canonical(&self, native: &Value) -> Result<TaskRequest, AdapterError>;

    /// Translate a canonical report into the module's native result
    fn from_canonical(&self, report: &CompletionReport) -> Value;
}

/// Describe the shape of a payload as field name -> JSON type name.
///
/// Nested objects are described recursively; this is what memory caches as a
/// domain's schema.
pub fn describe_shape(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let fields: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), describe_shape(v)))
                .collect();
            Value::Object(fields)
        }
        other => Value::String(type_name(other).to_string()),
    }
}

/// JSON type name of a value
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
