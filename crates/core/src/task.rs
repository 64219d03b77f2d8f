use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Caller-assigned task identifier. Must stay stable across resumes.
pub type TaskId = String;

/// Named parameters identifying the work of one task.
///
/// Ordered so that ids derived from parameters are deterministic.
pub type Params = BTreeMap<String, Value>;

/// A unit of independent work submitted to the batch engine.
///
/// `metadata` is a pass-through side channel: the engine never reads it,
/// it only hands it to the executor together with the rest of the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub parameters: Params,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Task {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameters: Params::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Build a task whose id is derived from its parameters.
    pub fn from_params(parameters: Params) -> Option<Self> {
        let id = Self::derive_id(&parameters)?;
        Some(Self {
            id,
            parameters,
            metadata: BTreeMap::new(),
        })
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }

    /// Join parameter values with `_` in key order, e.g. `7CMD_ATP_A_500`.
    ///
    /// Returns `None` for an empty parameter set.
    pub fn derive_id(parameters: &Params) -> Option<String> {
        if parameters.is_empty() {
            return None;
        }
        let parts: Vec<String> = parameters.values().map(value_to_id_part).collect();
        Some(parts.join("_"))
    }
}

fn value_to_id_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Classification of a failed task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The executor reported a failure.
    Failed,
    /// The executor rejected the task parameters.
    InvalidParameters,
    /// Unexpected executor-side error.
    Internal,
    /// The executor panicked.
    Panicked,
    /// The task overran the per-task timeout.
    TimedOut,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Failed => write!(f, "failed"),
            ErrorClass::InvalidParameters => write!(f, "invalid_parameters"),
            ErrorClass::Internal => write!(f, "internal"),
            ErrorClass::Panicked => write!(f, "panicked"),
            ErrorClass::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Outcome of one task-execution attempt.
///
/// Exactly one of `payload` (success) or `error` + `error_class` (failure)
/// is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub success: bool,
    /// `Some(Value::Null)` is a valid success payload and survives a round trip.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_payload"
    )]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// Wall-clock duration of the attempt.
    pub duration_secs: f64,
    pub completed_at: DateTime<Utc>,
}

/// A payload field that is present maps to `Some`, even when it is null/nil.
/// Only an absent field is `None`.
fn present_payload<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, payload: Value, duration: Duration) -> Self {
        Self {
            task_id: task_id.into(),
            success: true,
            payload: Some(payload),
            error: None,
            error_class: None,
            duration_secs: duration.as_secs_f64(),
            completed_at: Utc::now(),
        }
    }

    pub fn failure(
        task_id: impl Into<String>,
        error: impl Into<String>,
        class: ErrorClass,
        duration: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            success: false,
            payload: None,
            error: Some(error.into()),
            error_class: Some(class),
            duration_secs: duration.as_secs_f64(),
            completed_at: Utc::now(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_secs.max(0.0))
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_id_joins_values_in_key_order() {
        let task = Task::from_params(Params::from([
            ("a_pdb".to_string(), json!("7CMD")),
            ("b_ligand".to_string(), json!("ATP")),
            ("c_chain".to_string(), json!("A")),
            ("d_res".to_string(), json!(500)),
        ]))
        .unwrap();
        assert_eq!(task.id, "7CMD_ATP_A_500");
    }

    #[test]
    fn derive_id_requires_parameters() {
        assert!(Task::from_params(Params::new()).is_none());
    }

    #[test]
    fn failure_result_carries_class() {
        let r = TaskResult::failure("t1", "not found", ErrorClass::Failed, Duration::from_millis(5));
        assert!(!r.success);
        assert!(r.payload.is_none());
        assert_eq!(r.error_message(), "not found");
        assert_eq!(r.error_class, Some(ErrorClass::Failed));
    }

    #[test]
    fn task_json_omits_empty_metadata() {
        let task = Task::new("t1").with_param("pdb_id", "1ABC");
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("metadata").is_none());
        assert_eq!(json["parameters"]["pdb_id"], "1ABC");

        let back: Task = serde_json::from_value(json!({"id": "t2"})).unwrap();
        assert!(back.parameters.is_empty());
    }

    #[test]
    fn null_payload_stays_a_success_payload() {
        let ok = TaskResult::success("quiet", Value::Null, Duration::ZERO);
        let back: TaskResult = serde_json::from_str(&serde_json::to_string(&ok).unwrap()).unwrap();
        assert_eq!(back.payload, Some(Value::Null));
        assert_eq!(back, ok);

        let failed = TaskResult::failure("t", "x", ErrorClass::Failed, Duration::ZERO);
        let back: TaskResult = serde_json::from_str(&serde_json::to_string(&failed).unwrap()).unwrap();
        assert!(back.payload.is_none());
    }

    #[test]
    fn error_class_serializes_snake_case() {
        let s = serde_json::to_string(&ErrorClass::TimedOut).unwrap();
        assert_eq!(s, "\"timed_out\"");
        assert_eq!(ErrorClass::InvalidParameters.to_string(), "invalid_parameters");
    }
}
