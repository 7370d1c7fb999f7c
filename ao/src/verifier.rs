//! Post-hoc task verification
//!
//! Validates completed tasks at three strictness levels. BASIC checks
//! the obvious invariants (result present, no error, coherent status),
//! STRICT adds structural schema matching and temporal coherence, and
//! PARANOID runs any domain-specific verifier registered for the
//! action, merging its findings.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::graph::{Task, TaskGraph, TaskStatus};
use crate::metrics;

/// Verification strictness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerificationLevel {
    /// Minimal and fast
    Basic,
    /// Structural checks, the default
    #[default]
    Strict,
    /// Everything, including registered domain verifiers
    Paranoid,
}

impl std::fmt::Display for VerificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Basic => write!(f, "basic"),
            Self::Strict => write!(f, "strict"),
            Self::Paranoid => write!(f, "paranoid"),
        }
    }
}

/// Outcome of verifying one task
#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub passed: bool,
    pub level: VerificationLevel,
    /// Named checks and whether each passed
    pub checks: BTreeMap<String, bool>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Passed checks over total checks
    pub confidence_score: f64,
    pub metadata: Map<String, Value>,
}

impl VerificationResult {
    /// A passing result with no checks recorded
    pub fn pass(level: VerificationLevel) -> Self {
        let mut metadata = Map::new();
        metadata.insert("verified_at".to_string(), Value::from(Utc::now().to_rfc3339()));
        Self {
            passed: true,
            level,
            checks: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            confidence_score: 1.0,
            metadata,
        }
    }
}

/// Domain-specific verifier registered per action name
pub type CustomVerifier = Arc<dyn Fn(&Task) -> VerificationResult + Send + Sync>;

/// Verification counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifierStats {
    pub total_verifications: u64,
    pub passed: u64,
    pub failed: u64,
}

/// Structural health report over the verifier itself
#[derive(Debug, Clone, Serialize)]
pub struct SelfCheckReport {
    pub passed: bool,
    pub checks: BTreeMap<String, bool>,
    pub stats: VerifierStats,
    pub registered_verifiers: Vec<String>,
    pub timestamp: String,
}

/// Validates completed tasks against shape, temporal and domain checks
pub struct TaskVerifier {
    default_level: VerificationLevel,
    custom_verifiers: HashMap<String, CustomVerifier>,
    stats: Mutex<VerifierStats>,
}

impl TaskVerifier {
    pub fn new(default_level: VerificationLevel) -> Self {
        Self {
            default_level,
            custom_verifiers: HashMap::new(),
            stats: Mutex::new(VerifierStats::default()),
        }
    }

    /// Register a domain verifier for an action; PARANOID level only
    pub fn register_custom_verifier(&mut self, action: &str, verifier: CustomVerifier) {
        self.custom_verifiers.insert(action.to_string(), verifier);
    }

    pub fn stats(&self) -> VerifierStats {
        self.stats.lock().expect("verifier stats lock poisoned").clone()
    }

    /// Verify one task
    pub fn verify_task(
        &self,
        task: &Task,
        level: Option<VerificationLevel>,
        expected_schema: Option<&Map<String, Value>>,
    ) -> VerificationResult {
        let level = level.unwrap_or(self.default_level);
        let mut checks = BTreeMap::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut metadata = Map::new();
        metadata.insert("task_id".to_string(), Value::from(task.task_id.clone()));
        metadata.insert("task_name".to_string(), Value::from(task.name.clone()));
        metadata.insert("task_action".to_string(), Value::from(task.action.clone()));
        metadata.insert("level".to_string(), Value::from(level.to_string()));
        metadata.insert("verified_at".to_string(), Value::from(Utc::now().to_rfc3339()));

        // Check 1: a result exists
        if task.result.is_none() {
            checks.insert("result_exists".to_string(), false);
            errors.push("Task result is None".to_string());
        } else {
            checks.insert("result_exists".to_string(), true);
        }

        // Check 2: no error recorded
        match &task.error {
            Some(error) => {
                checks.insert("no_error".to_string(), false);
                errors.push(format!("Task reported error: {error}"));
            }
            None => {
                checks.insert("no_error".to_string(), true);
            }
        }

        // Check 3: status is terminal-and-expected; a surprise status is
        // only a warning
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            checks.insert("status_coherent".to_string(), true);
        } else {
            checks.insert("status_coherent".to_string(), false);
            warnings.push(format!("Unexpected status: {}", task.status));
        }

        if matches!(level, VerificationLevel::Strict | VerificationLevel::Paranoid) {
            // Check 4: structural schema match
            if let (Some(schema), Some(result)) = (expected_schema, &task.result) {
                let schema_valid = verify_schema(result, schema);
                checks.insert("schema_valid".to_string(), schema_valid);
                if !schema_valid {
                    errors.push("Result does not match expected schema".to_string());
                }
            }

            // Check 5: temporal coherence
            let temporal_ok = verify_temporal_coherence(task);
            checks.insert("temporal_coherent".to_string(), temporal_ok);
            if !temporal_ok {
                warnings.push("Temporal metadata inconsistent".to_string());
            }
        }

        if level == VerificationLevel::Paranoid
            && let Some(custom) = self.custom_verifiers.get(&task.action)
        {
            // Check 6: domain-specific verification
            let custom_result = custom(task);
            checks.insert("custom_verification".to_string(), custom_result.passed);
            errors.extend(custom_result.errors);
            warnings.extend(custom_result.warnings);
        }

        let passed_checks = checks.values().filter(|v| **v).count();
        let confidence_score = if checks.is_empty() {
            0.0
        } else {
            passed_checks as f64 / checks.len() as f64
        };
        let passed = errors.is_empty();

        {
            let mut stats = self.stats.lock().expect("verifier stats lock poisoned");
            stats.total_verifications += 1;
            if passed {
                stats.passed += 1;
            } else {
                stats.failed += 1;
            }
        }
        metrics::record_verification(passed);
        debug!(task_id = %task.task_id, %level, passed, confidence_score, "task verified");

        VerificationResult {
            passed,
            level,
            checks,
            errors,
            warnings,
            confidence_score,
            metadata,
        }
    }

    /// Verify every completed task of a graph
    pub fn verify_graph_results(
        &self,
        graph: &TaskGraph,
        level: Option<VerificationLevel>,
    ) -> HashMap<String, VerificationResult> {
        graph
            .tasks()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.task_id.clone(), self.verify_task(t, level, None)))
            .collect()
    }

    /// Health check over the verifier's own state
    pub fn self_check(&self) -> SelfCheckReport {
        let stats = self.stats();
        let mut checks = BTreeMap::new();
        checks.insert("stats_coherent".to_string(), stats.passed + stats.failed == stats.total_verifications);
        checks.insert("custom_verifiers_registered".to_string(), true);

        let mut registered: Vec<String> = self.custom_verifiers.keys().cloned().collect();
        registered.sort();

        SelfCheckReport {
            passed: checks.values().all(|v| *v),
            checks,
            stats,
            registered_verifiers: registered,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl Default for TaskVerifier {
    fn default() -> Self {
        Self::new(VerificationLevel::Strict)
    }
}

/// Structural schema match, strict
///
/// Two shapes are accepted. Without a `type` key, the schema maps field
/// names to expected types (a type-name string or a nested schema) and
/// the result must be an object carrying every field with the right
/// type. With a `type` key, the result itself is checked against that
/// type plus the optional `required_keys` and `min_length` constraints.
pub fn verify_schema(result: &Value, schema: &Map<String, Value>) -> bool {
    if !schema.contains_key("type") {
        let Value::Object(fields) = result else {
            return false;
        };

        for (key, expected) in schema {
            let Some(actual) = fields.get(key) else {
                return false;
            };
            let ok = match expected {
                Value::String(type_name) => type_matches(actual, type_name),
                Value::Object(nested) => verify_schema(actual, nested),
                _ => false,
            };
            if !ok {
                return false;
            }
        }
        return true;
    }

    let Some(type_name) = schema.get("type").and_then(Value::as_str) else {
        return false;
    };
    if !type_matches(result, type_name) {
        return false;
    }

    if let Some(required) = schema.get("required_keys").and_then(Value::as_array) {
        let Value::Object(fields) = result else {
            return false;
        };
        for key in required {
            let Some(key) = key.as_str() else { return false };
            if !fields.contains_key(key) {
                return false;
            }
        }
    }

    if let Some(min_length) = schema.get("min_length").and_then(Value::as_u64) {
        let length = match result {
            Value::Array(items) => items.len() as u64,
            Value::String(s) => s.len() as u64,
            _ => return true,
        };
        if length < min_length {
            return false;
        }
    }

    true
}

fn type_matches(value: &Value, type_name: &str) -> bool {
    match type_name {
        "str" | "string" => value.is_string(),
        "int" => value.is_i64() || value.is_u64(),
        "float" | "number" => value.is_number(),
        "bool" => value.is_boolean(),
        "dict" | "object" => value.is_object(),
        "list" | "array" => value.is_array(),
        "null" => value.is_null(),
        _ => false,
    }
}

/// created_at <= updated_at <= completed_at, and nothing in the future
fn verify_temporal_coherence(task: &Task) -> bool {
    let meta = &task.metadata;
    let now = Utc::now();

    if meta.created_at > meta.updated_at {
        return false;
    }
    if meta.created_at > now || meta.updated_at > now {
        return false;
    }
    if let Some(completed) = meta.completed_at
        && (meta.updated_at > completed || completed > now)
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn completed_task(result: Value) -> Task {
        let mut task = Task::new("t", "calculate");
        task.update_status(TaskStatus::Completed, None);
        task.set_result(result);
        task
    }

    fn schema_map(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("schema must be an object"),
        }
    }

    #[test]
    fn test_basic_passes_clean_task() {
        let verifier = TaskVerifier::default();
        let task = completed_task(json!({"sum": 42}));

        let result = verifier.verify_task(&task, Some(VerificationLevel::Basic), None);
        assert!(result.passed);
        assert_eq!(result.checks["result_exists"], true);
        assert_eq!(result.checks["no_error"], true);
        assert_eq!(result.checks["status_coherent"], true);
        assert!((result.confidence_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_result_is_error() {
        let verifier = TaskVerifier::default();
        let mut task = Task::new("t", "noop");
        task.update_status(TaskStatus::Completed, None);

        let result = verifier.verify_task(&task, Some(VerificationLevel::Basic), None);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("result is None")));
    }

    #[test]
    fn test_recorded_error_fails_verification() {
        let verifier = TaskVerifier::default();
        let mut task = completed_task(json!(1));
        task.error = Some("boom".to_string());

        let result = verifier.verify_task(&task, Some(VerificationLevel::Basic), None);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("boom")));
    }

    #[test]
    fn test_unexpected_status_is_warning_only() {
        let verifier = TaskVerifier::default();
        let mut task = Task::new("t", "noop");
        task.set_result(json!(1));
        // Still pending: surprising but not an error

        let result = verifier.verify_task(&task, Some(VerificationLevel::Basic), None);
        assert!(result.passed);
        assert_eq!(result.checks["status_coherent"], false);
        assert!(!result.warnings.is_empty());
        assert!(result.confidence_score < 1.0);
    }

    #[test]
    fn test_strict_schema_match() {
        let verifier = TaskVerifier::default();
        let task = completed_task(json!({"sum": 42, "rows": [1, 2]}));
        let schema = schema_map(json!({"sum": "int", "rows": "list"}));

        let result = verifier.verify_task(&task, Some(VerificationLevel::Strict), Some(&schema));
        assert!(result.passed);
        assert_eq!(result.checks["schema_valid"], true);
    }

    #[test]
    fn test_strict_schema_mismatch_is_error() {
        let verifier = TaskVerifier::default();
        let task = completed_task(json!({"sum": "not a number"}));
        let schema = schema_map(json!({"sum": "int"}));

        let result = verifier.verify_task(&task, Some(VerificationLevel::Strict), Some(&schema));
        assert!(!result.passed);
        assert_eq!(result.checks["schema_valid"], false);
    }

    #[test]
    fn test_basic_ignores_schema() {
        let verifier = TaskVerifier::default();
        let task = completed_task(json!({"sum": "wrong type"}));
        let schema = schema_map(json!({"sum": "int"}));

        let result = verifier.verify_task(&task, Some(VerificationLevel::Basic), Some(&schema));
        assert!(result.passed);
        assert!(!result.checks.contains_key("schema_valid"));
    }

    #[test]
    fn test_temporal_coherence_detects_reversal() {
        let verifier = TaskVerifier::default();
        let mut task = completed_task(json!(1));
        task.metadata.created_at = Utc::now() + chrono::Duration::hours(1);

        let result = verifier.verify_task(&task, Some(VerificationLevel::Strict), None);
        assert_eq!(result.checks["temporal_coherent"], false);
        assert!(result.warnings.iter().any(|w| w.contains("Temporal")));
    }

    #[test]
    fn test_paranoid_runs_custom_verifier() {
        let mut verifier = TaskVerifier::new(VerificationLevel::Paranoid);
        verifier.register_custom_verifier(
            "calculate",
            Arc::new(|task: &Task| {
                let mut result = VerificationResult::pass(VerificationLevel::Paranoid);
                if task.result.as_ref().and_then(|r| r.get("sum")).is_none() {
                    result.passed = false;
                    result.errors.push("calculation must produce a sum".to_string());
                }
                result
            }),
        );

        let good = completed_task(json!({"sum": 10}));
        let result = verifier.verify_task(&good, None, None);
        assert!(result.passed);
        assert_eq!(result.checks["custom_verification"], true);

        let bad = completed_task(json!({"product": 10}));
        let result = verifier.verify_task(&bad, None, None);
        assert!(!result.passed);
        assert!(result.errors.iter().any(|e| e.contains("sum")));
    }

    #[test]
    fn test_strict_skips_custom_verifier() {
        let mut verifier = TaskVerifier::new(VerificationLevel::Strict);
        verifier.register_custom_verifier(
            "calculate",
            Arc::new(|_: &Task| {
                let mut result = VerificationResult::pass(VerificationLevel::Paranoid);
                result.passed = false;
                result.errors.push("always fails".to_string());
                result
            }),
        );

        let task = completed_task(json!(1));
        let result = verifier.verify_task(&task, None, None);
        assert!(result.passed);
        assert!(!result.checks.contains_key("custom_verification"));
    }

    #[test]
    fn test_verify_graph_results_covers_completed_only() {
        let verifier = TaskVerifier::default();
        let mut graph = TaskGraph::new();

        let mut done = Task::new("done", "noop");
        done.update_status(TaskStatus::Completed, None);
        done.set_result(json!(1));
        let done_id = done.task_id.clone();
        graph.add_task(done).unwrap();

        let mut failed = Task::new("failed", "noop");
        failed.update_status(TaskStatus::Failed, Some("boom"));
        graph.add_task(failed).unwrap();

        let results = verifier.verify_graph_results(&graph, None);
        assert_eq!(results.len(), 1);
        assert!(results[&done_id].passed);
    }

    #[test]
    fn test_schema_nested_shapes() {
        let schema = schema_map(json!({
            "stats": {"mean": "float", "count": "int"},
            "name": "str",
        }));

        assert!(verify_schema(
            &json!({"stats": {"mean": 1.5, "count": 3}, "name": "run"}),
            &schema
        ));
        assert!(!verify_schema(
            &json!({"stats": {"mean": 1.5}, "name": "run"}),
            &schema
        ));
    }

    #[test]
    fn test_schema_typed_form() {
        let schema = schema_map(json!({"type": "dict", "required_keys": ["a", "b"]}));
        assert!(verify_schema(&json!({"a": 1, "b": 2}), &schema));
        assert!(!verify_schema(&json!({"a": 1}), &schema));

        let schema = schema_map(json!({"type": "list", "min_length": 2}));
        assert!(verify_schema(&json!([1, 2]), &schema));
        assert!(!verify_schema(&json!([1]), &schema));

        let schema = schema_map(json!({"type": "str", "min_length": 3}));
        assert!(verify_schema(&json!("abc"), &schema));
        assert!(!verify_schema(&json!("ab"), &schema));
    }

    #[test]
    fn test_confidence_score_ratio() {
        let verifier = TaskVerifier::default();
        let mut task = Task::new("t", "noop");
        task.update_status(TaskStatus::Completed, None);
        // No result: result_exists fails, no_error passes,
        // status_coherent passes, temporal passes -> 3/4
        let result = verifier.verify_task(&task, Some(VerificationLevel::Strict), None);
        assert!((result.confidence_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_self_check_and_stats() {
        let mut verifier = TaskVerifier::default();
        verifier.register_custom_verifier("calculate", Arc::new(|_| VerificationResult::pass(VerificationLevel::Paranoid)));

        verifier.verify_task(&completed_task(json!(1)), Some(VerificationLevel::Basic), None);
        let mut bad = Task::new("bad", "noop");
        bad.update_status(TaskStatus::Failed, Some("boom"));
        verifier.verify_task(&bad, Some(VerificationLevel::Basic), None);

        let report = verifier.self_check();
        assert!(report.passed);
        assert_eq!(report.stats.total_verifications, 2);
        assert_eq!(report.stats.passed, 1);
        assert_eq!(report.stats.failed, 1);
        assert_eq!(report.registered_verifiers, vec!["calculate".to_string()]);
    }
}
