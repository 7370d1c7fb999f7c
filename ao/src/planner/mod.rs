//! Hierarchical task planner
//!
//! Decomposes a user query into a validated [`TaskGraph`] via one of
//! three strategies: a rule table for common shapes, LLM decomposition
//! for everything else, or the hybrid of both. Every strategy ends in
//! the same validation: non-empty graph, topologically sortable, every
//! action registered (or the `generic_execute` fallback), and the plan
//! shape accepted by the policy guard.

pub mod cache;
mod rules;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::actions::ActionRegistry;
use crate::graph::{GraphError, Task, TaskGraph, TaskPriority};
use crate::llm::{GenerationConfig, ModelClient};
use crate::metrics;
use crate::policy::{PolicyError, PolicyGuard};

pub use cache::{CacheStats, PlanCache};
pub use rules::{Rule, RuleTemplate};

/// Decomposition strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanningStrategy {
    RuleBased,
    LlmBased,
    #[default]
    Hybrid,
}

impl std::fmt::Display for PlanningStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RuleBased => write!(f, "rule_based"),
            Self::LlmBased => write!(f, "llm_based"),
            Self::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Planning failures
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("Failed to parse LLM response as JSON: {0}")]
    DecompositionFailed(String),

    #[error("LLM-based planning requires a model client")]
    ModelRequired,

    #[error("Plan must contain at least one task")]
    EmptyPlan,

    #[error("Unknown action '{action}' in task {task}")]
    UnknownAction { action: String, task: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Output of one planning run
#[derive(Debug, Clone)]
pub struct PlanningResult {
    pub graph: TaskGraph,
    pub strategy_used: PlanningStrategy,
    /// Confidence in [0, 1]
    pub confidence: f64,
    pub reasoning: String,
    pub metadata: Map<String, Value>,
}

impl PlanningResult {
    fn new(graph: TaskGraph, strategy: PlanningStrategy, confidence: f64, reasoning: String) -> Self {
        let mut metadata = Map::new();
        metadata.insert("planned_at".to_string(), Value::from(Utc::now().to_rfc3339()));
        Self {
            graph,
            strategy_used: strategy,
            confidence,
            reasoning,
            metadata,
        }
    }

    /// Stable serialization for audit logs
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "graph": self.graph.to_value(),
            "strategy_used": self.strategy_used.to_string(),
            "confidence": self.confidence,
            "reasoning": self.reasoning,
            "metadata": self.metadata,
        })
    }
}

/// LLM decomposition output contract
#[derive(Debug, Deserialize)]
struct DecompositionOutput {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskSpec {
    #[serde(default = "default_task_name")]
    name: String,
    #[serde(default = "default_task_action")]
    action: String,
    #[serde(default)]
    params: Map<String, Value>,
    /// Indices into the emitted task array
    #[serde(default)]
    depends_on: Vec<usize>,
    #[serde(default = "default_task_priority")]
    priority: u8,
}

fn default_task_name() -> String {
    "unnamed_task".to_string()
}

fn default_task_action() -> String {
    "generic_execute".to_string()
}

fn default_task_priority() -> u8 {
    TaskPriority::Normal.value()
}

/// Converts queries into validated task graphs
pub struct Planner {
    model: Option<Arc<dyn ModelClient>>,
    registry: Option<ActionRegistry>,
    policy: Option<Arc<PolicyGuard>>,
    cache: Option<Arc<PlanCache>>,
}

impl Planner {
    pub fn new() -> Self {
        Self {
            model: None,
            registry: None,
            policy: None,
            cache: None,
        }
    }

    /// Attach the model collaborator used by LLM-based planning
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Attach the executor's action registry for validation
    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Attach a policy guard consulted before any plan is returned
    pub fn with_policy(mut self, policy: Arc<PolicyGuard>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Attach a plan cache consulted before decomposition
    pub fn with_cache(mut self, cache: Arc<PlanCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Plan the execution of a query
    pub async fn plan(
        &self,
        query: &str,
        strategy: PlanningStrategy,
        context: Option<&Map<String, Value>>,
    ) -> Result<PlanningResult, PlanningError> {
        let started = std::time::Instant::now();

        if let Some(cache) = &self.cache {
            let key = PlanCache::key(query, strategy, context);
            if let Some(cached) = cache.get(&key) {
                debug!(%strategy, "planner cache hit");
                metrics::record_cache_event("hit");
                return Ok(cached);
            }
            metrics::record_cache_event("miss");
        }

        let outcome = self.plan_uncached(query, strategy, context).await;

        match &outcome {
            Ok(result) => {
                metrics::record_planning(strategy, true, result.confidence, result.graph.len());
                info!(
                    %strategy,
                    tasks = result.graph.len(),
                    confidence = result.confidence,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "planning complete"
                );
            }
            Err(e) => {
                metrics::record_planning(strategy, false, 0.0, 0);
                warn!(%strategy, error = %e, "planning failed");
            }
        }

        outcome
    }

    async fn plan_uncached(
        &self,
        query: &str,
        strategy: PlanningStrategy,
        context: Option<&Map<String, Value>>,
    ) -> Result<PlanningResult, PlanningError> {
        let mut result = match strategy {
            PlanningStrategy::RuleBased => self.plan_rule_based(query),
            PlanningStrategy::LlmBased => self.plan_llm_based(query).await?,
            PlanningStrategy::Hybrid => self.plan_hybrid(query).await,
        };

        self.validate_plan(&result.graph)?;
        if let Some(policy) = &self.policy {
            policy.validate_plan(result.graph.len(), &result.graph.action_names())?;
        }

        result
            .metadata
            .insert("completed_at".to_string(), Value::from(Utc::now().to_rfc3339()));
        result.metadata.insert("validation_passed".to_string(), Value::from(true));
        if let Some(ctx) = context {
            result
                .metadata
                .insert("context".to_string(), Value::Object(ctx.clone()));
        }

        if let Some(cache) = &self.cache {
            let key = PlanCache::key(query, strategy, context);
            cache.put(&key, result.clone());
        }

        Ok(result)
    }

    /// Rule-based decomposition: first matching pattern wins
    fn plan_rule_based(&self, query: &str) -> PlanningResult {
        for rule in rules::RULES.iter() {
            let Some(captures) = rule.pattern.captures(query) else {
                continue;
            };

            let mut graph = TaskGraph::new();
            let mut created: Vec<String> = Vec::new();

            for (i, template) in rule.templates.iter().enumerate() {
                let input = match template.extract {
                    Some(group) => captures
                        .get(group)
                        .map(|m| m.as_str().trim().to_string())
                        .unwrap_or_else(|| query.to_string()),
                    None => query.to_string(),
                };

                let depends_on = template.depends_on.iter().map(|idx| created[*idx].clone()).collect();
                let task = Task::new(format!("{}_{}", template.action, i), template.action)
                    .with_param("input", input)
                    .with_depends_on(depends_on);

                created.push(task.task_id.clone());
                graph
                    .add_task(task)
                    .expect("rule templates only reference earlier tasks");
            }

            let reasoning = format!(
                "Rule-based decomposition: Matched pattern '{}'.",
                rule.pattern.as_str()
            );
            return PlanningResult::new(graph, PlanningStrategy::RuleBased, 0.8, reasoning);
        }

        // Fallback: a single generic task carrying the raw query
        let mut graph = TaskGraph::new();
        let task = Task::new("execute_query", "generic_execute").with_param("query", query);
        graph.add_task(task).expect("single task cannot conflict");

        PlanningResult::new(
            graph,
            PlanningStrategy::RuleBased,
            0.5,
            "Rule-based decomposition: No pattern matched. Created single task.".to_string(),
        )
    }

    /// LLM-based decomposition through the model collaborator
    async fn plan_llm_based(&self, query: &str) -> Result<PlanningResult, PlanningError> {
        let model = self.model.as_ref().ok_or(PlanningError::ModelRequired)?;

        let system_prompt = DECOMPOSITION_SYSTEM_PROMPT;
        let user_prompt = self.build_decomposition_prompt(query);

        let response = model
            .generate(&user_prompt, &GenerationConfig::deterministic(), Some(system_prompt))
            .await
            .map_err(|e| PlanningError::DecompositionFailed(e.to_string()))?;

        let decomposition = parse_decomposition(&response.text)?;
        let graph = self.build_graph_from_decomposition(&decomposition)?;

        let reasoning = decomposition
            .reasoning
            .unwrap_or_else(|| "LLM decomposition".to_string());
        Ok(PlanningResult::new(graph, PlanningStrategy::LlmBased, 0.9, reasoning))
    }

    /// Hybrid: rules first, LLM refinement only when confidence is low
    async fn plan_hybrid(&self, query: &str) -> PlanningResult {
        let mut rule_result = self.plan_rule_based(query);

        if rule_result.confidence >= 0.7 {
            rule_result.strategy_used = PlanningStrategy::Hybrid;
            rule_result.reasoning = format!("Hybrid (rule-based sufficient): {}", rule_result.reasoning);
            return rule_result;
        }

        match self.plan_llm_based(query).await {
            Ok(mut llm_result) => {
                llm_result.strategy_used = PlanningStrategy::Hybrid;
                llm_result.reasoning = format!("Hybrid (LLM refinement): {}", llm_result.reasoning);
                llm_result
            }
            Err(e) => {
                debug!(error = %e, "hybrid planning: LLM leg failed, keeping rule result");
                rule_result.strategy_used = PlanningStrategy::Hybrid;
                rule_result.reasoning = format!("Hybrid (LLM failed, fallback to rules): {}", rule_result.reasoning);
                rule_result
            }
        }
    }

    fn build_decomposition_prompt(&self, query: &str) -> String {
        format!(
            r#"Decompose this query into atomic tasks:

Query: {query}

Respond ONLY with valid JSON in this format:
{{
  "tasks": [
    {{
      "name": "descriptive_name",
      "action": "action_name",
      "params": {{"key": "value"}},
      "depends_on": [indices of required tasks],
      "priority": 3
    }}
  ],
  "reasoning": "Why this decomposition"
}}

Available actions: {}"#,
            self.available_actions().join(", ")
        )
    }

    fn available_actions(&self) -> Vec<String> {
        match &self.registry {
            Some(registry) => registry.names(),
            None => DEFAULT_ACTIONS.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn build_graph_from_decomposition(&self, decomposition: &DecompositionOutput) -> Result<TaskGraph, PlanningError> {
        let mut graph = TaskGraph::new();
        let mut created: Vec<String> = Vec::new();

        for spec in &decomposition.tasks {
            let priority = TaskPriority::try_from(spec.priority)
                .map_err(PlanningError::DecompositionFailed)?;

            // Resolve dependency indices to generated task identifiers;
            // out-of-range indices are dropped
            let depends_on: Vec<String> = spec
                .depends_on
                .iter()
                .filter(|idx| **idx < created.len())
                .map(|idx| created[*idx].clone())
                .collect();

            let task = Task::new(&spec.name, &spec.action)
                .with_params(spec.params.clone())
                .with_depends_on(depends_on)
                .with_priority(priority);

            created.push(task.task_id.clone());
            graph.add_task(task)?;
        }

        Ok(graph)
    }

    /// Defense-in-depth validation applied after every strategy
    fn validate_plan(&self, graph: &TaskGraph) -> Result<(), PlanningError> {
        if graph.is_empty() {
            return Err(PlanningError::EmptyPlan);
        }

        // Acyclicity is a TaskGraph invariant; re-check anyway
        graph.topological_sort()?;

        if let Some(registry) = &self.registry {
            for task in graph.tasks() {
                if !registry.contains(&task.action) && task.action != "generic_execute" {
                    return Err(PlanningError::UnknownAction {
                        action: task.action.clone(),
                        task: task.task_id.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for Planner {
    fn default() -> Self {
        Self::new()
    }
}

/// The model's reply is untrusted text: strip surrounding code fences
/// and parse defensively; any parse error is a decomposition failure.
fn parse_decomposition(response: &str) -> Result<DecompositionOutput, PlanningError> {
    let cleaned = strip_code_fences(response);
    serde_json::from_str(cleaned.trim()).map_err(|e| {
        let preview: String = response.chars().take(200).collect();
        PlanningError::DecompositionFailed(format!("{e}\nResponse: {preview}"))
    })
}

fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 2 {
        return trimmed.to_string();
    }
    let end = if lines[lines.len() - 1].trim_start().starts_with("```") {
        lines.len() - 1
    } else {
        lines.len()
    };
    lines[1..end].join("\n")
}

const DEFAULT_ACTIONS: &[&str] = &[
    "read_file",
    "write_file",
    "search",
    "calculate",
    "analyze_data",
    "generate_report",
    "execute_code",
];

const DECOMPOSITION_SYSTEM_PROMPT: &str = r#"You are an expert at decomposing complex tasks.

Your role:
- Analyze user queries
- Break them into atomic sub-tasks
- Identify dependencies between tasks
- Assign appropriate priorities

Principles:
- Atomic tasks (1 action = 1 task)
- Explicit dependencies (a task runs only once its dependencies complete)
- Maximal parallelization (independent tasks)
- Consistent priorities (CRITICAL=5, HIGH=4, NORMAL=3, LOW=2, OPTIONAL=1)
- Dependencies are expressed as indices into the emitted task array

ALWAYS respond with valid JSON, no markdown."#;
