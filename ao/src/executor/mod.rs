//! Task graph execution
//!
//! Walks a [`TaskGraph`] and drives every task through its action,
//! respecting dependencies and propagating failures. Four modes:
//! sequential, parallel by level, adaptive (which picks one of the
//! former two per graph) and work-stealing (see [`work_stealing`]).
//!
//! The graph is shared as `Arc<RwLock<TaskGraph>>`; the lock is never
//! held across an action invocation - dispatch data is cloned out,
//! status is written back after.

pub mod work_stealing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use auditledger::{ProvenanceStore, ToolTrace, WormLog, sha256_hex};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::actions::ActionRegistry;
use crate::graph::{TaskGraph, TaskPriority, TaskStatus};
use crate::metrics;

pub use work_stealing::{StealStrategy, WorkStealingExecutor, WorkStealingStats};

/// Shared handle to a graph under execution
pub type SharedGraph = Arc<RwLock<TaskGraph>>;

/// Wrap a graph for execution
pub fn share_graph(graph: TaskGraph) -> SharedGraph {
    Arc::new(RwLock::new(graph))
}

/// Execution modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
    #[default]
    Adaptive,
    WorkStealing,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Adaptive => write!(f, "adaptive"),
            Self::WorkStealing => write!(f, "work_stealing"),
        }
    }
}

/// Outcome of one plan execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionResult {
    /// True iff no task of priority >= High failed and the run was not
    /// cancelled or aborted
    pub success: bool,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub skipped_tasks: usize,
    pub total_duration_ms: u64,
    pub task_results: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    /// Stable serialization for audit logs
    pub fn to_value(&self) -> Value {
        json!({
            "success": self.success,
            "completed_tasks": self.completed_tasks,
            "failed_tasks": self.failed_tasks,
            "skipped_tasks": self.skipped_tasks,
            "total_duration_ms": self.total_duration_ms,
            "task_results": self.task_results,
            "errors": self.errors,
            "metadata": self.metadata,
        })
    }
}

/// Cumulative executor statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
}

/// Drives task graphs through their registered actions
pub struct TaskExecutor {
    registry: ActionRegistry,
    strategy: ExecutionStrategy,
    max_workers: usize,
    task_timeout: Duration,
    total_timeout: Option<Duration>,
    steal_strategy: StealStrategy,
    worm: Option<Arc<WormLog>>,
    provenance: Option<Arc<ProvenanceStore>>,
    /// Stop flag of the current (or most recent) run; each execution
    /// installs a fresh flag so stale workers cannot be revived
    stop: std::sync::Mutex<Arc<AtomicBool>>,
    stats: std::sync::Mutex<ExecutorStats>,
}

impl TaskExecutor {
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry,
            strategy: ExecutionStrategy::Adaptive,
            max_workers: 4,
            task_timeout: Duration::from_secs(60),
            total_timeout: None,
            steal_strategy: StealStrategy::LeastLoaded,
            worm: None,
            provenance: None,
            stop: std::sync::Mutex::new(Arc::new(AtomicBool::new(false))),
            stats: std::sync::Mutex::new(ExecutorStats::default()),
        }
    }

    pub fn with_strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Timeout applied to each single action invocation
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Budget for the whole execution; elapsing it cancels the run
    pub fn with_total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Victim selection for work-stealing mode
    pub fn with_steal_strategy(mut self, strategy: StealStrategy) -> Self {
        self.steal_strategy = strategy;
        self
    }

    /// Attach a WORM log receiving one line per task state transition
    pub fn with_worm_log(mut self, worm: Arc<WormLog>) -> Self {
        self.worm = Some(worm);
        self
    }

    /// Attach a provenance store receiving one record per completed task
    pub fn with_provenance(mut self, provenance: Arc<ProvenanceStore>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Request cancellation of the in-flight execution
    ///
    /// Best-effort: dispatching stops, pending and ready tasks become
    /// cancelled, running actions are left to complete or time out.
    pub fn cancel(&self) {
        self.stop.lock().expect("stop lock poisoned").store(true, Ordering::SeqCst);
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Execute a graph under the configured strategy
    ///
    /// Never panics on task failures: action errors, unknown actions and
    /// timeouts become per-task errors; an invariant violation aborts
    /// the run with `metadata.critical_error`.
    pub async fn execute(&self, graph: &SharedGraph) -> ExecutionResult {
        let started_at = Utc::now();
        let started = std::time::Instant::now();
        let trace_id = uuid::Uuid::new_v4().to_string();

        let stop = Arc::new(AtomicBool::new(false));
        *self.stop.lock().expect("stop lock poisoned") = stop.clone();

        let total_tasks = graph.read().expect("graph lock poisoned").len();
        let mut metadata = Map::new();
        metadata.insert("started_at".to_string(), Value::from(started_at.to_rfc3339()));
        metadata.insert("total_tasks".to_string(), Value::from(total_tasks));
        metadata.insert("trace_id".to_string(), Value::from(trace_id.clone()));

        let strategy = self.resolve_strategy(graph, &mut metadata);
        metadata.insert("strategy".to_string(), Value::from(strategy.to_string()));

        self.log_event(&trace_id, "execution", "execution_started", json!({"strategy": strategy.to_string(), "total_tasks": total_tasks}));

        let ctx = DispatchContext {
            registry: self.registry.clone(),
            graph: graph.clone(),
            task_timeout: self.task_timeout,
            max_workers: self.max_workers,
            steal_strategy: self.steal_strategy,
            stop: stop.clone(),
            worm: self.worm.clone(),
            provenance: self.provenance.clone(),
            trace_id: trace_id.clone(),
        };

        let dispatch = async {
            match strategy {
                ExecutionStrategy::Sequential => execute_sequential(&ctx).await,
                ExecutionStrategy::Parallel => execute_parallel(&ctx).await,
                ExecutionStrategy::WorkStealing => work_stealing::execute_work_stealing(&ctx).await,
                ExecutionStrategy::Adaptive => unreachable!("adaptive resolved before dispatch"),
            }
        };

        let outcome = match self.total_timeout {
            Some(limit) => match tokio::time::timeout(limit, dispatch).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(trace_id = %trace_id, "total execution timeout elapsed, cancelling");
                    stop.store(true, Ordering::SeqCst);
                    Ok(DispatchOutcome::default())
                }
            },
            None => dispatch.await,
        };

        let mut result = ExecutionResult {
            metadata,
            ..ExecutionResult::default()
        };

        match outcome {
            Ok(partial) => {
                result.task_results = partial.task_results;
                result.errors = partial.errors;
            }
            Err(critical) => {
                error!(trace_id = %trace_id, error = %critical, "critical execution error");
                result.metadata.insert("critical_error".to_string(), Value::from(critical));
            }
        }

        // Cancellation sweep: anything not yet dispatched will never run
        let cancelled = stop.load(Ordering::SeqCst);
        if cancelled {
            let mut graph = graph.write().expect("graph lock poisoned");
            let pending: Vec<String> = graph
                .tasks()
                .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
                .map(|t| t.task_id.clone())
                .collect();
            for task_id in pending {
                graph.set_status(&task_id, TaskStatus::Cancelled, Some("Execution cancelled"));
            }
            result.metadata.insert("cancelled".to_string(), Value::from(true));
        }

        // Final tallies from the graph itself
        {
            let graph = graph.read().expect("graph lock poisoned");
            result.completed_tasks = graph.count_status(TaskStatus::Completed);
            result.failed_tasks = graph.count_status(TaskStatus::Failed);
            result.skipped_tasks = graph.count_status(TaskStatus::Skipped);

            let critical_failed = graph
                .tasks()
                .any(|t| t.status == TaskStatus::Failed && t.priority.is_critical_path());
            result.success = !critical_failed
                && !cancelled
                && !result.metadata.contains_key("critical_error");

            for task in graph.tasks() {
                if task.status.is_terminal() {
                    metrics::record_task_status(&task.status.to_string());
                }
            }
        }

        result.total_duration_ms = started.elapsed().as_millis() as u64;
        result
            .metadata
            .insert("completed_at".to_string(), Value::from(Utc::now().to_rfc3339()));

        self.log_event(
            &trace_id,
            "execution",
            "execution_finished",
            json!({
                "success": result.success,
                "completed": result.completed_tasks,
                "failed": result.failed_tasks,
                "skipped": result.skipped_tasks,
                "duration_ms": result.total_duration_ms,
            }),
        );

        metrics::record_execution(
            &strategy.to_string(),
            result.success,
            result.total_duration_ms,
            total_tasks,
        );
        {
            let mut stats = self.stats.lock().expect("stats lock poisoned");
            stats.total_executions += 1;
            if result.success {
                stats.successful_executions += 1;
            } else {
                stats.failed_executions += 1;
            }
        }

        info!(
            trace_id = %trace_id,
            %strategy,
            success = result.success,
            completed = result.completed_tasks,
            failed = result.failed_tasks,
            skipped = result.skipped_tasks,
            "execution finished"
        );
        result
    }

    /// Adaptive choice: small graphs and critical tasks run sequential,
    /// everything else runs parallel
    fn resolve_strategy(&self, graph: &SharedGraph, metadata: &mut Map<String, Value>) -> ExecutionStrategy {
        if self.strategy != ExecutionStrategy::Adaptive {
            return self.strategy;
        }

        let (num_tasks, has_critical) = {
            let graph = graph.read().expect("graph lock poisoned");
            let has_critical = graph.tasks().any(|t| t.priority == TaskPriority::Critical);
            (graph.len(), has_critical)
        };

        let (choice, reason) = if num_tasks < 3 || has_critical {
            (ExecutionStrategy::Sequential, "Few tasks or critical priority")
        } else {
            (ExecutionStrategy::Parallel, "Multiple independent tasks")
        };

        metadata.insert("adaptive_choice".to_string(), Value::from(choice.to_string()));
        metadata.insert("adaptive_reason".to_string(), Value::from(reason));
        debug!(choice = %choice, reason, "adaptive strategy resolved");
        choice
    }

    fn log_event(&self, trace_id: &str, actor: &str, event: &str, fields: Value) {
        if let Some(worm) = &self.worm {
            write_worm_event(worm, trace_id, actor, event, fields);
        }
    }
}

/// Everything a dispatch loop needs, cloned per execution
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub registry: ActionRegistry,
    pub graph: SharedGraph,
    pub task_timeout: Duration,
    pub max_workers: usize,
    pub steal_strategy: StealStrategy,
    pub stop: Arc<AtomicBool>,
    pub worm: Option<Arc<WormLog>>,
    pub provenance: Option<Arc<ProvenanceStore>>,
    pub trace_id: String,
}

#[derive(Debug, Default)]
pub(crate) struct DispatchOutcome {
    pub task_results: HashMap<String, Value>,
    pub errors: HashMap<String, String>,
}

/// Dispatch data cloned out of the graph before invocation
#[derive(Debug, Clone)]
pub(crate) struct TaskDispatch {
    pub task_id: String,
    pub action: String,
    pub params: Map<String, Value>,
}

impl DispatchContext {
    /// One WORM line per task state transition
    pub(crate) fn log_transition(&self, task_id: &str, event: &str, fields: Value) {
        if let Some(worm) = &self.worm {
            let mut payload = json!({"task_id": task_id});
            merge(&mut payload, fields);
            write_worm_event(worm, &self.trace_id, "executor", event, payload);
        }
    }

    /// Emit the provenance record for a completed task
    pub(crate) fn track_completion(&self, dispatch: &TaskDispatch, result: &Value, start: &str, end: &str) {
        if let Some(store) = &self.provenance {
            let input_hash = sha256_hex(Value::Object(dispatch.params.clone()).to_string().as_bytes());
            let output_hash = sha256_hex(result.to_string().as_bytes());
            store.track_tool_execution(ToolTrace {
                tool_name: &dispatch.action,
                input_hash: &input_hash,
                output_hash: &output_hash,
                task_id: &dispatch.task_id,
                start_time: start,
                end_time: end,
            });
        }
    }

    /// Mark a task failed, record its error and skip its dependents
    pub(crate) fn fail_task(&self, outcome: &mut DispatchOutcome, task_id: &str, message: &str) {
        let mut graph = self.graph.write().expect("graph lock poisoned");
        graph.set_status(task_id, TaskStatus::Failed, Some(message));
        graph.propagate_failure(task_id);
        drop(graph);

        outcome.errors.insert(task_id.to_string(), message.to_string());
        self.log_transition(task_id, "task_failed", json!({"error": message}));
    }

    /// Mark a task completed and record its result
    pub(crate) fn complete_task(&self, outcome: &mut DispatchOutcome, dispatch: &TaskDispatch, result: Value, start: &str) {
        {
            // Status first: set_result stamps completed_at, which must
            // not precede updated_at
            let mut graph = self.graph.write().expect("graph lock poisoned");
            graph.set_status(&dispatch.task_id, TaskStatus::Completed, None);
            graph.set_result(&dispatch.task_id, result.clone());
        }
        let end = Utc::now().to_rfc3339();
        self.track_completion(dispatch, &result, start, &end);
        self.log_transition(&dispatch.task_id, "task_completed", json!({}));
        outcome.task_results.insert(dispatch.task_id.clone(), result);
    }
}

fn merge(target: &mut Value, extra: Value) {
    if let (Value::Object(target), Value::Object(extra)) = (target, extra) {
        target.extend(extra);
    }
}

pub(crate) fn write_worm_event(worm: &WormLog, trace_id: &str, actor: &str, event: &str, fields: Value) {
    let mut line = json!({
        "ts": Utc::now().to_rfc3339(),
        "trace_id": trace_id,
        "span_id": &uuid::Uuid::new_v4().simple().to_string()[..16],
        "level": "info",
        "actor": actor,
        "event": event,
    });
    merge(&mut line, fields);
    if !worm.append(&line.to_string()) {
        // Auditability degraded; the task itself carries on
        warn!(event, "failed to append execution event to WORM log");
    }
}

/// Invoke one action under the per-task timeout
///
/// Unknown actions, raised errors and timeouts all map to the error
/// string that ends up on the task.
pub(crate) async fn invoke_action(
    registry: &ActionRegistry,
    dispatch: &TaskDispatch,
    timeout: Duration,
) -> Result<Value, String> {
    let Some(action) = registry.get(&dispatch.action) else {
        return Err(format!("Unknown action '{}'", dispatch.action));
    };

    match tokio::time::timeout(timeout, action.invoke(&dispatch.params)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(format!("Action '{}' failed: {e:#}", dispatch.action)),
        Err(_) => Err(format!("timeout after {}s", timeout.as_secs())),
    }
}

/// Sequential mode: walk the topological order one task at a time
async fn execute_sequential(ctx: &DispatchContext) -> Result<DispatchOutcome, String> {
    let sorted = {
        let graph = ctx.graph.read().expect("graph lock poisoned");
        let sorted = graph.topological_sort().map_err(|e| e.to_string())?;
        if sorted.len() != graph.len() {
            return Err("topological sort returned fewer tasks than the graph holds".to_string());
        }
        sorted
    };

    let mut outcome = DispatchOutcome::default();

    for task in sorted {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        let (dispatch, runnable) = {
            let mut graph = ctx.graph.write().expect("graph lock poisoned");
            let current = graph.get(&task.task_id).expect("sorted task exists").clone();

            // Propagation may already have skipped it
            if current.status.is_terminal() {
                (None, false)
            } else if !graph.dependencies_completed(&task.task_id) {
                graph.set_status(&task.task_id, TaskStatus::Skipped, Some("Dependency failed"));
                (None, false)
            } else {
                graph.set_status(&task.task_id, TaskStatus::Running, None);
                (
                    Some(TaskDispatch {
                        task_id: current.task_id,
                        action: current.action,
                        params: current.params,
                    }),
                    true,
                )
            }
        };

        if !runnable {
            continue;
        }
        let dispatch = dispatch.expect("runnable task has dispatch data");
        ctx.log_transition(&dispatch.task_id, "task_started", json!({"action": dispatch.action}));

        let start = Utc::now().to_rfc3339();
        match invoke_action(&ctx.registry, &dispatch, ctx.task_timeout).await {
            Ok(result) => ctx.complete_task(&mut outcome, &dispatch, result, &start),
            Err(message) => ctx.fail_task(&mut outcome, &dispatch.task_id, &message),
        }
    }

    Ok(outcome)
}

/// Level-parallel mode: each level fully completes before the next
/// starts; within a level completion order is unspecified
async fn execute_parallel(ctx: &DispatchContext) -> Result<DispatchOutcome, String> {
    let levels = {
        let graph = ctx.graph.read().expect("graph lock poisoned");
        graph.get_parallelizable_levels().map_err(|e| e.to_string())?
    };

    let mut outcome = DispatchOutcome::default();
    let semaphore = Arc::new(Semaphore::new(ctx.max_workers));

    for level in levels {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        let mut join_set: JoinSet<(TaskDispatch, String, Result<Value, String>)> = JoinSet::new();

        for task in level {
            let dispatch = {
                let mut graph = ctx.graph.write().expect("graph lock poisoned");
                let current = graph.get(&task.task_id).expect("level task exists").clone();

                if current.status.is_terminal() {
                    continue;
                }
                if !graph.dependencies_completed(&task.task_id) {
                    graph.set_status(&task.task_id, TaskStatus::Skipped, Some("Dependency failed"));
                    continue;
                }
                graph.set_status(&task.task_id, TaskStatus::Running, None);
                TaskDispatch {
                    task_id: current.task_id,
                    action: current.action,
                    params: current.params,
                }
            };

            ctx.log_transition(&dispatch.task_id, "task_started", json!({"action": dispatch.action}));

            let registry = ctx.registry.clone();
            let timeout = ctx.task_timeout;
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                let start = Utc::now().to_rfc3339();
                let result = invoke_action(&registry, &dispatch, timeout).await;
                (dispatch, start, result)
            });
        }

        // Level barrier: wait for every submitted task
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((dispatch, start, Ok(result))) => {
                    ctx.complete_task(&mut outcome, &dispatch, result, &start);
                }
                Ok((dispatch, _, Err(message))) => {
                    ctx.fail_task(&mut outcome, &dispatch.task_id, &message);
                }
                Err(join_error) => {
                    // A panicking action is an action failure, not ours
                    return Err(format!("worker task panicked: {join_error}"));
                }
            }
        }
    }

    Ok(outcome)
}
