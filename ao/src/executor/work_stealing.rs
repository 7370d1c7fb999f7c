//! Work-stealing execution
//!
//! N long-lived workers, each owning a double-ended queue. Owners push
//! and pop at the tail; an idle worker steals from a victim's head.
//! Victim selection is configurable: random shuffle, round-robin from
//! the next peer, or most-loaded first. Queue operations take the
//! per-queue mutex; the shared statistics take a separate global mutex,
//! and no worker ever holds two queue locks at once.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DispatchContext, DispatchOutcome, TaskDispatch, invoke_action};
use crate::graph::TaskStatus;
use crate::metrics;

/// Victim selection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StealStrategy {
    /// Shuffle peers uniformly
    Random,
    /// Try peers starting from `(self + 1) mod N`
    RoundRobin,
    /// Try the most loaded peer first
    #[default]
    LeastLoaded,
}

impl std::fmt::Display for StealStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::RoundRobin => write!(f, "round_robin"),
            Self::LeastLoaded => write!(f, "least_loaded"),
        }
    }
}

/// One unit of queued work
pub(crate) struct WorkItem {
    pub dispatch: TaskDispatch,
    pub ctx: DispatchContext,
    pub outcome: Arc<Mutex<DispatchOutcome>>,
}

/// Per-worker deque
///
/// Owner push/pop at the tail keeps the cache warm; thieves take from
/// the head.
struct WorkerQueue {
    queue: Mutex<VecDeque<WorkItem>>,
}

impl WorkerQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, item: WorkItem) {
        self.queue.lock().expect("queue lock poisoned").push_back(item);
    }

    fn pop(&self) -> Option<WorkItem> {
        self.queue.lock().expect("queue lock poisoned").pop_back()
    }

    fn steal(&self) -> Option<WorkItem> {
        self.queue.lock().expect("queue lock poisoned").pop_front()
    }

    fn len(&self) -> usize {
        self.queue.lock().expect("queue lock poisoned").len()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total_tasks_completed: u64,
    total_tasks_failed: u64,
    total_tasks_stolen: u64,
    successful_steals: u64,
    failed_steals: u64,
    total_steal_attempts: u64,
}

/// Snapshot of the pool's counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkStealingStats {
    pub total_tasks_completed: u64,
    pub total_tasks_failed: u64,
    pub total_tasks_stolen: u64,
    pub successful_steals: u64,
    pub failed_steals: u64,
    pub total_steal_attempts: u64,
    pub steal_success_rate: f64,
    pub num_workers: usize,
    pub steal_strategy: String,
    pub queue_sizes: Vec<usize>,
}

/// Load-balanced executor with one deque per worker
pub struct WorkStealingExecutor {
    num_workers: usize,
    steal_strategy: StealStrategy,
    queues: Arc<Vec<WorkerQueue>>,
    stop: Arc<AtomicBool>,
    /// Caller-owned kill switch; keeps workers from outliving a
    /// dispatcher whose future was dropped mid-run
    external_stop: Option<Arc<AtomicBool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<Mutex<StatsInner>>,
}

impl WorkStealingExecutor {
    pub fn new(num_workers: usize, steal_strategy: StealStrategy) -> Self {
        let num_workers = num_workers.max(1);
        Self {
            num_workers,
            steal_strategy,
            queues: Arc::new((0..num_workers).map(|_| WorkerQueue::new()).collect()),
            stop: Arc::new(AtomicBool::new(false)),
            external_stop: None,
            workers: Mutex::new(Vec::new()),
            stats: Arc::new(Mutex::new(StatsInner::default())),
        }
    }

    /// Also observe a caller-owned stop flag
    pub fn with_external_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.external_stop = Some(stop);
        self
    }

    /// Spawn the worker tasks; repeated calls are a no-op
    pub fn start(&self) {
        let mut workers = self.workers.lock().expect("workers lock poisoned");
        if !workers.is_empty() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);

        for worker_id in 0..self.num_workers {
            let queues = self.queues.clone();
            let mut stop_flags = vec![self.stop.clone()];
            if let Some(external) = &self.external_stop {
                stop_flags.push(external.clone());
            }
            let stats = self.stats.clone();
            let strategy = self.steal_strategy;
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, queues, stop_flags, stats, strategy).await;
            }));
        }
        debug!(workers = self.num_workers, strategy = %self.steal_strategy, "work-stealing pool started");
    }

    /// Signal the stop flag and join the workers; repeated calls are a
    /// no-op
    pub async fn shutdown(&self, timeout: Option<Duration>) {
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers lock poisoned");
            workers.drain(..).collect()
        };
        if handles.is_empty() {
            return;
        }

        self.stop.store(true, Ordering::SeqCst);
        for handle in handles {
            match timeout {
                Some(limit) => {
                    if tokio::time::timeout(limit, handle).await.is_err() {
                        warn!("work-stealing worker did not stop within the shutdown timeout");
                    }
                }
                None => {
                    let _ = handle.await;
                }
            }
        }
        debug!("work-stealing pool stopped");
    }

    /// Submit one item; without an explicit owner, the task identifier
    /// hashes to a stable home queue
    pub(crate) fn submit(&self, item: WorkItem, worker_id: Option<usize>) {
        let worker_id = worker_id.unwrap_or_else(|| {
            let mut hasher = DefaultHasher::new();
            item.dispatch.task_id.hash(&mut hasher);
            (hasher.finish() as usize) % self.num_workers
        });
        self.queues[worker_id % self.num_workers].push(item);
    }

    /// Submit a batch round-robin across the queues
    pub(crate) fn submit_batch(&self, items: Vec<WorkItem>) {
        for (i, item) in items.into_iter().enumerate() {
            self.submit(item, Some(i % self.num_workers));
        }
    }

    /// Number of items currently queued across all workers
    pub fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn stats(&self) -> WorkStealingStats {
        let inner = self.stats.lock().expect("stats lock poisoned");
        let total_steals = inner.successful_steals + inner.failed_steals;
        WorkStealingStats {
            total_tasks_completed: inner.total_tasks_completed,
            total_tasks_failed: inner.total_tasks_failed,
            total_tasks_stolen: inner.total_tasks_stolen,
            successful_steals: inner.successful_steals,
            failed_steals: inner.failed_steals,
            total_steal_attempts: inner.total_steal_attempts,
            steal_success_rate: if total_steals > 0 {
                inner.successful_steals as f64 / total_steals as f64
            } else {
                0.0
            },
            num_workers: self.num_workers,
            steal_strategy: self.steal_strategy.to_string(),
            queue_sizes: self.queues.iter().map(|q| q.len()).collect(),
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queues: Arc<Vec<WorkerQueue>>,
    stop_flags: Vec<Arc<AtomicBool>>,
    stats: Arc<Mutex<StatsInner>>,
    strategy: StealStrategy,
) {
    while !stop_flags.iter().any(|flag| flag.load(Ordering::SeqCst)) {
        // Own queue first, then steal
        let item = queues[worker_id]
            .pop()
            .or_else(|| steal_task(worker_id, &queues, &stats, strategy));

        let Some(item) = item else {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        };

        let failed = run_item(item).await;
        let mut stats = stats.lock().expect("stats lock poisoned");
        if failed {
            stats.total_tasks_failed += 1;
        } else {
            stats.total_tasks_completed += 1;
        }
    }
}

/// Execute one queued item; returns true when the task failed
async fn run_item(item: WorkItem) -> bool {
    let WorkItem { dispatch, ctx, outcome } = item;

    // Claim the task; anything no longer pending/ready was cancelled or
    // reassigned while queued
    {
        let mut graph = ctx.graph.write().expect("graph lock poisoned");
        let Some(task) = graph.get(&dispatch.task_id) else {
            return false;
        };
        if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
            return false;
        }
        graph.set_status(&dispatch.task_id, TaskStatus::Running, None);
    }
    ctx.log_transition(&dispatch.task_id, "task_started", json!({"action": dispatch.action}));

    let start = Utc::now().to_rfc3339();
    match invoke_action(&ctx.registry, &dispatch, ctx.task_timeout).await {
        Ok(result) => {
            let mut outcome = outcome.lock().expect("outcome lock poisoned");
            ctx.complete_task(&mut outcome, &dispatch, result, &start);
            false
        }
        Err(message) => {
            let mut outcome = outcome.lock().expect("outcome lock poisoned");
            ctx.fail_task(&mut outcome, &dispatch.task_id, &message);
            true
        }
    }
}

fn steal_task(
    worker_id: usize,
    queues: &Arc<Vec<WorkerQueue>>,
    stats: &Arc<Mutex<StatsInner>>,
    strategy: StealStrategy,
) -> Option<WorkItem> {
    {
        let mut stats = stats.lock().expect("stats lock poisoned");
        stats.total_steal_attempts += 1;
    }

    let targets = match strategy {
        StealStrategy::Random => random_targets(worker_id, queues.len()),
        StealStrategy::RoundRobin => round_robin_targets(worker_id, queues.len()),
        StealStrategy::LeastLoaded => most_loaded_targets(worker_id, queues),
    };

    for target in targets {
        if let Some(item) = queues[target].steal() {
            let mut stats = stats.lock().expect("stats lock poisoned");
            stats.total_tasks_stolen += 1;
            stats.successful_steals += 1;
            drop(stats);
            metrics::record_steal_event("steal_success");
            return Some(item);
        }
    }

    let mut stats = stats.lock().expect("stats lock poisoned");
    stats.failed_steals += 1;
    drop(stats);
    metrics::record_steal_event("steal_failed");
    None
}

fn random_targets(worker_id: usize, n: usize) -> Vec<usize> {
    let mut targets: Vec<usize> = (0..n).filter(|i| *i != worker_id).collect();
    targets.shuffle(&mut rand::thread_rng());
    targets
}

fn round_robin_targets(worker_id: usize, n: usize) -> Vec<usize> {
    (1..n).map(|i| (worker_id + i) % n).collect()
}

/// Most loaded peer first: a bigger queue is tried before a smaller one
fn most_loaded_targets(worker_id: usize, queues: &Arc<Vec<WorkerQueue>>) -> Vec<usize> {
    let mut loads: Vec<(usize, usize)> = queues
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != worker_id)
        .map(|(i, q)| (q.len(), i))
        .collect();
    loads.sort_by(|a, b| b.0.cmp(&a.0));
    loads.into_iter().map(|(_, i)| i).collect()
}

/// Work-stealing dispatch loop used by the task executor
///
/// Ready tasks are submitted as their dependencies complete; the loop
/// ends when every task is terminal or the stop flag is raised.
pub(crate) async fn execute_work_stealing(ctx: &DispatchContext) -> Result<DispatchOutcome, String> {
    let pool =
        WorkStealingExecutor::new(ctx.max_workers, ctx.steal_strategy).with_external_stop(ctx.stop.clone());
    pool.start();

    let outcome = Arc::new(Mutex::new(DispatchOutcome::default()));
    let mut submitted: HashSet<String> = HashSet::new();

    loop {
        if ctx.stop.load(Ordering::SeqCst) {
            break;
        }

        // Submit newly ready tasks
        let ready = {
            let mut graph = ctx.graph.write().expect("graph lock poisoned");
            graph.get_ready_tasks()
        };
        for task in ready {
            if submitted.insert(task.task_id.clone()) {
                pool.submit(
                    WorkItem {
                        dispatch: TaskDispatch {
                            task_id: task.task_id,
                            action: task.action,
                            params: task.params,
                        },
                        ctx: ctx.clone(),
                        outcome: outcome.clone(),
                    },
                    None,
                );
            }
        }

        // Tasks whose dependencies can never complete will not become
        // ready; skip them so the loop terminates
        {
            let mut graph = ctx.graph.write().expect("graph lock poisoned");
            let blocked: Vec<String> = graph
                .tasks()
                .filter(|t| {
                    t.status == TaskStatus::Pending
                        && t.depends_on.iter().any(|dep| {
                            graph.get(dep).is_some_and(|d| {
                                matches!(d.status, TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled)
                            })
                        })
                })
                .map(|t| t.task_id.clone())
                .collect();
            for task_id in blocked {
                graph.set_status(&task_id, TaskStatus::Skipped, Some("Dependency failed"));
            }
        }

        let all_terminal = {
            let graph = ctx.graph.read().expect("graph lock poisoned");
            graph.tasks().all(|t| t.status.is_terminal())
        };
        if all_terminal {
            break;
        }

        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    pool.shutdown(Some(Duration::from_secs(2))).await;
    debug!(stats = ?pool.stats(), "work-stealing dispatch finished");

    // A cancelled run may leave undispatched items in the queues; they
    // hold clones of the outcome handle, so release them first
    drop(pool);

    let outcome = Arc::try_unwrap(outcome)
        .map_err(|_| "work-stealing outcome still shared after shutdown".to_string())?
        .into_inner()
        .map_err(|_| "work-stealing outcome lock poisoned".to_string())?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionRegistry;
    use crate::executor::{ExecutionStrategy, TaskExecutor, share_graph};
    use crate::graph::{Task, TaskGraph, TaskPriority};
    use serde_json::Value;

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::standard();
        registry.register_fn("ok", |_| Ok(Value::from("done")));
        registry.register_fn("boom", |_| eyre::bail!("kaboom"));
        registry
    }

    #[test]
    fn test_round_robin_targets_start_at_next_peer() {
        assert_eq!(round_robin_targets(1, 4), vec![2, 3, 0]);
        assert_eq!(round_robin_targets(3, 4), vec![0, 1, 2]);
        assert!(round_robin_targets(0, 1).is_empty());
    }

    #[test]
    fn test_random_targets_exclude_self() {
        let targets = random_targets(2, 5);
        assert_eq!(targets.len(), 4);
        assert!(!targets.contains(&2));
    }

    #[test]
    fn test_most_loaded_targets_exclude_self() {
        let queues: Arc<Vec<WorkerQueue>> = Arc::new((0..3).map(|_| WorkerQueue::new()).collect());
        let targets = most_loaded_targets(0, &queues);
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&0));
    }

    #[tokio::test]
    async fn test_work_stealing_executes_whole_graph() {
        let mut graph = TaskGraph::new();
        let mut roots = Vec::new();
        for i in 0..6 {
            let task = Task::new(format!("r{i}"), "ok");
            roots.push(task.task_id.clone());
            graph.add_task(task).unwrap();
        }
        let sink = Task::new("sink", "ok").with_depends_on(roots.clone());
        let sink_id = sink.task_id.clone();
        graph.add_task(sink).unwrap();

        let shared = share_graph(graph);
        let executor = TaskExecutor::new(registry())
            .with_strategy(ExecutionStrategy::WorkStealing)
            .with_max_workers(3);

        let result = executor.execute(&shared).await;
        assert!(result.success);
        assert_eq!(result.completed_tasks, 7);
        assert_eq!(result.task_results.len(), 7);

        // The sink ran after every root
        let graph = shared.read().unwrap();
        assert_eq!(graph.get(&sink_id).unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_work_stealing_propagates_failure() {
        let mut graph = TaskGraph::new();
        let bad = Task::new("bad", "boom").with_priority(TaskPriority::High);
        let bad_id = bad.task_id.clone();
        graph.add_task(bad).unwrap();
        let child = Task::new("child", "ok").with_depends_on(vec![bad_id.clone()]);
        let child_id = child.task_id.clone();
        graph.add_task(child).unwrap();
        let grandchild = Task::new("grandchild", "ok").with_depends_on(vec![child_id.clone()]);
        let grandchild_id = grandchild.task_id.clone();
        graph.add_task(grandchild).unwrap();

        let shared = share_graph(graph);
        let executor = TaskExecutor::new(registry())
            .with_strategy(ExecutionStrategy::WorkStealing)
            .with_max_workers(2);

        let result = executor.execute(&shared).await;
        assert!(!result.success);
        assert_eq!(result.failed_tasks, 1);
        assert_eq!(result.skipped_tasks, 2);

        let graph = shared.read().unwrap();
        assert_eq!(graph.get(&child_id).unwrap().status, TaskStatus::Skipped);
        assert_eq!(graph.get(&grandchild_id).unwrap().status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn test_all_steal_strategies_complete() {
        for strategy in [StealStrategy::Random, StealStrategy::RoundRobin, StealStrategy::LeastLoaded] {
            let mut graph = TaskGraph::new();
            for i in 0..10 {
                graph.add_task(Task::new(format!("t{i}"), "ok")).unwrap();
            }

            let shared = share_graph(graph);
            let executor = TaskExecutor::new(registry())
                .with_strategy(ExecutionStrategy::WorkStealing)
                .with_steal_strategy(strategy)
                .with_max_workers(4);

            let result = executor.execute(&shared).await;
            assert!(result.success, "strategy {strategy} failed");
            assert_eq!(result.completed_tasks, 10);
        }
    }

    #[tokio::test]
    async fn test_pool_start_and_shutdown_idempotent() {
        let pool = WorkStealingExecutor::new(2, StealStrategy::RoundRobin);
        pool.start();
        pool.start();
        assert_eq!(pool.workers.lock().unwrap().len(), 2);

        pool.shutdown(Some(Duration::from_secs(1))).await;
        pool.shutdown(Some(Duration::from_secs(1))).await;
        assert!(pool.workers.lock().unwrap().is_empty());

        // Restart after shutdown works
        pool.start();
        assert_eq!(pool.workers.lock().unwrap().len(), 2);
        pool.shutdown(None).await;
    }

    #[tokio::test]
    async fn test_idle_workers_record_steal_attempts() {
        let pool = WorkStealingExecutor::new(3, StealStrategy::LeastLoaded);
        pool.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.shutdown(Some(Duration::from_secs(1))).await;

        let stats = pool.stats();
        assert!(stats.total_steal_attempts > 0);
        assert_eq!(stats.successful_steals, 0);
        assert_eq!(stats.failed_steals, stats.total_steal_attempts);
        assert_eq!(stats.steal_success_rate, 0.0);
        assert_eq!(stats.num_workers, 3);
    }

    #[tokio::test]
    async fn test_empty_graph_terminates_immediately() {
        let shared = share_graph(TaskGraph::new());
        let executor = TaskExecutor::new(registry()).with_strategy(ExecutionStrategy::WorkStealing);
        let result = executor.execute(&shared).await;
        assert!(result.success);
        assert_eq!(result.completed_tasks, 0);
    }
}
