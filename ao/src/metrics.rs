//! Advisory runtime metrics
//!
//! Counters emitted throughout planner, executor and verifier. The
//! registry is a sink: recording is best-effort, never panics, and the
//! correctness of the core never depends on it. When no global registry
//! is initialized every record call is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;

use crate::planner::PlanningStrategy;

/// Global counters (thread-safe)
#[derive(Debug, Default)]
struct GlobalCounters {
    plannings_total: AtomicU64,
    plannings_failed: AtomicU64,
    executions_total: AtomicU64,
    executions_failed: AtomicU64,
    verifications_total: AtomicU64,
    verifications_failed: AtomicU64,
}

/// Per-strategy planning/execution aggregates
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyMetrics {
    pub runs: u64,
    pub failures: u64,
    pub tasks_total: u64,
    pub total_duration_ms: u64,
}

/// Point-in-time snapshot of every counter
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub plannings_total: u64,
    pub plannings_failed: u64,
    pub executions_total: u64,
    pub executions_failed: u64,
    pub verifications_total: u64,
    pub verifications_failed: u64,
    pub planning_by_strategy: HashMap<String, StrategyMetrics>,
    pub execution_by_strategy: HashMap<String, StrategyMetrics>,
    pub tasks_by_status: HashMap<String, u64>,
    pub cache_events: HashMap<String, u64>,
    pub steal_events: HashMap<String, u64>,
}

/// In-process metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    global: GlobalCounters,
    planning_by_strategy: RwLock<HashMap<String, StrategyMetrics>>,
    execution_by_strategy: RwLock<HashMap<String, StrategyMetrics>>,
    tasks_by_status: RwLock<HashMap<String, u64>>,
    cache_events: RwLock<HashMap<String, u64>>,
    steal_events: RwLock<HashMap<String, u64>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_planning(&self, strategy: &str, success: bool, tasks: usize) {
        self.global.plannings_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.global.plannings_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut map) = self.planning_by_strategy.write() {
            let entry = map.entry(strategy.to_string()).or_default();
            entry.runs += 1;
            if !success {
                entry.failures += 1;
            }
            entry.tasks_total += tasks as u64;
        }
    }

    pub fn record_execution(&self, strategy: &str, success: bool, duration_ms: u64, tasks: usize) {
        self.global.executions_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.global.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut map) = self.execution_by_strategy.write() {
            let entry = map.entry(strategy.to_string()).or_default();
            entry.runs += 1;
            if !success {
                entry.failures += 1;
            }
            entry.tasks_total += tasks as u64;
            entry.total_duration_ms += duration_ms;
        }
    }

    pub fn record_task_status(&self, status: &str) {
        if let Ok(mut map) = self.tasks_by_status.write() {
            *map.entry(status.to_string()).or_default() += 1;
        }
    }

    pub fn record_verification(&self, passed: bool) {
        self.global.verifications_total.fetch_add(1, Ordering::Relaxed);
        if !passed {
            self.global.verifications_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_event(&self, event: &str) {
        if let Ok(mut map) = self.cache_events.write() {
            *map.entry(event.to_string()).or_default() += 1;
        }
    }

    pub fn record_steal_event(&self, event: &str) {
        if let Ok(mut map) = self.steal_events.write() {
            *map.entry(event.to_string()).or_default() += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            plannings_total: self.global.plannings_total.load(Ordering::Relaxed),
            plannings_failed: self.global.plannings_failed.load(Ordering::Relaxed),
            executions_total: self.global.executions_total.load(Ordering::Relaxed),
            executions_failed: self.global.executions_failed.load(Ordering::Relaxed),
            verifications_total: self.global.verifications_total.load(Ordering::Relaxed),
            verifications_failed: self.global.verifications_failed.load(Ordering::Relaxed),
            planning_by_strategy: self.planning_by_strategy.read().map(|m| m.clone()).unwrap_or_default(),
            execution_by_strategy: self.execution_by_strategy.read().map(|m| m.clone()).unwrap_or_default(),
            tasks_by_status: self.tasks_by_status.read().map(|m| m.clone()).unwrap_or_default(),
            cache_events: self.cache_events.read().map(|m| m.clone()).unwrap_or_default(),
            steal_events: self.steal_events.read().map(|m| m.clone()).unwrap_or_default(),
        }
    }
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<MetricsRegistry>>> = Mutex::new(None);

/// Initialize the process-wide metrics registry
pub fn init_global() -> Arc<MetricsRegistry> {
    let registry = Arc::new(MetricsRegistry::new());
    *GLOBAL.lock().expect("metrics global lock poisoned") = Some(registry.clone());
    registry
}

/// The process-wide registry, if initialized
pub fn global() -> Option<Arc<MetricsRegistry>> {
    GLOBAL.lock().expect("metrics global lock poisoned").clone()
}

/// Drop the process-wide registry
pub fn reset_global() {
    *GLOBAL.lock().expect("metrics global lock poisoned") = None;
}

/// Record a planning run against the global registry, if any
pub fn record_planning(strategy: PlanningStrategy, success: bool, _confidence: f64, tasks: usize) {
    if let Some(registry) = global() {
        registry.record_planning(&strategy.to_string(), success, tasks);
    }
}

/// Record an execution run against the global registry, if any
pub fn record_execution(strategy: &str, success: bool, duration_ms: u64, tasks: usize) {
    if let Some(registry) = global() {
        registry.record_execution(strategy, success, duration_ms, tasks);
    }
}

/// Record a task reaching a terminal status
pub fn record_task_status(status: &str) {
    if let Some(registry) = global() {
        registry.record_task_status(status);
    }
}

/// Record a verification outcome
pub fn record_verification(passed: bool) {
    if let Some(registry) = global() {
        registry.record_verification(passed);
    }
}

/// Record a plan-cache event (`hit`, `miss`, `eviction`, ...)
pub fn record_cache_event(event: &str) {
    if let Some(registry) = global() {
        registry.record_cache_event(event);
    }
}

/// Record a work-stealing event (`steal_success`, `steal_failed`, ...)
pub fn record_steal_event(event: &str) {
    if let Some(registry) = global() {
        registry.record_steal_event(event);
    }
}
