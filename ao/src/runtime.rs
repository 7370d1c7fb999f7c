//! Agent runtime facade
//!
//! Wires the planner, executor, verifier and audit stores into one
//! governed query path: cache-aware planning, a signed decision record
//! for the chosen plan, policy-bounded execution with per-task audit
//! events, and post-hoc verification of every completed task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use auditledger::{DecisionContext, DecisionRecord, DecisionStore, ProvenanceStore, WormLog, prompt_hash_of};
use eyre::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::actions::ActionRegistry;
use crate::config::Config;
use crate::executor::{ExecutionResult, TaskExecutor, share_graph, write_worm_event};
use crate::graph::TaskGraph;
use crate::llm::ModelClient;
use crate::planner::{PlanCache, Planner, PlanningResult};
use crate::policy::PolicyGuard;
use crate::verifier::{TaskVerifier, VerificationResult};

/// Everything one governed query produced
#[derive(Debug)]
pub struct QueryReport {
    pub planning: PlanningResult,
    pub execution: ExecutionResult,
    pub verification: std::collections::HashMap<String, VerificationResult>,
    pub decision_record: DecisionRecord,
    /// Final task states after execution
    pub graph: TaskGraph,
}

/// Governed HTN agent runtime
pub struct AgentRuntime {
    config: Config,
    planner: Planner,
    executor: TaskExecutor,
    verifier: TaskVerifier,
    worm: Arc<WormLog>,
    decisions: Arc<DecisionStore>,
    #[allow(dead_code)]
    provenance: Arc<ProvenanceStore>,
    cache: Arc<PlanCache>,
    policy: Arc<PolicyGuard>,
}

impl AgentRuntime {
    /// Build a runtime rooted at `audit_root`, creating the on-disk
    /// audit layout
    ///
    /// ```text
    /// <root>/logs/events/events-YYYY-MM-DD.jsonl
    /// <root>/logs/digests/
    /// <root>/logs/decisions/
    /// <root>/logs/traces/otlp/
    /// <root>/audit/signed/
    /// <root>/provenance/signatures/
    /// ```
    pub fn new(
        config: Config,
        registry: ActionRegistry,
        model: Option<Arc<dyn ModelClient>>,
        audit_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let root = audit_root.into();

        let worm = Arc::new(
            WormLog::new(root.join("logs/events"), root.join("logs/digests"))
                .context("failed to create WORM log")?
                .with_archive_dir(root.join("audit/signed")),
        );
        let decisions = Arc::new(
            DecisionStore::new(root.join("logs/decisions"), root.join("provenance/signatures"))
                .context("failed to create decision store")?,
        );
        let provenance = Arc::new(
            ProvenanceStore::new(root.join("logs/traces/otlp")).context("failed to create provenance store")?,
        );

        let cache = Arc::new(PlanCache::new(
            config.htn_planning.cache_size,
            config.htn_planning.cache_ttl_seconds,
        ));
        let policy = Arc::new(PolicyGuard::from_snapshot(config.htn_policies.clone()));

        let mut planner = Planner::new()
            .with_registry(registry.clone())
            .with_policy(policy.clone())
            .with_cache(cache.clone());
        if let Some(model) = model {
            planner = planner.with_model(model);
        }

        let executor = TaskExecutor::new(registry)
            .with_strategy(config.htn_execution.default_strategy)
            .with_max_workers(config.htn_execution.max_parallel_workers)
            .with_task_timeout(Duration::from_secs(config.htn_execution.task_timeout_sec))
            .with_total_timeout(Duration::from_secs(config.htn_policies.max_execution_time_sec))
            .with_worm_log(worm.clone())
            .with_provenance(provenance.clone());

        let verifier = TaskVerifier::new(config.htn_verification.default_level);

        info!(agent = %config.agent.name, root = %root.display(), "agent runtime initialized");
        Ok(Self {
            config,
            planner,
            executor,
            verifier,
            worm,
            decisions,
            provenance,
            cache,
            policy,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn policy(&self) -> &Arc<PolicyGuard> {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<PlanCache> {
        &self.cache
    }

    pub fn worm(&self) -> &Arc<WormLog> {
        &self.worm
    }

    pub fn decisions(&self) -> &Arc<DecisionStore> {
        &self.decisions
    }

    pub fn verifier_mut(&mut self) -> &mut TaskVerifier {
        &mut self.verifier
    }

    /// Request cancellation of the in-flight execution
    pub fn cancel(&self) {
        self.executor.cancel();
    }

    /// Plan, execute and verify one query
    pub async fn handle_query(&self, query: &str) -> Result<QueryReport> {
        let strategy = self.config.htn_planning.default_strategy;
        let planning = self
            .planner
            .plan(query, strategy, None)
            .await
            .context("planning failed")?;

        let plan_id = format!("plan-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let decision_record = self
            .decisions
            .create_dr(
                &self.config.agent.name,
                &plan_id,
                &format!(
                    "decompose_query: {} tasks via {}",
                    planning.graph.len(),
                    planning.strategy_used
                ),
                &prompt_hash_of(query),
                DecisionContext {
                    model_fingerprint: Some(self.config.model.name.clone()),
                    reasoning_markers: vec![planning.reasoning.clone()],
                    tools_used: planning.graph.action_names(),
                    alternatives_considered: vec!["rule_based".into(), "llm_based".into(), "hybrid".into()],
                    ..DecisionContext::default()
                },
            )
            .context("failed to record planning decision")?;

        write_worm_event(
            &self.worm,
            &plan_id,
            "planner",
            "plan_created",
            json!({
                "dr_id": decision_record.dr_id,
                "strategy": planning.strategy_used.to_string(),
                "tasks": planning.graph.len(),
                "confidence": planning.confidence,
            }),
        );

        let shared = share_graph(planning.graph.clone());
        let execution = self.executor.execute(&shared).await;

        let graph = shared.read().expect("graph lock poisoned").clone();
        let verification = self
            .verifier
            .verify_graph_results(&graph, Some(self.config.htn_verification.default_level));

        Ok(QueryReport {
            planning,
            execution,
            verification,
            decision_record,
            graph,
        })
    }

    /// Flush and seal the audit trail; returns the finalization id
    pub fn shutdown(&self, archive: bool) -> Option<String> {
        let finalization = self.worm.finalize_current_log(archive);
        info!(?finalization, "agent runtime shut down");
        finalization
    }
}
