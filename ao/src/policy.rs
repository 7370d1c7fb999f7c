//! Declarative execution policies
//!
//! Plans are validated against an immutable [`PolicySnapshot`] loaded
//! from the `htn_policies` section of the configuration document. The
//! deny list always wins over the allow list; the reserved
//! `generic_execute` fallback action is admitted even under a
//! restrictive allow list.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Policy violations
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("Action '{0}' is forbidden by policy (blocked_actions)")]
    ActionDenied(String),

    #[error("Action '{0}' is not in allowed_actions list")]
    ActionNotAllowed(String),

    #[error("Plan exceeds maximum tasks: {count} > {max}")]
    PlanTooLarge { count: usize, max: usize },

    #[error("Failed to load policies from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// Immutable view of the active policies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySnapshot {
    /// Maximum number of tasks a single plan may contain
    pub max_tasks_per_plan: usize,

    /// Total execution budget in seconds
    pub max_execution_time_sec: u64,

    /// Allow list; empty means every action is allowed
    pub allowed_actions: Vec<String>,

    /// Deny list; takes precedence over the allow list
    pub blocked_actions: Vec<String>,

    /// Per-action retry configuration, opaque to the guard
    pub retry_policies: Map<String, Value>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            max_tasks_per_plan: 50,
            max_execution_time_sec: 300,
            allowed_actions: Vec::new(),
            blocked_actions: Vec::new(),
            retry_policies: Map::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    htn_policies: PolicySnapshot,
}

/// Validates actions and plan shape against the loaded policies
pub struct PolicyGuard {
    config_path: Option<PathBuf>,
    snapshot: RwLock<PolicySnapshot>,
}

impl PolicyGuard {
    /// Guard over an explicit snapshot
    pub fn from_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            config_path: None,
            snapshot: RwLock::new(snapshot),
        }
    }

    /// Load the `htn_policies` section of a YAML document
    ///
    /// A missing file yields the default policies; a malformed file is
    /// an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let snapshot = load_snapshot(path)?;
        debug!(path = %path.display(), "PolicyGuard: policies loaded");
        Ok(Self {
            config_path: Some(path.to_path_buf()),
            snapshot: RwLock::new(snapshot),
        })
    }

    /// Re-read the backing file; a no-op for snapshot-constructed guards
    pub fn reload(&self) -> Result<(), PolicyError> {
        if let Some(path) = &self.config_path {
            let fresh = load_snapshot(path)?;
            *self.snapshot.write().expect("policy lock poisoned") = fresh;
        }
        Ok(())
    }

    /// The current snapshot
    pub fn snapshot(&self) -> PolicySnapshot {
        self.snapshot.read().expect("policy lock poisoned").clone()
    }

    /// Validate a single action name
    pub fn validate_action(&self, action: &str) -> Result<(), PolicyError> {
        let snapshot = self.snapshot.read().expect("policy lock poisoned");

        if snapshot.blocked_actions.iter().any(|a| a == action) {
            return Err(PolicyError::ActionDenied(action.to_string()));
        }

        if !snapshot.allowed_actions.is_empty()
            && !snapshot.allowed_actions.iter().any(|a| a == action)
            && action != "generic_execute"
        {
            return Err(PolicyError::ActionNotAllowed(action.to_string()));
        }

        Ok(())
    }

    /// Validate a whole plan: task count plus every distinct action
    pub fn validate_plan(&self, task_count: usize, actions: &[String]) -> Result<(), PolicyError> {
        let max = self.snapshot.read().expect("policy lock poisoned").max_tasks_per_plan;
        if task_count > max {
            return Err(PolicyError::PlanTooLarge { count: task_count, max });
        }

        let mut seen = std::collections::HashSet::new();
        for action in actions {
            if seen.insert(action.as_str()) {
                self.validate_action(action)?;
            }
        }
        Ok(())
    }

    /// Non-throwing probe
    pub fn is_action_allowed(&self, action: &str) -> bool {
        self.validate_action(action).is_ok()
    }
}

fn load_snapshot(path: &Path) -> Result<PolicySnapshot, PolicyError> {
    if !path.exists() {
        warn!(path = %path.display(), "policy file missing, using defaults");
        return Ok(PolicySnapshot::default());
    }

    let content = std::fs::read_to_string(path).map_err(|e| PolicyError::Load {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let document: PolicyDocument = serde_yaml::from_str(&content).map_err(|e| PolicyError::Load {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok(document.htn_policies)
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<PolicyGuard>>> = Mutex::new(None);

/// Initialize the process-wide policy guard from a file
pub fn init_global(path: impl AsRef<Path>) -> Result<Arc<PolicyGuard>, PolicyError> {
    let guard = Arc::new(PolicyGuard::from_file(path)?);
    *GLOBAL.lock().expect("policy global lock poisoned") = Some(guard.clone());
    Ok(guard)
}

/// Initialize the process-wide policy guard from a snapshot
pub fn init_global_snapshot(snapshot: PolicySnapshot) -> Arc<PolicyGuard> {
    let guard = Arc::new(PolicyGuard::from_snapshot(snapshot));
    *GLOBAL.lock().expect("policy global lock poisoned") = Some(guard.clone());
    guard
}

/// The process-wide policy guard, if initialized
pub fn global() -> Option<Arc<PolicyGuard>> {
    GLOBAL.lock().expect("policy global lock poisoned").clone()
}

/// Drop the process-wide policy guard
pub fn reset_global() {
    *GLOBAL.lock().expect("policy global lock poisoned") = None;
}
