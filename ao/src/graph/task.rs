//! Task domain type
//!
//! A Task is the atomic unit of work in a plan: one action invocation
//! with parameters, dependencies and a priority. Status transitions
//! follow pending -> ready -> running -> {completed|failed}, with
//! skipped and cancelled reachable from pending/ready.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Dependencies satisfied, eligible for dispatch
    Ready,
    /// Action invocation in flight
    Running,
    /// Finished with a result
    Completed,
    /// Finished with an error
    Failed,
    /// Not run because a dependency failed
    Skipped,
    /// Not run because the execution was cancelled
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Scheduling priority, encoded as its numeric value on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum TaskPriority {
    /// May fail without consequence
    Optional = 1,
    Low = 2,
    #[default]
    Normal = 3,
    High = 4,
    /// Blocking; forces sequential execution in adaptive mode
    Critical = 5,
}

impl TaskPriority {
    /// Numeric encoding used in plans and decision records
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// A failure at this priority fails the whole plan
    pub fn is_critical_path(&self) -> bool {
        *self >= Self::High
    }
}

impl From<TaskPriority> for u8 {
    fn from(priority: TaskPriority) -> Self {
        priority as u8
    }
}

impl TryFrom<u8> for TaskPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Optional),
            2 => Ok(Self::Low),
            3 => Ok(Self::Normal),
            4 => Ok(Self::High),
            5 => Ok(Self::Critical),
            other => Err(format!("Unknown priority value: {other}")),
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Optional => write!(f, "optional"),
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Timestamps and free-form annotations carried by every task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_timestamp: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            completed_at: None,
            error_timestamp: None,
            extra: Map::new(),
        }
    }
}

/// Atomic unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable identifier, immutable after creation
    pub task_id: String,

    /// Human-readable name
    pub name: String,

    /// Key into the action registry
    pub action: String,

    /// Free-form parameters handed to the action
    pub params: Map<String, Value>,

    /// Identifiers of tasks that must complete first
    pub depends_on: Vec<String>,

    pub priority: TaskPriority,
    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub metadata: TaskMetadata,
}

impl Task {
    /// Create a pending task with a generated identifier
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            task_id: format!("task-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            action: action.into(),
            params: Map::new(),
            depends_on: Vec::new(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            metadata: TaskMetadata::default(),
        }
    }

    /// Set the parameter map
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Add a single parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Set the dependency list
    pub fn with_depends_on(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Transition status, recording the update time and any error
    pub fn update_status(&mut self, status: TaskStatus, error: Option<&str>) {
        self.status = status;
        self.metadata.updated_at = Utc::now();
        if let Some(message) = error {
            self.error = Some(message.to_string());
            self.metadata.error_timestamp = Some(Utc::now());
        }
    }

    /// Record the result payload and its completion time
    ///
    /// Leaves `updated_at` alone so `updated_at <= completed_at` holds
    /// when the status transition happens first.
    pub fn set_result(&mut self, result: Value) {
        self.result = Some(result);
        self.metadata.completed_at = Some(Utc::now());
    }

    /// Stable serialization for audit logs
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("task serialization cannot fail")
    }
}
