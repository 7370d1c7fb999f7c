//! Runtime configuration types and loading
//!
//! One YAML document configures the whole runtime. Every section has
//! defaults, so an empty or missing file yields a working configuration.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutionStrategy;
use crate::planner::PlanningStrategy;
use crate::verifier::VerificationLevel;

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Agent identity and loop limits
    pub agent: AgentConfig,

    /// Sampling defaults for model generations
    pub generation: GenerationSection,

    /// Operation timeouts (seconds)
    pub timeouts: TimeoutConfig,

    /// Model backend description
    pub model: ModelConfig,

    /// Memory retention settings
    pub memory: MemoryConfig,

    /// Planner settings
    pub htn_planning: HtnPlanningConfig,

    /// Executor settings
    pub htn_execution: HtnExecutionConfig,

    /// Verifier settings
    pub htn_verification: HtnVerificationConfig,

    /// Policy limits and action lists
    pub htn_policies: crate::policy::PolicySnapshot,
}

impl Config {
    /// Load configuration with a fallback chain: explicit path, then
    /// project-local `agent.yaml`, then the user config directory, then
    /// defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from("agent.yaml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("agentorch").join("agent.yaml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Agent identity and loop limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub version: String,
    pub max_iterations: u32,
    /// Seconds
    pub timeout: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "agentorch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            max_iterations: 10,
            timeout: 120,
        }
    }
}

/// Sampling defaults, mirroring [`crate::llm::GenerationConfig`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub seed: Option<u64>,
    pub repetition_penalty: f32,
}

impl Default for GenerationSection {
    fn default() -> Self {
        let base = crate::llm::GenerationConfig::default();
        Self {
            temperature: base.temperature,
            top_p: base.top_p,
            top_k: base.top_k,
            max_tokens: base.max_tokens,
            seed: base.seed,
            repetition_penalty: base.repetition_penalty,
        }
    }
}

impl From<GenerationSection> for crate::llm::GenerationConfig {
    fn from(section: GenerationSection) -> Self {
        Self {
            temperature: section.temperature,
            top_p: section.top_p,
            top_k: section.top_k,
            max_tokens: section.max_tokens,
            seed: section.seed,
            repetition_penalty: section.repetition_penalty,
        }
    }
}

/// Operation timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub generation: u64,
    pub tool_execution: u64,
    pub total_request: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            generation: 60,
            tool_execution: 30,
            total_request: 300,
        }
    }
}

/// Model backend description; the backend itself is a collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub path: String,
    pub backend: String,
    pub context_size: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "base".to_string(),
            path: "models/weights/base.gguf".to_string(),
            backend: "llama_cpp".to_string(),
            context_size: 8192,
        }
    }
}

/// Memory retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub episodic: EpisodicMemoryConfig,
    pub semantic: SemanticMemoryConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            episodic: EpisodicMemoryConfig::default(),
            semantic: SemanticMemoryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodicMemoryConfig {
    pub ttl_days: u32,
    pub max_conversations: u32,
}

impl Default for EpisodicMemoryConfig {
    fn default() -> Self {
        Self {
            ttl_days: 30,
            max_conversations: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SemanticMemoryConfig {
    pub rebuild_days: u32,
    pub max_items: u32,
    pub similarity_threshold: f32,
}

impl Default for SemanticMemoryConfig {
    fn default() -> Self {
        Self {
            rebuild_days: 7,
            max_items: 10_000,
            similarity_threshold: 0.75,
        }
    }
}

/// Planner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtnPlanningConfig {
    pub enabled: bool,
    pub default_strategy: PlanningStrategy,
    pub max_decomposition_depth: u32,
    pub cache_size: usize,
    pub cache_ttl_seconds: Option<u64>,
}

impl Default for HtnPlanningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_strategy: PlanningStrategy::Hybrid,
            max_decomposition_depth: 3,
            cache_size: 100,
            cache_ttl_seconds: None,
        }
    }
}

/// Executor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtnExecutionConfig {
    pub default_strategy: ExecutionStrategy,
    pub max_parallel_workers: usize,
    pub task_timeout_sec: u64,
}

impl Default for HtnExecutionConfig {
    fn default() -> Self {
        Self {
            default_strategy: ExecutionStrategy::Adaptive,
            max_parallel_workers: 4,
            task_timeout_sec: 60,
        }
    }
}

/// Verifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtnVerificationConfig {
    pub default_level: VerificationLevel,
}

impl Default for HtnVerificationConfig {
    fn default() -> Self {
        Self {
            default_level: VerificationLevel::Strict,
        }
    }
}
