//! Model client abstraction
//!
//! The model backend is a collaborator: the orchestrator only depends on
//! the `generate` contract. Each call is independent - no conversation
//! state is maintained between generations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors surfaced by model backends
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Model backend unavailable: {0}")]
    Unavailable(String),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Invalid response from model: {0}")]
    InvalidResponse(String),

    #[error("Generation timed out after {0}s")]
    Timeout(u64),
}

/// Sampling parameters for one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub repetition_penalty: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 1024,
            seed: None,
            repetition_penalty: 1.1,
        }
    }
}

impl GenerationConfig {
    /// Low-temperature configuration for plan decomposition
    pub fn deterministic() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 1000,
            ..Self::default()
        }
    }
}

/// A tool invocation requested by a function-calling backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: Value,
}

/// Result of one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub prompt_tokens: u64,
    pub tokens_generated: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

impl GenerationResult {
    /// A plain-text result with zeroed token accounting
    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            prompt_tokens: 0,
            tokens_generated: 0,
            total_tokens: 0,
            tool_calls: Vec::new(),
        }
    }
}

/// Stateless model client - each call is independent
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Generate a completion for `prompt` under `config`
    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        system_prompt: Option<&str>,
    ) -> Result<GenerationResult, LlmError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_config_defaults() {
        let config = GenerationConfig::default();
        assert!(config.temperature > 0.0);
        assert!(config.max_tokens > 0);
        assert!(config.seed.is_none());
    }

    #[test]
    fn test_deterministic_config_lowers_temperature() {
        let config = GenerationConfig::deterministic();
        assert!(config.temperature <= 0.3);
    }

    #[tokio::test]
    async fn test_mock_client_scripts_responses() {
        use mock::MockModelClient;

        let client = MockModelClient::new(vec![
            Ok(GenerationResult::text_only("first")),
            Err("backend down".to_string()),
        ]);

        let first = client
            .generate("q", &GenerationConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(first.text, "first");

        let err = client.generate("q", &GenerationConfig::default(), None).await;
        assert!(err.is_err());
        assert_eq!(client.call_count(), 2);
    }
}
