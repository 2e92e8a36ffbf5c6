//! Oracle: the language-model capability behind every agent.
//!
//! Algorithmic code only sees the [`Oracle`] trait. Two implementations
//! are chosen at construction time:
//!
//! - [`NullOracle`]: deterministic heuristics (token overlap, keyword
//!   rules, fixed mock generations). Used offline and in tests.
//! - [`LiveOracle`]: OpenAI-compatible HTTP endpoint with streaming
//!   completions and embeddings. Failed calls fall back to the same
//!   heuristics the null oracle uses.

pub mod lexical;
pub mod live;
pub mod null;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

pub use live::LiveOracle;
pub use null::NullOracle;

/// Errors from oracle calls
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Response parse error: {0}")]
    ParseError(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Oracle not configured: {0}")]
    NotConfigured(String),
}

/// Result type for oracle operations
pub type OracleResult<T> = Result<T, OracleError>;

/// Streamed generation chunks.
pub type TextStream = BoxStream<'static, OracleResult<String>>;

/// Shared reference to an oracle
pub type SharedOracle = Arc<dyn Oracle>;

/// What a generation is for. Live oracles ignore it; the null oracle
/// uses it to pick its deterministic output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum PromptTask {
    Solution { strategy: String },
    Argument { topic: String, round: u32 },
    Synthesis { branches: usize },
    Compilation,
    Freeform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
    pub task: PromptTask,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
            system_prompt: None,
            task: PromptTask::Freeform,
        }
    }
}

impl GenerateOptions {
    pub fn for_task(task: PromptTask) -> Self {
        Self {
            task,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_system(mut self, system_prompt: &str) -> Self {
        self.system_prompt = Some(system_prompt.to_string());
        self
    }
}

/// Verdict on a single attack edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttackAssessment {
    pub is_valid: bool,
    pub confidence: f64,
    pub explanation: String,
}

/// Generation and semantic judgement capability.
#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    /// Whether calls reach a real model.
    fn is_live(&self) -> bool;

    /// Stream a completion.
    async fn generate(&self, prompt: &str, opts: &GenerateOptions) -> OracleResult<TextStream>;

    /// Complete and collect the whole text.
    async fn generate_once(&self, prompt: &str, opts: &GenerateOptions) -> OracleResult<String> {
        let mut stream = self.generate(prompt, opts).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            text.push_str(&chunk?);
        }
        Ok(text)
    }

    /// Semantic similarity in [0, 1]. Empty input scores 0.
    async fn similarity(&self, a: &str, b: &str) -> f64;

    /// Degree to which `premise` entails `hypothesis`, in [0, 1].
    async fn entailment(&self, premise: &str, hypothesis: &str) -> f64;

    async fn contradicts(&self, a: &str, b: &str) -> bool;

    /// Whether `claim` breaks `constraint`.
    async fn violates(&self, claim: &str, constraint: &str) -> bool;

    async fn assess_attack(&self, attacker: &str, target: &str, reasoning: &str) -> AttackAssessment;
}

/// Live oracle when an endpoint is configured, otherwise the null oracle.
pub fn from_config(config: &crate::config::OracleConfig) -> SharedOracle {
    if config.base_url.is_none() {
        return Arc::new(NullOracle::new());
    }
    match LiveOracle::new(config) {
        Ok(live) => {
            tracing::info!(model = %config.model, "Using live oracle");
            Arc::new(live)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Live oracle unavailable, using heuristics");
            Arc::new(NullOracle::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OracleConfig;

    #[test]
    fn test_from_config_selects_implementation() {
        assert!(!from_config(&OracleConfig::default()).is_live());

        let live = OracleConfig {
            base_url: Some("http://localhost:8000".to_string()),
            ..OracleConfig::default()
        };
        assert!(from_config(&live).is_live());
    }
}
