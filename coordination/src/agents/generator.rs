//! Divergent candidate generation.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AgentResult, AgentRole};
use crate::oracle::{GenerateOptions, NullOracle, PromptTask, SharedOracle};

/// How a candidate was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    HighTemperature,
    CrossDomainAnalogy,
    ConstraintRelaxation,
    ReverseThinking,
    Combination,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Self::HighTemperature,
        Self::CrossDomainAnalogy,
        Self::ConstraintRelaxation,
        Self::ReverseThinking,
        Self::Combination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HighTemperature => "high_temperature",
            Self::CrossDomainAnalogy => "cross_domain_analogy",
            Self::ConstraintRelaxation => "constraint_relaxation",
            Self::ReverseThinking => "reverse_thinking",
            Self::Combination => "combination",
        }
    }

    pub fn temperature(&self) -> f64 {
        match self {
            Self::HighTemperature => 1.2,
            Self::CrossDomainAnalogy | Self::ReverseThinking => 0.9,
            Self::ConstraintRelaxation | Self::Combination => 0.7,
        }
    }

    /// Baseline (feasibility, novelty, risk).
    fn profile(&self) -> (f64, f64, f64) {
        match self {
            Self::HighTemperature => (0.5, 0.95, 0.8),
            Self::CrossDomainAnalogy => (0.6, 0.9, 0.5),
            Self::ConstraintRelaxation => (0.8, 0.3, 0.3),
            Self::ReverseThinking => (0.55, 0.85, 0.45),
            Self::Combination => (0.7, 0.55, 0.4),
        }
    }

    fn instruction(&self) -> &'static str {
        match self {
            Self::HighTemperature => "Propose the boldest workable option.",
            Self::CrossDomainAnalogy => "Borrow a proven approach from an unrelated field.",
            Self::ConstraintRelaxation => "Relax the softest constraint and propose the safest option.",
            Self::ReverseThinking => "Start from the opposite of the obvious answer.",
            Self::Combination => "Combine two conventional options into one.",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A scored candidate solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub strategy: Strategy,
    pub content: String,
    pub feasibility: f64,
    pub novelty: f64,
    pub risk: f64,
}

impl Proposal {
    /// Score a generated text by its strategy profile and risk wording.
    pub fn score(strategy: Strategy, content: String) -> Self {
        let (feasibility, novelty, mut risk) = strategy.profile();
        let lower = content.to_lowercase();
        if ["risky", "experimental", "untested"].iter().any(|w| lower.contains(w)) {
            risk += 0.1;
        }
        if ["safe", "proven", "incremental"].iter().any(|w| lower.contains(w)) {
            risk -= 0.1;
        }
        Self {
            strategy,
            content,
            feasibility,
            novelty,
            risk: risk.clamp(0.0, 1.0),
        }
    }

    /// `0.5·feasibility + 0.3·novelty + 0.2·(1 − risk)`
    pub fn utility(&self) -> f64 {
        (0.5 * self.feasibility + 0.3 * self.novelty + 0.2 * (1.0 - self.risk)).clamp(0.0, 1.0)
    }

    pub fn confidence(&self) -> f64 {
        self.feasibility
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn role(&self) -> AgentRole {
        AgentRole::Generator
    }

    /// Propose `count` candidates for a goal, cycling through strategies.
    async fn propose(
        &self,
        goal: &str,
        constraints: &[String],
        count: usize,
    ) -> AgentResult<Vec<Proposal>>;
}

pub struct OracleGenerator {
    oracle: SharedOracle,
}

impl OracleGenerator {
    pub fn new(oracle: SharedOracle) -> Self {
        Self { oracle }
    }

    fn prompt(goal: &str, constraints: &[String], strategy: Strategy) -> String {
        let mut prompt = format!("Goal: {goal}\n");
        if !constraints.is_empty() {
            prompt.push_str("Constraints:\n");
            for c in constraints {
                prompt.push_str(&format!("- {c}\n"));
            }
        }
        prompt.push_str(&format!("Strategy: {strategy}\n{}\n", strategy.instruction()));
        prompt.push_str("Answer with a single concise solution statement.");
        prompt
    }

    async fn generate(&self, goal: &str, constraints: &[String], strategy: Strategy) -> Proposal {
        let prompt = Self::prompt(goal, constraints, strategy);
        let task = PromptTask::Solution {
            strategy: strategy.to_string(),
        };
        let opts = GenerateOptions::for_task(task.clone()).with_temperature(strategy.temperature());

        let content = match self.oracle.generate_once(&prompt, &opts).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                warn!(%strategy, "Empty generation, using offline rendering");
                NullOracle::render(&prompt, &task)
            }
            Err(e) => {
                warn!(%strategy, error = %e, "Generation failed, using offline rendering");
                NullOracle::render(&prompt, &task)
            }
        };
        Proposal::score(strategy, content)
    }
}

#[async_trait]
impl Generator for OracleGenerator {
    async fn propose(
        &self,
        goal: &str,
        constraints: &[String],
        count: usize,
    ) -> AgentResult<Vec<Proposal>> {
        let strategies: Vec<Strategy> = Strategy::ALL.iter().copied().cycle().take(count).collect();
        let proposals = join_all(
            strategies
                .into_iter()
                .map(|s| self.generate(goal, constraints, s)),
        )
        .await;

        debug!(oracle = self.oracle.name(), count = proposals.len(), "Proposals generated");
        Ok(proposals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::NullOracle;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_propose_cycles_strategies() {
        let generator = OracleGenerator::new(Arc::new(NullOracle::new()));
        let proposals = generator
            .propose("reduce checkout latency", &["must keep PCI scope".into()], 6)
            .await
            .unwrap();

        assert_eq!(proposals.len(), 6);
        assert_eq!(proposals[0].strategy, Strategy::HighTemperature);
        assert_eq!(proposals[5].strategy, Strategy::HighTemperature);
        assert_eq!(
            proposals[3].content,
            "Solution generated using reverse thinking strategy for Goal: reduce checkout latency"
        );
    }

    #[test]
    fn test_scoring() {
        let safe = Proposal::score(Strategy::ConstraintRelaxation, "a safe rollout".into());
        assert!((safe.risk - 0.2).abs() < 1e-12);
        let bold = Proposal::score(Strategy::HighTemperature, "plain".into());
        assert!(safe.utility() > bold.utility());
        assert_eq!(bold.confidence(), 0.5);
    }
}
