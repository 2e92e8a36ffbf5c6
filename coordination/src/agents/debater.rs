//! Per-branch debate positions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AgentResult, AgentRole};
use crate::graph::BranchId;
use crate::oracle::{GenerateOptions, NullOracle, PromptTask, SharedOracle};

/// Scores assigned to a freshly argued position.
pub const POSITION_CONFIDENCE: f64 = 0.7;
pub const POSITION_UTILITY: f64 = 0.6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebateRequest {
    pub goal: String,
    pub branch_id: BranchId,
    pub round: u32,
    /// The branch's current main claim
    pub claim: String,
    /// Latest positions of the other live branches
    pub opponents: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub branch_id: BranchId,
    pub round: u32,
    pub text: String,
    pub confidence: f64,
    pub utility: f64,
}

#[async_trait]
pub trait Debater: Send + Sync {
    fn role(&self) -> AgentRole {
        AgentRole::Debater
    }

    async fn argue(&self, request: &DebateRequest) -> AgentResult<Position>;
}

pub struct OracleDebater {
    oracle: SharedOracle,
}

impl OracleDebater {
    pub fn new(oracle: SharedOracle) -> Self {
        Self { oracle }
    }

    fn prompt(request: &DebateRequest) -> String {
        let mut prompt = format!(
            "{}\nGoal: {}\nRound {}. Defend or refine this position against the others.\n",
            request.claim, request.goal, request.round
        );
        for (i, opponent) in request.opponents.iter().enumerate() {
            prompt.push_str(&format!("Opponent {}: {opponent}\n", i + 1));
        }
        prompt
    }
}

#[async_trait]
impl Debater for OracleDebater {
    async fn argue(&self, request: &DebateRequest) -> AgentResult<Position> {
        let prompt = Self::prompt(request);
        let task = PromptTask::Argument {
            topic: request.claim.clone(),
            round: request.round,
        };
        let opts = GenerateOptions::for_task(task.clone());

        let text = match self.oracle.generate_once(&prompt, &opts).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => NullOracle::render(&prompt, &task),
            Err(e) => {
                warn!(branch_id = %request.branch_id, error = %e, "Debate generation failed, using offline rendering");
                NullOracle::render(&prompt, &task)
            }
        };

        debug!(branch_id = %request.branch_id, round = request.round, "Position argued");
        Ok(Position {
            branch_id: request.branch_id.clone(),
            round: request.round,
            text,
            confidence: POSITION_CONFIDENCE,
            utility: POSITION_UTILITY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_offline_position_is_stable_across_rounds() {
        let debater = OracleDebater::new(Arc::new(NullOracle::new()));
        let mut request = DebateRequest {
            goal: "choose a queue".into(),
            branch_id: "b1".into(),
            round: 1,
            claim: "use kafka".into(),
            opponents: vec!["use sqs".into()],
        };
        let first = debater.argue(&request).await.unwrap();
        request.round = 2;
        let second = debater.argue(&request).await.unwrap();

        assert_eq!(first.text, second.text);
        assert_eq!(first.round, 1);
        assert_eq!(second.confidence, POSITION_CONFIDENCE);
        assert!(first.text.contains("use kafka"));
    }
}
