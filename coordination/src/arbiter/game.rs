//! Allocation, best-response iteration and the round loop.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    ArbiterDecision, ArbiterError, ArbiterPhase, ArbiterResult, ArbiterStatus, BranchSnapshot,
    NashEquilibrium, RoundInput, RoundOutcome,
};
use crate::config::{ArbiterConfig, ParetoConfig};
use crate::convergence::{ConvergenceSession, ConvergenceTrigger};
use crate::error::EngineError;
use crate::events::{EngineEvent, SharedEventBus};
use crate::graph::BranchId;
use crate::oracle::lexical;
use crate::pareto::{Objective, ParetoOptimizer};

/// Turns branch scores into allocations and a continue/synthesize decision.
pub struct GameArbiter {
    config: ArbiterConfig,
    pareto: ParetoOptimizer,
    phase: ArbiterPhase,
    round: u32,
    front_size: usize,
    events: Option<(SharedEventBus, String)>,
}

impl GameArbiter {
    pub fn new(config: ArbiterConfig, pareto: ParetoConfig) -> Self {
        let objectives = vec![
            Objective::maximize("utility"),
            Objective::maximize("confidence"),
            Objective::minimize("risk"),
        ];
        Self {
            config,
            pareto: ParetoOptimizer::new(objectives, pareto),
            phase: ArbiterPhase::Idle,
            round: 0,
            front_size: 0,
            events: None,
        }
    }

    /// Publish allocation and trigger events for `session_id`.
    pub fn with_events(mut self, bus: SharedEventBus, session_id: &str) -> Self {
        self.events = Some((bus, session_id.to_string()));
        self
    }

    pub fn phase(&self) -> ArbiterPhase {
        self.phase
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn optimizer(&self) -> &ParetoOptimizer {
        &self.pareto
    }

    fn transition(&mut self, to: ArbiterPhase) -> ArbiterResult<()> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(ArbiterError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        debug!(from = %self.phase, to = %to, "Arbiter transition");
        self.phase = to;
        Ok(())
    }

    fn emit(&self, event: EngineEvent) {
        if let Some((bus, session_id)) = &self.events {
            let _ = bus.publish(session_id, event);
        }
    }

    /// Ids of branches no other branch dominates.
    pub fn pareto_front(&self, branches: &[BranchSnapshot]) -> Vec<BranchId> {
        let candidates: Vec<_> = branches.iter().map(BranchSnapshot::to_candidate).collect();
        self.pareto
            .pareto_front(&candidates)
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    /// `budget × utility / Σutility`, ×boost on the front, capped per
    /// branch, then rescaled if the sum still exceeds the budget.
    ///
    /// Capped excess is not handed to other branches, so the sum may be
    /// below budget.
    pub fn compute_resource_allocation(
        &self,
        branches: &[BranchSnapshot],
        front: &[BranchId],
    ) -> BTreeMap<BranchId, f64> {
        if branches.is_empty() {
            return BTreeMap::new();
        }

        let budget = self.config.resource_budget;
        let cap = budget * self.config.max_share;
        let total_utility: f64 = branches.iter().map(|b| b.utility).sum();
        let on_front: HashSet<&str> = front.iter().map(String::as_str).collect();

        let mut allocation: BTreeMap<BranchId, f64> = branches
            .iter()
            .map(|b| {
                let mut share = if total_utility > 0.0 {
                    budget * b.utility / total_utility
                } else {
                    budget / branches.len() as f64
                };
                if on_front.contains(b.id.as_str()) {
                    share *= self.config.front_boost;
                }
                (b.id.clone(), share.min(cap))
            })
            .collect();

        let total: f64 = allocation.values().sum();
        if total > budget {
            let err = EngineError::BudgetExceeded { total, budget };
            debug!(error = %err, "Rescaling allocation");
            let scale = budget / total;
            allocation.values_mut().for_each(|v| *v *= scale);
        }
        allocation
    }

    /// Fixed-iteration best-response update.
    ///
    /// Starts uniform at `1/n`; each iteration sets
    /// `w_i ← clamp(w_i + step × Σ_j w_j·conflict[i][j], floor, ceiling)`
    /// and renormalises. This is a heuristic, not an equilibrium solver.
    /// Missing matrix entries contribute nothing.
    pub fn compute_nash_equilibrium(
        &self,
        branches: &[BranchSnapshot],
        conflict: &[Vec<f64>],
    ) -> NashEquilibrium {
        let n = branches.len();
        if n == 0 {
            return NashEquilibrium {
                strategies: BTreeMap::new(),
                stable: Vec::new(),
                eliminated: Vec::new(),
            };
        }

        let mut weights = vec![1.0 / n as f64; n];
        for _ in 0..self.config.nash_iterations {
            let updated: Vec<f64> = (0..n)
                .map(|i| {
                    let payoff: f64 = (0..n)
                        .filter_map(|j| conflict.get(i).and_then(|row| row.get(j)).map(|c| weights[j] * c))
                        .sum();
                    (weights[i] + self.config.nash_step * payoff)
                        .clamp(self.config.weight_floor, self.config.weight_ceiling)
                })
                .collect();
            let total: f64 = updated.iter().sum();
            weights = updated.into_iter().map(|w| w / total).collect();
        }

        let threshold = 0.1 / n as f64;
        let (stable, eliminated): (Vec<_>, Vec<_>) = branches
            .iter()
            .zip(&weights)
            .partition(|&(_, &w)| w > threshold);

        NashEquilibrium {
            strategies: branches.iter().map(|b| b.id.clone()).zip(weights.iter().copied()).collect(),
            stable: stable.into_iter().map(|(b, _)| b.id.clone()).collect(),
            eliminated: eliminated.into_iter().map(|(b, _)| b.id.clone()).collect(),
        }
    }

    /// `conflict[i][j] = utility_i - utility_j`: stronger branches gain
    /// against weaker ones.
    pub fn utility_conflict_matrix(branches: &[BranchSnapshot]) -> Vec<Vec<f64>> {
        branches
            .iter()
            .map(|a| branches.iter().map(|b| a.utility - b.utility).collect())
            .collect()
    }

    /// Delegate to the convergence session, or apply the fallback
    /// heuristics: one branch left, utility spread under threshold,
    /// round ceiling.
    pub async fn check_convergence(
        &self,
        branches: &[BranchSnapshot],
        controller: Option<&ConvergenceSession>,
    ) -> Option<ConvergenceTrigger> {
        if let Some(controller) = controller {
            return controller.check_convergence().await;
        }

        if branches.len() <= 1 {
            return Some(ConvergenceTrigger::SingleBranch);
        }

        let (min, max) = branches.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), b| {
            (lo.min(b.utility), hi.max(b.utility))
        });
        let spread = max - min;
        if spread < self.config.utility_spread_threshold {
            return Some(ConvergenceTrigger::UtilityConvergence { spread });
        }

        if self.round >= self.config.max_rounds {
            return Some(ConvergenceTrigger::MaxRounds { rounds: self.round });
        }
        None
    }

    /// Token Jaccard of the two main claims.
    pub fn compute_branch_similarity(a: &BranchSnapshot, b: &BranchSnapshot) -> f64 {
        lexical::jaccard(&a.main_claim, &b.main_claim)
    }

    /// Highest utility, ties broken by confidence then lower risk.
    pub fn select_best_branch<'a>(&self, branches: &'a [BranchSnapshot]) -> Option<&'a BranchSnapshot> {
        branches.iter().max_by(|a, b| compare_branches(a, b))
    }

    /// Every branch, best first, in the order `select_best_branch` prefers.
    pub fn rank_branches<'a>(&self, branches: &'a [BranchSnapshot]) -> Vec<&'a BranchSnapshot> {
        let mut ranked: Vec<&BranchSnapshot> = branches.iter().collect();
        ranked.sort_by(|a, b| compare_branches(a, b));
        ranked.reverse();
        ranked
    }

    /// Score, allocate and decide for one round.
    pub async fn run_round(
        &mut self,
        input: RoundInput,
        controller: Option<&ConvergenceSession>,
    ) -> ArbiterResult<RoundOutcome> {
        self.transition(ArbiterPhase::Scoring)?;
        self.round += 1;

        let front = self.pareto_front(&input.branches);
        self.front_size = front.len();
        let allocation = self.compute_resource_allocation(&input.branches, &front);
        let nash = input
            .conflict_matrix
            .as_deref()
            .map(|m| self.compute_nash_equilibrium(&input.branches, m));

        info!(
            round = self.round,
            branches = input.branches.len(),
            front = front.len(),
            "Arbitration round scored"
        );
        self.emit(EngineEvent::AllocationComputed {
            round: self.round,
            front: front.clone(),
            allocation: allocation.clone(),
            timestamp: Utc::now(),
        });

        let decision = match self.check_convergence(&input.branches, controller).await {
            Some(trigger) => {
                self.transition(ArbiterPhase::Synthesizing)?;
                info!(round = self.round, trigger = %trigger, "Synthesis triggered");
                self.emit(EngineEvent::ConvergenceTriggered {
                    round: self.round,
                    trigger: trigger.clone(),
                    timestamp: Utc::now(),
                });
                ArbiterDecision::Synthesize { trigger }
            }
            None => {
                self.transition(ArbiterPhase::Debating)?;
                ArbiterDecision::ContinueDebate
            }
        };

        if let Some(eq) = &nash {
            if !eq.eliminated.is_empty() {
                warn!(round = self.round, eliminated = ?eq.eliminated, "Branches eliminated by equilibrium");
            }
        }

        self.transition(ArbiterPhase::Idle)?;
        Ok(RoundOutcome {
            round: self.round,
            front,
            allocation,
            nash,
            decision,
        })
    }

    pub fn status(&self) -> ArbiterStatus {
        ArbiterStatus {
            round: self.round,
            phase: self.phase,
            pareto_front_size: self.front_size,
            resource_budget: self.config.resource_budget,
            timestamp: Utc::now(),
        }
    }
}

fn compare_branches(a: &BranchSnapshot, b: &BranchSnapshot) -> std::cmp::Ordering {
    a.utility
        .total_cmp(&b.utility)
        .then(a.confidence.total_cmp(&b.confidence))
        .then(b.risk.total_cmp(&a.risk))
}
