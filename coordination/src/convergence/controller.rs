//! Per-session convergence state and the stopping check.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ConvergenceTrigger;
use crate::config::ConvergenceConfig;
use crate::graph::BranchId;
use crate::oracle::SharedOracle;

/// One debate round as seen by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceSnapshot {
    pub round: u32,
    pub positions_by_branch: BTreeMap<BranchId, String>,
    pub entropy: f64,
}

impl ConvergenceSnapshot {
    /// Position of a branch, empty when it did not speak this round.
    pub fn position(&self, branch_id: &str) -> &str {
        self.positions_by_branch
            .get(branch_id)
            .map(String::as_str)
            .unwrap_or("")
    }
}

/// Observability view of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceStatus {
    pub round: u32,
    pub max_rounds: u32,
    pub current_entropy: Option<f64>,
    /// Least-squares slope of entropy over the window
    pub entropy_trend: f64,
    /// `(entropy[0] - entropy[last]) / (n - 1)`
    pub convergence_rate: f64,
    pub is_converging: bool,
    pub window_len: usize,
}

/// Rolling convergence state for one session.
///
/// Owned by the round loop and passed by reference. A new convergence
/// phase starts from [`ConvergenceSession::reset`], which swaps in a
/// fresh instance.
pub struct ConvergenceSession {
    config: ConvergenceConfig,
    oracle: SharedOracle,
    round: u32,
    window: VecDeque<ConvergenceSnapshot>,
    forced: bool,
}

impl ConvergenceSession {
    pub fn new(config: ConvergenceConfig, oracle: SharedOracle) -> Self {
        let capacity = config.window_capacity();
        Self {
            config,
            oracle,
            round: 0,
            window: VecDeque::with_capacity(capacity),
            forced: false,
        }
    }

    /// Empty session with the same configuration and oracle.
    pub fn fresh(&self) -> Self {
        Self::new(self.config.clone(), self.oracle.clone())
    }

    pub fn reset(&mut self) {
        *self = self.fresh();
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    pub fn window(&self) -> impl Iterator<Item = &ConvergenceSnapshot> {
        self.window.iter()
    }

    /// Append a round, evicting the oldest snapshot past window capacity.
    pub fn record_round(&mut self, positions: BTreeMap<BranchId, String>, entropy: f64) -> u32 {
        self.round += 1;
        self.window.push_back(ConvergenceSnapshot {
            round: self.round,
            positions_by_branch: positions,
            entropy,
        });
        while self.window.len() > self.config.window_capacity() {
            self.window.pop_front();
        }
        debug!(round = self.round, entropy, "Recorded debate round");
        self.round
    }

    /// Make the next check report [`ConvergenceTrigger::UserForced`].
    pub fn force_convergence(&mut self) {
        info!(round = self.round, "Convergence forced by user");
        self.forced = true;
    }

    /// Similarity of two positions. Empty text scores 0.
    pub async fn position_similarity(&self, a: &str, b: &str) -> f64 {
        if a.trim().is_empty() || b.trim().is_empty() {
            return 0.0;
        }
        self.oracle.similarity(a, b).await
    }

    /// Run the stopping rules in order and return the first that fires.
    pub async fn check_convergence(&self) -> Option<ConvergenceTrigger> {
        let trigger = if self.forced {
            Some(ConvergenceTrigger::UserForced)
        } else if self.round >= self.config.max_rounds {
            Some(ConvergenceTrigger::MaxRounds { rounds: self.round })
        } else if let Some(oscillation) = self.detect_oscillation().await {
            Some(oscillation)
        } else {
            self.detect_stagnation()
        };

        if let Some(trigger) = &trigger {
            info!(round = self.round, trigger = %trigger, "Convergence triggered");
        }
        trigger
    }

    /// A → B → A on any branch of the latest round.
    async fn detect_oscillation(&self) -> Option<ConvergenceTrigger> {
        let n = self.window.len();
        if n < 3 {
            return None;
        }
        let recent = [&self.window[n - 3], &self.window[n - 2], &self.window[n - 1]];
        let threshold = self.config.similarity_threshold;

        let branches: BTreeSet<&BranchId> = recent[2].positions_by_branch.keys().collect();
        for branch_id in branches {
            let (p0, p1, p2) = (
                recent[0].position(branch_id),
                recent[1].position(branch_id),
                recent[2].position(branch_id),
            );

            let sim_far = self.position_similarity(p0, p2).await;
            if sim_far <= threshold {
                continue;
            }
            let sim_first = self.position_similarity(p0, p1).await;
            let sim_second = self.position_similarity(p1, p2).await;

            if sim_first < threshold && sim_second < threshold {
                return Some(ConvergenceTrigger::Oscillation {
                    branch_id: branch_id.clone(),
                    sim_far,
                    sim_first,
                    sim_second,
                });
            }
        }
        None
    }

    /// No consecutive pair in the last `stagnation_rounds + 1` entries
    /// fell by at least the entropy threshold.
    fn detect_stagnation(&self) -> Option<ConvergenceTrigger> {
        let needed = self.config.stagnation_rounds + 1;
        if self.config.stagnation_rounds == 0 || self.window.len() < needed {
            return None;
        }

        let recent: Vec<f64> = self
            .window
            .iter()
            .skip(self.window.len() - needed)
            .map(|s| s.entropy)
            .collect();

        let progressed = recent
            .windows(2)
            .any(|pair| pair[0] - pair[1] >= self.config.entropy_threshold);

        if progressed {
            None
        } else {
            Some(ConvergenceTrigger::EntropyStagnation { recent })
        }
    }

    pub fn status(&self) -> ConvergenceStatus {
        let entropies: Vec<f64> = self.window.iter().map(|s| s.entropy).collect();
        let n = entropies.len();

        let entropy_trend = if n < 2 {
            0.0
        } else {
            let mean_x = (n - 1) as f64 / 2.0;
            let mean_y = entropies.iter().sum::<f64>() / n as f64;
            let (num, den) = entropies
                .iter()
                .enumerate()
                .fold((0.0, 0.0), |(num, den), (i, y)| {
                    let dx = i as f64 - mean_x;
                    (num + dx * (y - mean_y), den + dx * dx)
                });
            num / den
        };

        let convergence_rate = if n < 2 {
            0.0
        } else {
            (entropies[0] - entropies[n - 1]) / (n - 1) as f64
        };

        ConvergenceStatus {
            round: self.round,
            max_rounds: self.config.max_rounds,
            current_entropy: entropies.last().copied(),
            entropy_trend,
            convergence_rate,
            is_converging: entropy_trend < 0.0,
            window_len: n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::NullOracle;
    use std::sync::Arc;

    fn session(max_rounds: u32) -> ConvergenceSession {
        let config = ConvergenceConfig {
            max_rounds,
            ..ConvergenceConfig::default()
        };
        ConvergenceSession::new(config, Arc::new(NullOracle::new()))
    }

    fn positions(pairs: &[(&str, &str)]) -> BTreeMap<BranchId, String> {
        pairs
            .iter()
            .map(|(b, p)| (b.to_string(), p.to_string()))
            .collect()
    }

    const A: &str = "adopt the event sourced design for orders";
    const B: &str = "keep the relational schema and add caching";

    #[tokio::test]
    async fn test_oscillation_a_b_a() {
        let mut s = session(10);
        s.record_round(positions(&[("b1", A)]), 0.9);
        s.record_round(positions(&[("b1", B)]), 0.5);
        assert_eq!(s.check_convergence().await, None);

        s.record_round(positions(&[("b1", A)]), 0.1);
        match s.check_convergence().await {
            Some(ConvergenceTrigger::Oscillation { branch_id, sim_far, .. }) => {
                assert_eq!(branch_id, "b1");
                assert_eq!(sim_far, 1.0);
            }
            other => panic!("expected oscillation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_steady_positions_are_not_oscillation() {
        let mut s = session(10);
        for entropy in [0.9, 0.6, 0.3] {
            s.record_round(positions(&[("b1", A)]), entropy);
        }
        assert_eq!(s.check_convergence().await, None);
    }

    #[tokio::test]
    async fn test_missing_branch_compares_as_empty() {
        let mut s = session(10);
        s.record_round(positions(&[("b2", A)]), 0.9);
        s.record_round(positions(&[("b1", B)]), 0.6);
        s.record_round(positions(&[("b1", A)]), 0.3);
        assert_eq!(s.check_convergence().await, None);
    }

    #[tokio::test]
    async fn test_decreasing_entropy_never_stagnates() {
        let mut s = session(10);
        for (i, entropy) in [0.9, 0.6, 0.3].into_iter().enumerate() {
            s.record_round(positions(&[("b1", &format!("{B} {i}"))]), entropy);
            assert_eq!(s.check_convergence().await, None);
        }
    }

    #[tokio::test]
    async fn test_flat_entropy_stagnates() {
        let mut s = session(10);
        let texts = ["alpha one", "beta two", "gamma three", "delta four"];
        for (i, text) in texts.iter().enumerate() {
            s.record_round(positions(&[("b1", text)]), 0.5);
            let result = s.check_convergence().await;
            if i < 3 {
                assert_eq!(result, None, "round {i}");
            } else {
                assert_eq!(
                    result,
                    Some(ConvergenceTrigger::EntropyStagnation {
                        recent: vec![0.5, 0.5, 0.5, 0.5]
                    })
                );
            }
        }
    }

    #[tokio::test]
    async fn test_max_rounds_fires_first() {
        let mut s = session(3);
        for (i, entropy) in [0.9, 0.6, 0.3].into_iter().enumerate() {
            s.record_round(positions(&[("b1", &format!("{A} {i}"))]), entropy);
        }
        assert_eq!(
            s.check_convergence().await,
            Some(ConvergenceTrigger::MaxRounds { rounds: 3 })
        );
    }

    #[tokio::test]
    async fn test_force_and_reset() {
        let mut s = session(10);
        s.record_round(positions(&[("b1", A)]), 0.5);
        s.force_convergence();
        assert_eq!(s.check_convergence().await, Some(ConvergenceTrigger::UserForced));

        s.reset();
        assert_eq!(s.round(), 0);
        assert_eq!(s.window().count(), 0);
        assert_eq!(s.check_convergence().await, None);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut s = session(100);
        for i in 0..20 {
            s.record_round(BTreeMap::new(), i as f64);
        }
        assert_eq!(s.window().count(), s.config().window_capacity());
        assert_eq!(s.window().next().map(|w| w.round), Some(17));
    }

    #[test]
    fn test_status_trend_and_rate() {
        let mut s = session(10);
        assert_eq!(s.status().entropy_trend, 0.0);

        for entropy in [0.9, 0.6, 0.3] {
            s.record_round(BTreeMap::new(), entropy);
        }
        let status = s.status();
        assert_eq!(status.round, 3);
        assert!((status.entropy_trend + 0.3).abs() < 1e-9);
        assert!((status.convergence_rate - 0.3).abs() < 1e-9);
        assert!(status.is_converging);
        assert_eq!(status.current_entropy, Some(0.3));
    }
}
