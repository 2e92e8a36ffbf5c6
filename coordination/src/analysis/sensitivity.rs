//! Monte Carlo confidence perturbation over the goal paths.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::visit::Bfs;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::paths::{PathAnalyzer, PathReport};
use super::{AnalysisError, AnalysisResult, ReasoningGraph};
use crate::config::SensitivityConfig;
use crate::graph::NodeId;

const TOP_CRITICAL_NODES: usize = 10;
const TOP_CUT_SETS: usize = 5;
const CRITICAL_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSensitivity {
    pub node_id: NodeId,
    /// `min(1, std(utility) / baseline)`
    pub score: f64,
    pub baseline_utility: f64,
    /// Highest sampled confidence at which utility collapsed, if any did
    pub collapse_threshold: Option<f64>,
    pub utility_gradient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: NodeId,
    pub utility_before: f64,
    pub utility_after: f64,
    pub utility_drop: f64,
    pub affected_nodes: Vec<NodeId>,
    pub is_catastrophic: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    StrengthenNode,
    AddRedundancy,
    IncreaseRedundancy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub node_id: Option<NodeId>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    pub graph_utility: f64,
    /// `min(1, redundancy_ratio / 2)`
    pub stability_score: f64,
    pub critical_nodes: Vec<NodeSensitivity>,
    pub paths: PathReport,
    pub top_cut_sets: Vec<BTreeSet<NodeId>>,
    pub recommendations: Vec<Recommendation>,
    /// Cycles in the structural graph; non-empty means the graph is not a DAG
    pub cycles: Vec<Vec<NodeId>>,
}

impl SensitivityReport {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

pub struct SensitivityAnalyzer {
    paths: PathAnalyzer,
    config: SensitivityConfig,
}

impl SensitivityAnalyzer {
    pub fn new(graph: ReasoningGraph, config: SensitivityConfig) -> Self {
        let paths = PathAnalyzer::new(graph, config.max_depth)
            .with_default_confidence(config.default_confidence);
        Self { paths, config }
    }

    pub fn paths(&self) -> &PathAnalyzer {
        &self.paths
    }

    fn rng(&self) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Standard normal sample (Box-Muller).
    fn gaussian(rng: &mut StdRng) -> f64 {
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    /// Mean over all goal paths of the product of node confidences.
    pub fn graph_utility(&self, overrides: &HashMap<NodeId, f64>) -> f64 {
        let graph = self.paths.graph();
        if graph.node_count() == 0 {
            return 0.0;
        }
        if self.paths.leaves().is_empty() {
            return 1.0;
        }
        let total = self.paths.total_paths();
        if total == 0 {
            return 0.0;
        }
        let sum: f64 = self
            .paths
            .all_paths()
            .map(|path| {
                path.iter()
                    .map(|id| {
                        overrides
                            .get(id)
                            .copied()
                            .unwrap_or_else(|| self.paths.confidence(id))
                    })
                    .product::<f64>()
            })
            .sum();
        sum / total as f64
    }

    pub fn baseline_utility(&self) -> f64 {
        self.graph_utility(&HashMap::new())
    }

    /// Perturb one node's confidence with N(0, σ) and measure utility spread.
    pub fn single_node_sensitivity(&self, node_id: &str) -> AnalysisResult<NodeSensitivity> {
        let graph = self.paths.graph();
        if !graph.contains(node_id) {
            return Err(AnalysisError::UnknownNode(node_id.to_string()));
        }

        let baseline = self.baseline_utility();
        let current = self.paths.confidence(node_id);
        let collapse_below = baseline * self.config.collapse_fraction;
        let sigma = self.config.sigma;
        let samples = self.config.samples.max(1);

        let mut rng = self.rng();
        let mut overrides = HashMap::new();
        let mut utilities = Vec::with_capacity(samples);
        let mut collapse_threshold: Option<f64> = None;

        for _ in 0..samples {
            let perturbed = (current + sigma * Self::gaussian(&mut rng)).clamp(0.0, 1.0);
            overrides.insert(node_id.to_string(), perturbed);
            let utility = self.graph_utility(&overrides);
            if utility < collapse_below {
                collapse_threshold =
                    Some(collapse_threshold.map_or(perturbed, |t: f64| t.max(perturbed)));
            }
            utilities.push(utility);
        }

        let n = utilities.len() as f64;
        let mean = utilities.iter().sum::<f64>() / n;
        let variance = utilities.iter().map(|u| (u - mean).powi(2)).sum::<f64>() / n;
        let min_utility = utilities.iter().copied().fold(f64::INFINITY, f64::min);

        let score = (variance.sqrt() / baseline.max(0.01)).min(1.0);
        let utility_gradient = if sigma > 0.0 {
            (baseline - min_utility) / sigma
        } else {
            0.0
        };

        debug!(node_id, score, baseline, "Computed node sensitivity");
        Ok(NodeSensitivity {
            node_id: node_id.to_string(),
            score,
            baseline_utility: baseline,
            collapse_threshold,
            utility_gradient,
        })
    }

    /// Set one node's confidence to zero and measure the damage.
    pub fn simulate_node_failure(&self, node_id: &str) -> AnalysisResult<NodeFailure> {
        let graph = self.paths.graph();
        let start = graph
            .index_of(node_id)
            .ok_or_else(|| AnalysisError::UnknownNode(node_id.to_string()))?;

        let before = self.baseline_utility();
        let after = self.graph_utility(&HashMap::from([(node_id.to_string(), 0.0)]));

        let g = graph.petgraph();
        let mut bfs = Bfs::new(g, start);
        let mut affected_nodes = Vec::new();
        while let Some(ix) = bfs.next(g) {
            if ix != start {
                affected_nodes.push(g[ix].clone());
            }
        }

        Ok(NodeFailure {
            node_id: node_id.to_string(),
            utility_before: before,
            utility_after: after,
            utility_drop: before - after,
            affected_nodes,
            is_catastrophic: after < before * self.config.collapse_fraction,
        })
    }

    pub fn recommendations(&self, report: &PathReport) -> Vec<Recommendation> {
        let mut recommendations = Vec::new();
        let mut strengthened: HashSet<&NodeId> = HashSet::new();

        for path in &report.critical_paths {
            let Some(weakest) = &path.weakest_node else {
                continue;
            };
            if !strengthened.insert(weakest) {
                continue;
            }
            recommendations.push(Recommendation {
                kind: RecommendationKind::StrengthenNode,
                priority: if path.weakest_confidence < 0.5 {
                    Priority::High
                } else {
                    Priority::Medium
                },
                node_id: Some(weakest.clone()),
                message: format!(
                    "strengthen {weakest} (confidence {:.2}), the weakest link to {}",
                    path.weakest_confidence, path.leaf_id
                ),
            });
        }

        for cut in &report.minimal_cut_sets {
            for node in cut {
                recommendations.push(Recommendation {
                    kind: RecommendationKind::AddRedundancy,
                    priority: Priority::High,
                    node_id: Some(node.clone()),
                    message: format!("add an alternative path bypassing {node}"),
                });
            }
        }

        if report.redundancy_ratio < 1.0 {
            recommendations.push(Recommendation {
                kind: RecommendationKind::IncreaseRedundancy,
                priority: Priority::Medium,
                node_id: None,
                message: format!(
                    "redundancy ratio {:.2} is below 1.0; support more conclusions independently",
                    report.redundancy_ratio
                ),
            });
        }

        recommendations.sort_by_key(|r| r.priority);
        recommendations
    }

    pub fn analyze(&self) -> SensitivityReport {
        let paths = self.paths.analyze();
        let graph = self.paths.graph();

        let mut critical_nodes: Vec<NodeSensitivity> = graph
            .nodes()
            .filter(|id| *id != graph.goal())
            .filter_map(|id| self.single_node_sensitivity(id).ok())
            .filter(|s| s.score > CRITICAL_SCORE)
            .collect();
        critical_nodes.sort_by(|a, b| b.score.total_cmp(&a.score));
        critical_nodes.truncate(TOP_CRITICAL_NODES);

        let cycles = self.paths.detect_cycles();
        let recommendations = self.recommendations(&paths);
        let stability_score = (paths.redundancy_ratio / 2.0).min(1.0);

        info!(
            paths = paths.total_paths,
            critical_paths = paths.critical_paths.len(),
            stability_score,
            cycles = cycles.len(),
            "Sensitivity analysis complete"
        );

        SensitivityReport {
            graph_utility: self.baseline_utility(),
            stability_score,
            critical_nodes,
            top_cut_sets: paths.minimal_cut_sets.iter().take(TOP_CUT_SETS).cloned().collect(),
            recommendations,
            cycles,
            paths,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;

    fn config() -> SensitivityConfig {
        SensitivityConfig {
            samples: 2_000,
            sigma: 0.5,
            seed: Some(7),
            ..SensitivityConfig::default()
        }
    }

    fn chain() -> ReasoningGraph {
        let mut g = ReasoningGraph::new("goal");
        g.add_node("goal", Some(1.0))
            .add_node("a", Some(0.9))
            .add_node("leaf", Some(0.9))
            .add_edge("goal", "a", EdgeKind::Decompose)
            .add_edge("a", "leaf", EdgeKind::Derive);
        g
    }

    fn diamond() -> ReasoningGraph {
        let mut g = ReasoningGraph::new("goal");
        g.add_node("goal", Some(1.0))
            .add_edge("goal", "a", EdgeKind::Decompose)
            .add_edge("goal", "b", EdgeKind::Decompose)
            .add_edge("a", "leaf", EdgeKind::Derive)
            .add_edge("b", "leaf", EdgeKind::Derive);
        g
    }

    #[test]
    fn test_graph_utility() {
        let s = SensitivityAnalyzer::new(chain(), config());
        assert!((s.baseline_utility() - 0.81).abs() < 1e-12);

        // Unset confidences fall back to 0.8.
        let d = SensitivityAnalyzer::new(diamond(), config());
        assert!((d.baseline_utility() - 0.64).abs() < 1e-12);

        let goal_only = SensitivityAnalyzer::new(ReasoningGraph::new("goal"), config());
        assert_eq!(goal_only.baseline_utility(), 1.0);
    }

    #[test]
    fn test_single_node_sensitivity_is_reproducible() {
        let s = SensitivityAnalyzer::new(chain(), config());
        let first = s.single_node_sensitivity("a").unwrap();
        let second = s.single_node_sensitivity("a").unwrap();
        assert_eq!(first, second);

        assert!(first.score > 0.0 && first.score <= 1.0);
        let threshold = first.collapse_threshold.expect("wide sigma should collapse");
        assert!(threshold < 0.09 + 1e-9);
        assert!(first.utility_gradient > 0.0);

        assert!(matches!(
            s.single_node_sensitivity("nope"),
            Err(AnalysisError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_redundant_node_is_less_sensitive() {
        let chain_a = SensitivityAnalyzer::new(chain(), config())
            .single_node_sensitivity("a")
            .unwrap();
        let diamond_a = SensitivityAnalyzer::new(diamond(), config())
            .single_node_sensitivity("a")
            .unwrap();
        assert!(diamond_a.score < chain_a.score);
    }

    #[test]
    fn test_node_failure() {
        let s = SensitivityAnalyzer::new(chain(), config());
        let failure = s.simulate_node_failure("a").unwrap();
        assert_eq!(failure.utility_after, 0.0);
        assert!(failure.is_catastrophic);
        assert_eq!(failure.affected_nodes, vec!["leaf".to_string()]);

        let d = SensitivityAnalyzer::new(diamond(), config());
        let failure = d.simulate_node_failure("a").unwrap();
        assert!(!failure.is_catastrophic);
        assert!((failure.utility_after - 0.32).abs() < 1e-12);
    }

    #[test]
    fn test_chain_recommendations() {
        let s = SensitivityAnalyzer::new(chain(), config());
        let report = s.analyze();
        let kinds: Vec<RecommendationKind> = report.recommendations.iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&RecommendationKind::StrengthenNode));
        assert!(kinds.contains(&RecommendationKind::AddRedundancy));
        assert!(kinds.contains(&RecommendationKind::IncreaseRedundancy));
        assert_eq!(report.recommendations[0].priority, Priority::High);
        assert_eq!(report.stability_score, 0.0);
        assert!(!report.has_cycles());
    }

    #[test]
    fn test_diamond_is_stable() {
        let report = SensitivityAnalyzer::new(diamond(), config()).analyze();
        assert!(report.recommendations.is_empty());
        assert_eq!(report.stability_score, 1.0);
        assert!(report.top_cut_sets.is_empty());
    }
}
