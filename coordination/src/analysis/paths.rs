//! Goal-to-leaf path enumeration and classification.
//!
//! Path enumeration is exponential in the worst case. It is bounded by
//! `max_depth` and must only run on bounded session graphs.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ReasoningGraph;
use crate::graph::NodeId;

pub type Path = Vec<NodeId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    Critical,
    Redundant,
}

/// Only path to its leaf; any node failure cuts the leaf off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalPath {
    pub path_id: String,
    pub leaf_id: NodeId,
    pub node_ids: Path,
    pub weakest_node: Option<NodeId>,
    pub weakest_confidence: f64,
}

/// One of several paths to the same leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedundantPath {
    pub path_id: String,
    pub leaf_id: NodeId,
    pub node_ids: Path,
    /// Number of sibling paths to the same leaf
    pub alternatives: usize,
    pub backup_paths: Vec<String>,
}

/// Per-path view: which interior nodes no other path passes through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathClassification {
    pub kind: PathKind,
    pub critical_nodes: Vec<NodeId>,
    pub alternative_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub node_id: NodeId,
    pub affected_leaves: Vec<NodeId>,
    /// Affected leaves over all leaves
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathFailure {
    pub remaining_paths: Vec<Path>,
    pub affected_leaves: Vec<NodeId>,
    pub can_recover: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStatistics {
    pub total_paths: usize,
    pub avg_path_length: f64,
    pub max_path_length: usize,
    pub min_path_length: usize,
    pub unique_nodes: usize,
}

/// Statically determinate (more critical than redundant paths) or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralClass {
    Determinate,
    Indeterminate,
}

impl std::fmt::Display for StructuralClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Determinate => write!(f, "determinate"),
            Self::Indeterminate => write!(f, "indeterminate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathReport {
    pub critical_paths: Vec<CriticalPath>,
    pub redundant_paths: Vec<RedundantPath>,
    pub minimal_cut_sets: Vec<BTreeSet<NodeId>>,
    pub redundancy_ratio: f64,
    pub classification: StructuralClass,
    pub total_paths: usize,
}

/// Path enumeration over a [`ReasoningGraph`], cached per leaf.
#[derive(Debug, Clone)]
pub struct PathAnalyzer {
    graph: ReasoningGraph,
    max_depth: usize,
    default_confidence: f64,
    leaves: Vec<NodeId>,
    paths_by_leaf: Vec<Vec<Path>>,
}

impl PathAnalyzer {
    pub fn new(graph: ReasoningGraph, max_depth: usize) -> Self {
        let leaves = graph.leaves();
        let mut analyzer = Self {
            graph,
            max_depth,
            default_confidence: 0.8,
            leaves,
            paths_by_leaf: Vec::new(),
        };
        let goal = analyzer.graph.goal().to_string();
        analyzer.paths_by_leaf = analyzer
            .leaves
            .iter()
            .map(|leaf| analyzer.find_all_paths(&goal, leaf, analyzer.max_depth))
            .collect();
        debug!(
            leaves = analyzer.leaves.len(),
            paths = analyzer.total_paths(),
            "Enumerated goal paths"
        );
        analyzer
    }

    /// Confidence used for nodes that carry none.
    pub fn with_default_confidence(mut self, confidence: f64) -> Self {
        self.default_confidence = confidence;
        self
    }

    pub fn graph(&self) -> &ReasoningGraph {
        &self.graph
    }

    /// Depth bound used for the cached goal paths.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    pub fn confidence(&self, id: &str) -> f64 {
        self.graph.confidence(id).unwrap_or(self.default_confidence)
    }

    /// `(leaf, paths to it)` in leaf order.
    pub fn paths_by_leaf(&self) -> impl Iterator<Item = (&NodeId, &[Path])> {
        self.leaves
            .iter()
            .zip(self.paths_by_leaf.iter().map(Vec::as_slice))
    }

    pub fn all_paths(&self) -> impl Iterator<Item = &Path> {
        self.paths_by_leaf.iter().flatten()
    }

    pub fn total_paths(&self) -> usize {
        self.paths_by_leaf.iter().map(Vec::len).sum()
    }

    /// Simple paths from `from` to `to` with at most `max_depth` edges.
    pub fn find_all_paths(&self, from: &str, to: &str, max_depth: usize) -> Vec<Path> {
        let mut paths = Vec::new();
        let mut stack = vec![from.to_string()];
        let mut on_path: HashSet<String> = HashSet::from([from.to_string()]);
        self.walk(to, max_depth, &mut stack, &mut on_path, &mut paths);
        paths
    }

    fn walk(
        &self,
        to: &str,
        depth_left: usize,
        stack: &mut Vec<NodeId>,
        on_path: &mut HashSet<NodeId>,
        out: &mut Vec<Path>,
    ) {
        let Some(current) = stack.last().cloned() else {
            return;
        };
        if current == to {
            out.push(stack.clone());
            return;
        }
        if depth_left == 0 {
            return;
        }
        for child in self.graph.children(&current) {
            if on_path.contains(child) {
                continue;
            }
            on_path.insert(child.clone());
            stack.push(child.clone());
            self.walk(to, depth_left - 1, stack, on_path, out);
            stack.pop();
            on_path.remove(child);
        }
    }

    /// Paths that are the only route to their leaf.
    pub fn identify_critical_paths(&self) -> Vec<CriticalPath> {
        self.paths_by_leaf()
            .enumerate()
            .filter(|(_, (_, paths))| paths.len() == 1)
            .map(|(i, (leaf, paths))| {
                let path = &paths[0];
                let mut weakest_node = None;
                let mut weakest_confidence = 1.0;
                for id in path {
                    let c = self.confidence(id);
                    if c < weakest_confidence {
                        weakest_confidence = c;
                        weakest_node = Some(id.clone());
                    }
                }
                CriticalPath {
                    path_id: format!("critical_{i}"),
                    leaf_id: leaf.clone(),
                    node_ids: path.clone(),
                    weakest_node,
                    weakest_confidence,
                }
            })
            .collect()
    }

    /// Paths to leaves reachable more than one way, with sibling ids.
    pub fn identify_redundant_paths(&self) -> Vec<RedundantPath> {
        let mut redundant = Vec::new();
        for (i, (leaf, paths)) in self.paths_by_leaf().enumerate() {
            if paths.len() < 2 {
                continue;
            }
            for (j, path) in paths.iter().enumerate() {
                redundant.push(RedundantPath {
                    path_id: format!("path_{i}_{j}"),
                    leaf_id: leaf.clone(),
                    node_ids: path.clone(),
                    alternatives: paths.len() - 1,
                    backup_paths: (0..paths.len())
                        .filter(|k| *k != j)
                        .map(|k| format!("path_{i}_{k}"))
                        .collect(),
                });
            }
        }
        redundant
    }

    /// Per leaf, interior nodes shared by every path to it. Supersets of
    /// another cut set are dropped.
    pub fn compute_minimal_cut_sets(&self) -> Vec<BTreeSet<NodeId>> {
        let mut cut_sets: Vec<BTreeSet<NodeId>> = Vec::new();

        for (_, paths) in self.paths_by_leaf() {
            let Some(first) = paths.first() else {
                continue;
            };
            let interior = |p: &Path| -> Vec<NodeId> {
                if p.len() > 2 {
                    p[1..p.len() - 1].to_vec()
                } else {
                    Vec::new()
                }
            };
            let rest: Vec<HashSet<NodeId>> = paths[1..]
                .iter()
                .map(|p| interior(p).into_iter().collect())
                .collect();

            for node in interior(first) {
                if rest.iter().all(|set| set.contains(&node)) {
                    cut_sets.push(BTreeSet::from([node]));
                }
            }
        }

        minimize(cut_sets)
    }

    /// Share of all paths passing through `node_id`.
    pub fn compute_node_criticality(&self, node_id: &str) -> f64 {
        if !self.graph.contains(node_id) {
            return 0.0;
        }
        let total = self.total_paths();
        if total == 0 {
            return 0.0;
        }
        let with_node = self
            .all_paths()
            .filter(|p| p.iter().any(|n| n == node_id))
            .count();
        with_node as f64 / total as f64
    }

    /// Paths to multi-path leaves over single-path leaves.
    ///
    /// `+∞` with redundancy but no critical path, 1.0 with neither.
    pub fn compute_redundancy_ratio(&self) -> f64 {
        let mut critical = 0usize;
        let mut redundant = 0usize;
        for (_, paths) in self.paths_by_leaf() {
            match paths.len() {
                0 => {}
                1 => critical += 1,
                n => redundant += n,
            }
        }
        match (critical, redundant) {
            (0, 0) => 1.0,
            (0, _) => f64::INFINITY,
            (c, r) => r as f64 / c as f64,
        }
    }

    pub fn classify_path(&self, path: &[NodeId]) -> PathClassification {
        if path.len() < 2 {
            return PathClassification {
                kind: PathKind::Critical,
                critical_nodes: path.to_vec(),
                alternative_count: 0,
            };
        }

        let critical_nodes: Vec<NodeId> = path[1..path.len() - 1]
            .iter()
            .filter(|id| self.all_paths().filter(|p| p.contains(id)).count() == 1)
            .cloned()
            .collect();

        let (start, end) = (&path[0], &path[path.len() - 1]);
        let alternative_count = self
            .all_paths()
            .filter(|p| p.first() == Some(start) && p.last() == Some(end) && p.as_slice() != path)
            .count();

        PathClassification {
            kind: if critical_nodes.is_empty() {
                PathKind::Redundant
            } else {
                PathKind::Critical
            },
            critical_nodes,
            alternative_count,
        }
    }

    /// Interior nodes every path to some leaf depends on, by impact.
    pub fn identify_bottlenecks(&self) -> Vec<Bottleneck> {
        let mut affected: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut order: Vec<NodeId> = Vec::new();

        for (leaf, paths) in self.paths_by_leaf() {
            let Some(first) = paths.first() else {
                continue;
            };
            for node in first {
                if node == leaf || node == self.graph.goal() {
                    continue;
                }
                if paths[1..].iter().all(|p| p.contains(node)) {
                    let entry = affected.entry(node.clone()).or_insert_with(|| {
                        order.push(node.clone());
                        Vec::new()
                    });
                    entry.push(leaf.clone());
                }
            }
        }

        let leaf_count = self.leaves.len().max(1) as f64;
        let mut bottlenecks: Vec<Bottleneck> = order
            .into_iter()
            .filter_map(|id| {
                affected.remove(&id).map(|leaves| Bottleneck {
                    impact: leaves.len() as f64 / leaf_count,
                    node_id: id,
                    affected_leaves: leaves,
                })
            })
            .collect();
        bottlenecks.sort_by(|a, b| b.impact.total_cmp(&a.impact));
        bottlenecks
    }

    /// Remove every interior node of `path` and see which leaves survive.
    pub fn simulate_path_failure(&self, path: &[NodeId]) -> PathFailure {
        if path.is_empty() {
            return PathFailure {
                remaining_paths: Vec::new(),
                affected_leaves: Vec::new(),
                can_recover: true,
            };
        }
        let failed: HashSet<&NodeId> = path.iter().collect();

        let mut remaining_paths = Vec::new();
        let mut affected_leaves = Vec::new();
        for (leaf, paths) in self.paths_by_leaf() {
            let valid: Vec<Path> = paths
                .iter()
                .filter(|p| {
                    p.len() <= 2 || !p[1..p.len() - 1].iter().any(|n| failed.contains(n))
                })
                .cloned()
                .collect();
            if valid.is_empty() {
                affected_leaves.push(leaf.clone());
            } else {
                remaining_paths.extend(valid);
            }
        }

        PathFailure {
            can_recover: affected_leaves.is_empty(),
            remaining_paths,
            affected_leaves,
        }
    }

    pub fn statistics(&self) -> PathStatistics {
        let lengths: Vec<usize> = self.all_paths().map(Vec::len).collect();
        if lengths.is_empty() {
            return PathStatistics {
                total_paths: 0,
                avg_path_length: 0.0,
                max_path_length: 0,
                min_path_length: 0,
                unique_nodes: 0,
            };
        }
        let unique: HashSet<&NodeId> = self.all_paths().flatten().collect();
        PathStatistics {
            total_paths: lengths.len(),
            avg_path_length: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
            max_path_length: lengths.iter().copied().max().unwrap_or(0),
            min_path_length: lengths.iter().copied().min().unwrap_or(0),
            unique_nodes: unique.len(),
        }
    }

    /// Strongly connected components of the vertical sub-graph with more
    /// than one node. Each one is a cycle where a DAG was expected.
    pub fn detect_cycles(&self) -> Vec<Vec<NodeId>> {
        let g = self.graph.petgraph();
        let mut cycles: Vec<Vec<NodeId>> = tarjan_scc(g)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .map(|scc| {
                let mut ids: Vec<NodeId> = scc.into_iter().map(|ix| g[ix].clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();
        cycles
    }

    pub fn analyze(&self) -> PathReport {
        let critical_paths = self.identify_critical_paths();
        let redundant_paths = self.identify_redundant_paths();
        let classification = if critical_paths.len() > redundant_paths.len() {
            StructuralClass::Determinate
        } else {
            StructuralClass::Indeterminate
        };
        PathReport {
            minimal_cut_sets: self.compute_minimal_cut_sets(),
            redundancy_ratio: self.compute_redundancy_ratio(),
            total_paths: self.total_paths(),
            critical_paths,
            redundant_paths,
            classification,
        }
    }
}

/// Drop duplicates and strict supersets, keeping first-seen order.
fn minimize(mut sets: Vec<BTreeSet<NodeId>>) -> Vec<BTreeSet<NodeId>> {
    sets.sort_by_key(BTreeSet::len);
    let mut minimal: Vec<BTreeSet<NodeId>> = Vec::new();
    for set in sets {
        if minimal.iter().any(|m| m.is_subset(&set)) {
            continue;
        }
        minimal.push(set);
    }
    minimal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;

    fn build(edges: &[(&str, &str)]) -> PathAnalyzer {
        let mut g = ReasoningGraph::new("goal");
        for (s, t) in edges {
            g.add_edge(s, t, EdgeKind::Decompose);
        }
        PathAnalyzer::new(g, 20)
    }

    fn chain() -> PathAnalyzer {
        build(&[("goal", "a"), ("a", "leaf")])
    }

    fn diamond() -> PathAnalyzer {
        build(&[("goal", "a"), ("goal", "b"), ("a", "leaf"), ("b", "leaf")])
    }

    #[test]
    fn test_find_all_paths_respects_depth() {
        let p = diamond();
        assert_eq!(p.find_all_paths("goal", "leaf", 20).len(), 2);
        assert!(p.find_all_paths("goal", "leaf", 1).is_empty());
        assert_eq!(p.find_all_paths("goal", "goal", 0), vec![vec!["goal".to_string()]]);
    }

    #[test]
    fn test_cached_paths_use_analyzer_depth() {
        let mut g = ReasoningGraph::new("goal");
        g.add_edge("goal", "a", EdgeKind::Decompose)
            .add_edge("a", "b", EdgeKind::Derive)
            .add_edge("b", "leaf", EdgeKind::Derive);
        let shallow = PathAnalyzer::new(g.clone(), 2);
        assert_eq!(shallow.max_depth(), 2);
        assert_eq!(shallow.total_paths(), 0);
        assert_eq!(PathAnalyzer::new(g, 3).total_paths(), 1);
    }

    #[test]
    fn test_cut_sets_chain_and_diamond() {
        let expected: Vec<BTreeSet<NodeId>> = vec![BTreeSet::from(["a".to_string()])];
        assert_eq!(chain().compute_minimal_cut_sets(), expected);
        assert!(diamond().compute_minimal_cut_sets().is_empty());
    }

    #[test]
    fn test_critical_and_redundant_paths() {
        let p = build(&[
            ("goal", "a"),
            ("a", "solo"),
            ("goal", "b"),
            ("goal", "c"),
            ("b", "shared"),
            ("c", "shared"),
        ]);
        let critical = p.identify_critical_paths();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].leaf_id, "solo");
        assert_eq!(critical[0].node_ids, vec!["goal", "a", "solo"]);

        let redundant = p.identify_redundant_paths();
        assert_eq!(redundant.len(), 2);
        assert_eq!(redundant[0].path_id, "path_1_0");
        assert_eq!(redundant[0].backup_paths, vec!["path_1_1".to_string()]);
        assert_eq!(redundant[1].alternatives, 1);
    }

    #[test]
    fn test_redundancy_ratio_edge_cases() {
        // One single-path leaf, one two-path leaf.
        let mixed = build(&[
            ("goal", "a"),
            ("a", "solo"),
            ("goal", "b"),
            ("goal", "c"),
            ("b", "shared"),
            ("c", "shared"),
        ]);
        let ratio = mixed.compute_redundancy_ratio();
        assert!(ratio.is_finite() && ratio > 0.0);
        assert_eq!(ratio, 2.0);

        assert_eq!(PathAnalyzer::new(ReasoningGraph::new("goal"), 20).compute_redundancy_ratio(), 1.0);
        assert!(diamond().compute_redundancy_ratio().is_infinite());
        assert_eq!(chain().compute_redundancy_ratio(), 0.0);
    }

    #[test]
    fn test_node_criticality() {
        let d = diamond();
        assert_eq!(d.compute_node_criticality("leaf"), 1.0);
        assert_eq!(d.compute_node_criticality("a"), 0.5);
        assert_eq!(d.compute_node_criticality("missing"), 0.0);
    }

    #[test]
    fn test_classify_path() {
        let d = diamond();
        let path: Path = vec!["goal".into(), "a".into(), "leaf".into()];
        let c = d.classify_path(&path);
        assert_eq!(c.kind, PathKind::Critical);
        assert_eq!(c.critical_nodes, vec!["a".to_string()]);
        assert_eq!(c.alternative_count, 1);

        let short = d.classify_path(&["goal".to_string()]);
        assert_eq!(short.kind, PathKind::Critical);
    }

    #[test]
    fn test_bottlenecks() {
        let p = build(&[("goal", "hub"), ("hub", "x"), ("hub", "y"), ("goal", "z")]);
        let bottlenecks = p.identify_bottlenecks();
        assert_eq!(bottlenecks.len(), 1);
        assert_eq!(bottlenecks[0].node_id, "hub");
        assert_eq!(bottlenecks[0].affected_leaves, vec!["x", "y"]);
        assert!((bottlenecks[0].impact - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_path_failure() {
        let d = diamond();
        let failed = d.simulate_path_failure(&["goal".into(), "a".into(), "leaf".into()]);
        assert!(failed.can_recover);
        assert_eq!(failed.remaining_paths, vec![vec!["goal", "b", "leaf"]]);

        let c = build(&[("goal", "a"), ("a", "x"), ("goal", "y")]);
        let result = c.simulate_path_failure(&["goal".into(), "a".into(), "x".into()]);
        assert_eq!(result.affected_leaves, vec!["x".to_string()]);
        assert!(!result.can_recover);
        assert_eq!(result.remaining_paths.len(), 1);
        assert!(c.simulate_path_failure(&[]).can_recover);
    }

    #[test]
    fn test_statistics_and_classification() {
        let stats = diamond().statistics();
        assert_eq!(stats.total_paths, 2);
        assert_eq!(stats.max_path_length, 3);
        assert_eq!(stats.unique_nodes, 4);
        assert_eq!(chain().analyze().classification, StructuralClass::Determinate);
        assert_eq!(diamond().analyze().classification, StructuralClass::Indeterminate);
    }

    #[test]
    fn test_detect_cycles() {
        let mut g = ReasoningGraph::new("goal");
        g.add_edge("goal", "a", EdgeKind::Decompose)
            .add_edge("a", "b", EdgeKind::Derive)
            .add_edge("b", "a", EdgeKind::Derive)
            .add_edge("b", "c", EdgeKind::Support);
        let p = PathAnalyzer::new(g, 20);
        assert_eq!(p.detect_cycles(), vec![vec!["a".to_string(), "b".to_string()]]);
        assert!(diamond().detect_cycles().is_empty());
    }
}
