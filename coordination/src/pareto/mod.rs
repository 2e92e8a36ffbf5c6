//! Multi-objective ranking by Pareto dominance.
//!
//! Used by the Filtering phase to thin candidate branches and by the
//! arbiter to find the branches that get an allocation boost.
//!
//! ```text
//!  candidates ──▶ pareto_front ──▶ crowding_distance ──▶ filter_solutions
//!       │
//!       └──────▶ rank_solutions (peel fronts: layer 0, 1, 2, ...)
//!
//!  front + reference ──▶ hypervolume ──▶ contribution / most_replaceable
//! ```

pub mod hypervolume;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::ParetoConfig;

/// Optimisation direction of an objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Maximize,
    Minimize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub name: String,
    pub direction: Direction,
}

impl Objective {
    pub fn maximize(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Maximize,
        }
    }

    pub fn minimize(name: &str) -> Self {
        Self {
            name: name.to_string(),
            direction: Direction::Minimize,
        }
    }

    /// Value oriented so that larger is always better.
    pub fn oriented(&self, value: f64) -> f64 {
        match self.direction {
            Direction::Maximize => value,
            Direction::Minimize => -value,
        }
    }
}

/// A scored candidate (branch or claim).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub scores: BTreeMap<String, f64>,
}

impl Candidate {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            scores: BTreeMap::new(),
        }
    }

    pub fn with(mut self, objective: &str, value: f64) -> Self {
        self.scores.insert(objective.to_string(), value);
        self
    }

    /// Score for an objective. Missing scores count as 0.
    pub fn value(&self, objective: &str) -> f64 {
        self.scores.get(objective).copied().unwrap_or(0.0)
    }
}

/// A candidate with its non-domination layer (0 = first front).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub layer: usize,
}

/// Pareto front computation over a fixed objective list.
#[derive(Debug, Clone)]
pub struct ParetoOptimizer {
    objectives: Vec<Objective>,
    config: ParetoConfig,
}

impl ParetoOptimizer {
    pub fn new(objectives: Vec<Objective>, config: ParetoConfig) -> Self {
        Self { objectives, config }
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn config(&self) -> &ParetoConfig {
        &self.config
    }

    /// `a` is no worse than `b` on every objective and better on one.
    pub fn dominates(&self, a: &Candidate, b: &Candidate) -> bool {
        let mut strictly_better = false;
        for objective in &self.objectives {
            let va = objective.oriented(a.value(&objective.name));
            let vb = objective.oriented(b.value(&objective.name));
            if va < vb {
                return false;
            }
            if va > vb {
                strictly_better = true;
            }
        }
        strictly_better
    }

    fn front_indices(&self, candidates: &[Candidate], pool: &[usize]) -> Vec<usize> {
        pool.iter()
            .copied()
            .filter(|&i| {
                !pool
                    .iter()
                    .any(|&j| j != i && self.dominates(&candidates[j], &candidates[i]))
            })
            .collect()
    }

    /// Candidates no other candidate dominates, in input order. O(n²).
    pub fn pareto_front(&self, candidates: &[Candidate]) -> Vec<Candidate> {
        let pool: Vec<usize> = (0..candidates.len()).collect();
        self.front_indices(candidates, &pool)
            .into_iter()
            .map(|i| candidates[i].clone())
            .collect()
    }

    fn crowding(&self, front: &[Candidate]) -> Vec<f64> {
        let n = front.len();
        if n <= 2 {
            return vec![f64::INFINITY; n];
        }

        let mut distance = vec![0.0; n];
        for objective in &self.objectives {
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| {
                front[a]
                    .value(&objective.name)
                    .total_cmp(&front[b].value(&objective.name))
            });

            let min = front[order[0]].value(&objective.name);
            let max = front[order[n - 1]].value(&objective.name);
            let range = max - min;
            // Every member ties here, so there is no boundary to protect.
            if range == 0.0 {
                continue;
            }

            distance[order[0]] = f64::INFINITY;
            distance[order[n - 1]] = f64::INFINITY;

            for k in 1..n - 1 {
                let gap = front[order[k + 1]].value(&objective.name)
                    - front[order[k - 1]].value(&objective.name);
                distance[order[k]] += gap / range;
            }
        }
        distance
    }

    /// Crowding distance per candidate id. Boundary members get +∞.
    pub fn crowding_distance(&self, front: &[Candidate]) -> HashMap<String, f64> {
        front
            .iter()
            .zip(self.crowding(front))
            .map(|(c, d)| (c.id.clone(), d))
            .collect()
    }

    /// The Pareto front, thinned to `max_count` by descending crowding distance.
    pub fn filter_solutions(&self, candidates: &[Candidate], max_count: usize) -> Vec<Candidate> {
        let front = self.pareto_front(candidates);
        if front.len() <= max_count {
            return front;
        }

        let distance = self.crowding(&front);
        let mut order: Vec<usize> = (0..front.len()).collect();
        order.sort_by(|&a, &b| distance[b].total_cmp(&distance[a]));
        order.truncate(max_count);
        order.sort_unstable();
        order.into_iter().map(|i| front[i].clone()).collect()
    }

    /// Like `filter_solutions` with the configured maximum front size.
    pub fn filter_default(&self, candidates: &[Candidate]) -> Vec<Candidate> {
        self.filter_solutions(candidates, self.config.max_front_size)
    }

    /// Peel successive fronts until every candidate has a layer.
    pub fn rank_solutions(&self, candidates: &[Candidate]) -> Vec<RankedCandidate> {
        let mut remaining: Vec<usize> = (0..candidates.len()).collect();
        let mut ranked = Vec::with_capacity(candidates.len());
        let mut layer = 0;

        while !remaining.is_empty() {
            let front = self.front_indices(candidates, &remaining);
            remaining.retain(|i| !front.contains(i));
            ranked.extend(front.into_iter().map(|i| RankedCandidate {
                candidate: candidates[i].clone(),
                layer,
            }));
            layer += 1;
        }
        ranked
    }
}
