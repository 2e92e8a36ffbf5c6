//! Semantic entropy over clusters of meaning-equivalent responses.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ConvergenceConfig;
use crate::oracle::{GenerateOptions, PromptTask, SharedOracle};

/// Disjoint-set forest with path halving.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Result of sampling the oracle repeatedly on one query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncertaintyEstimate {
    pub entropy: f64,
    pub num_clusters: usize,
    pub num_samples: usize,
    pub is_high_uncertainty: bool,
    pub samples: Vec<String>,
}

/// Clusters responses by bidirectional entailment and measures the
/// spread of meanings.
pub struct SemanticEntropyCalculator {
    oracle: SharedOracle,
    equivalence_threshold: f64,
    num_samples: usize,
}

impl SemanticEntropyCalculator {
    pub fn new(oracle: SharedOracle, config: &ConvergenceConfig) -> Self {
        Self {
            oracle,
            equivalence_threshold: config.equivalence_threshold,
            num_samples: config.entropy_samples,
        }
    }

    /// Both directions entail at or above the threshold.
    pub async fn are_equivalent(&self, a: &str, b: &str) -> bool {
        let forward = self.oracle.entailment(a, b).await;
        if forward < self.equivalence_threshold {
            return false;
        }
        self.oracle.entailment(b, a).await >= self.equivalence_threshold
    }

    /// Groups of response indices, ordered by their first member.
    pub async fn cluster(&self, responses: &[String]) -> Vec<Vec<usize>> {
        let n = responses.len();
        let mut sets = UnionFind::new(n);

        for i in 0..n {
            for j in (i + 1)..n {
                if sets.find(i) == sets.find(j) {
                    continue;
                }
                if self.are_equivalent(&responses[i], &responses[j]).await {
                    sets.union(i, j);
                }
            }
        }

        let mut clusters: Vec<Vec<usize>> = Vec::new();
        let mut root_slot: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            let root = sets.find(i);
            match root_slot[root] {
                Some(slot) => clusters[slot].push(i),
                None => {
                    root_slot[root] = Some(clusters.len());
                    clusters.push(vec![i]);
                }
            }
        }
        clusters
    }

    /// `H = -Σ p·ln(p)` over cluster-size fractions. 0 for no clusters.
    pub fn cluster_entropy(sizes: &[usize]) -> f64 {
        let total: usize = sizes.iter().sum();
        if total == 0 {
            return 0.0;
        }
        sizes
            .iter()
            .filter(|&&s| s > 0)
            .map(|&s| {
                let p = s as f64 / total as f64;
                -p * p.ln()
            })
            .sum()
    }

    pub async fn entropy(&self, responses: &[String]) -> f64 {
        let clusters = self.cluster(responses).await;
        let sizes: Vec<usize> = clusters.iter().map(Vec::len).collect();
        Self::cluster_entropy(&sizes)
    }

    /// Sample the oracle `num_samples` times at high temperature.
    ///
    /// Uncertainty is high when entropy exceeds `ln(n) / 2`.
    pub async fn estimate_uncertainty(&self, query: &str) -> UncertaintyEstimate {
        let opts = GenerateOptions::for_task(PromptTask::Freeform).with_temperature(1.0);
        let mut samples = Vec::with_capacity(self.num_samples);

        for _ in 0..self.num_samples {
            match self.oracle.generate_once(query, &opts).await {
                Ok(text) => samples.push(text),
                Err(e) => warn!(error = %e, "Uncertainty sample failed"),
            }
        }

        let clusters = self.cluster(&samples).await;
        let sizes: Vec<usize> = clusters.iter().map(Vec::len).collect();
        let entropy = Self::cluster_entropy(&sizes);
        let threshold = if samples.is_empty() {
            0.0
        } else {
            (samples.len() as f64).ln() / 2.0
        };

        debug!(
            samples = samples.len(),
            clusters = clusters.len(),
            entropy,
            "Estimated uncertainty"
        );

        UncertaintyEstimate {
            entropy,
            num_clusters: clusters.len(),
            num_samples: samples.len(),
            is_high_uncertainty: entropy > threshold,
            samples,
        }
    }
}
