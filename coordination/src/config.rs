//! Engine configuration.
//!
//! Defaults are the documented constants. A TOML file may override any
//! subset; `DIALECTIC_*` environment variables are applied last.

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Branch lock protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub default_ttl_secs: u64,
    pub key_prefix: String,
    /// Caller-side retries when a branch is contended.
    pub acquire_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub backoff_base_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            key_prefix: "lock:branch:".to_string(),
            acquire_attempts: 3,
            backoff_base_ms: 50,
        }
    }
}

/// Debate stopping rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    pub max_rounds: u32,
    pub similarity_threshold: f64,
    pub entropy_threshold: f64,
    pub stagnation_rounds: usize,
    /// Mutual entailment needed to put two responses in one cluster.
    pub equivalence_threshold: f64,
    /// Generations sampled by `estimate_uncertainty`.
    pub entropy_samples: usize,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_rounds: 10,
            similarity_threshold: 0.85,
            entropy_threshold: 0.1,
            stagnation_rounds: 3,
            equivalence_threshold: 0.7,
            entropy_samples: 5,
        }
    }
}

impl ConvergenceConfig {
    /// Snapshots kept in the sliding window.
    pub fn window_capacity(&self) -> usize {
        (self.stagnation_rounds + 1).max(3)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParetoConfig {
    pub monte_carlo_samples: usize,
    pub max_front_size: usize,
    pub seed: Option<u64>,
}

impl Default for ParetoConfig {
    fn default() -> Self {
        Self {
            monte_carlo_samples: 10_000,
            max_front_size: 15,
            seed: None,
        }
    }
}

/// Resource allocation and equilibrium settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub resource_budget: f64,
    pub front_boost: f64,
    /// Largest share of the budget one branch may take.
    pub max_share: f64,
    pub nash_iterations: u32,
    pub nash_step: f64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    pub utility_spread_threshold: f64,
    pub max_rounds: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            resource_budget: 1.0,
            front_boost: 1.2,
            max_share: 0.5,
            nash_iterations: 10,
            nash_step: 0.1,
            weight_floor: 0.1,
            weight_ceiling: 0.9,
            utility_spread_threshold: 0.1,
            max_rounds: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensitivityConfig {
    pub samples: usize,
    pub sigma: f64,
    pub max_depth: usize,
    /// Utility fraction below which the graph counts as collapsed.
    pub collapse_fraction: f64,
    pub default_confidence: f64,
    pub seed: Option<u64>,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            samples: 1_000,
            sigma: 0.2,
            max_depth: 20,
            collapse_fraction: 0.1,
            default_confidence: 0.8,
            seed: None,
        }
    }
}

/// Phase pipeline sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub divergence_candidates: usize,
    pub max_branches: usize,
    /// Branches scoring below this after filtering are pruned.
    pub prune_threshold: f64,
    pub agent_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            divergence_candidates: 6,
            max_branches: 4,
            prune_threshold: 0.2,
            agent_ttl_secs: 60,
        }
    }
}

/// Language model endpoint. No `base_url` means the offline oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub embedding_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            timeout_secs: 60,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub lock: LockConfig,
    pub convergence: ConvergenceConfig,
    pub pareto: ParetoConfig,
    pub arbiter: ArbiterConfig,
    pub sensitivity: SensitivityConfig,
    pub pipeline: PipelineConfig,
    pub oracle: OracleConfig,
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|v| v.trim().parse().ok())
}

impl EngineConfig {
    /// Defaults overlaid with environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Apply `DIALECTIC_*` variables from the process environment.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply variables from an arbitrary lookup. Unparseable values are ignored.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(ttl) = parse_var(&lookup, "DIALECTIC_LOCK_TTL_SECS") {
            self.lock.default_ttl_secs = ttl;
        }
        if let Some(rounds) = parse_var(&lookup, "DIALECTIC_MAX_ROUNDS") {
            self.convergence.max_rounds = rounds;
            self.arbiter.max_rounds = rounds;
        }
        if let Some(t) = parse_var(&lookup, "DIALECTIC_SIMILARITY_THRESHOLD") {
            self.convergence.similarity_threshold = t;
        }
        if let Some(t) = parse_var(&lookup, "DIALECTIC_ENTROPY_THRESHOLD") {
            self.convergence.entropy_threshold = t;
        }
        if let Some(n) = parse_var(&lookup, "DIALECTIC_STAGNATION_ROUNDS") {
            self.convergence.stagnation_rounds = n;
        }
        if let Some(budget) = parse_var(&lookup, "DIALECTIC_RESOURCE_BUDGET") {
            self.arbiter.resource_budget = budget;
        }
        if let Some(n) = parse_var(&lookup, "DIALECTIC_MC_SAMPLES") {
            self.pareto.monte_carlo_samples = n;
        }
        if let Some(n) = parse_var(&lookup, "DIALECTIC_SENSITIVITY_SAMPLES") {
            self.sensitivity.samples = n;
        }
        if let Some(n) = parse_var(&lookup, "DIALECTIC_MAX_BRANCHES") {
            self.pipeline.max_branches = n;
        }
        if let Some(n) = parse_var(&lookup, "DIALECTIC_DIVERGENCE_CANDIDATES") {
            self.pipeline.divergence_candidates = n;
        }
        if let Some(seed) = parse_var::<u64>(&lookup, "DIALECTIC_SEED") {
            self.set_seed(seed);
        }
        if let Some(url) = lookup("DIALECTIC_ORACLE_URL").filter(|v| !v.is_empty()) {
            self.oracle.base_url = Some(url);
        }
        if let Some(key) = lookup("DIALECTIC_ORACLE_API_KEY").filter(|v| !v.is_empty()) {
            self.oracle.api_key = Some(key);
        }
        if let Some(model) = lookup("DIALECTIC_ORACLE_MODEL").filter(|v| !v.is_empty()) {
            self.oracle.model = model;
        }
        if let Some(model) = lookup("DIALECTIC_EMBEDDING_MODEL").filter(|v| !v.is_empty()) {
            self.oracle.embedding_model = model;
        }
        self
    }

    /// Seed every Monte Carlo component.
    pub fn set_seed(&mut self, seed: u64) {
        self.pareto.seed = Some(seed);
        self.sensitivity.seed = Some(seed);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |field: &'static str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    field,
                    reason: format!("{v} not in [0, 1]"),
                })
            }
        };
        unit("convergence.similarity_threshold", self.convergence.similarity_threshold)?;
        unit("convergence.equivalence_threshold", self.convergence.equivalence_threshold)?;
        unit("arbiter.max_share", self.arbiter.max_share)?;

        if self.arbiter.resource_budget <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "arbiter.resource_budget",
                reason: "must be positive".to_string(),
            });
        }
        if self.arbiter.weight_floor > self.arbiter.weight_ceiling {
            return Err(ConfigError::Invalid {
                field: "arbiter.weight_floor",
                reason: "exceeds weight_ceiling".to_string(),
            });
        }
        if self.lock.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "lock.default_ttl_secs",
                reason: "must be non-zero".to_string(),
            });
        }
        // Leases are renewed every half TTL in whole seconds.
        if self.pipeline.agent_ttl_secs < 2 {
            return Err(ConfigError::Invalid {
                field: "pipeline.agent_ttl_secs",
                reason: "must be at least 2".to_string(),
            });
        }
        Ok(())
    }
}
