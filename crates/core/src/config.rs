use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::env;

use crate::evolution::{CrossoverType, ScoreWeights};
use evolv_shared::{EvolvError, EvolvResult};

/// Rule-based reflection thresholds. These are tuning constants, exposed as
/// configuration so tests and callers can move them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflectionThresholds {
    /// Summed token usage above which a trace batch counts as token-heavy.
    pub high_token_usage: u64,
    /// Error fraction above which reliability dominates the diagnosis.
    pub error_rate_cutoff: f64,
    /// Mean per-call latency (ms) above which calls count as slow.
    pub slow_call_ms: u64,
}

impl ReflectionThresholds {
    pub fn validate(&self) -> EvolvResult<()> {
        if self.high_token_usage == 0 {
            return Err(EvolvError::Configuration(
                "high_token_usage must be > 0".to_string(),
            ));
        }
        if !self.error_rate_cutoff.is_finite() || !(0.0..=1.0).contains(&self.error_rate_cutoff) {
            return Err(EvolvError::Configuration(format!(
                "error_rate_cutoff must be in [0.0, 1.0], got {}",
                self.error_rate_cutoff
            )));
        }
        if self.slow_call_ms == 0 {
            return Err(EvolvError::Configuration(
                "slow_call_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ReflectionThresholds {
    fn default() -> Self {
        Self {
            high_token_usage: 2000,
            error_rate_cutoff: 0.3,
            slow_call_ms: 2000,
        }
    }
}

/// Engine configuration (read-only to the engine once constructed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    pub num_generations: usize,
    pub population_size: usize,
    pub mutation_rate: f64,
    pub crossover_rate: f64,
    pub crossover_types: Vec<CrossoverType>,
    pub use_pareto_selection: bool,
    /// Reference naming the reflection model an adapter should bind
    /// (e.g. a provider/model identifier). None disables LLM reflection.
    pub reflection_model_ref: Option<String>,
    /// Maximum in-flight example evaluations per candidate.
    pub max_concurrency: usize,
    /// Per-example call timeout, converted to a scored failure on expiry.
    pub example_timeout_secs: u64,
    pub weights: ScoreWeights,
    /// Token budget per example before token_efficiency starts penalizing.
    pub token_budget: u64,
    pub tournament_size: usize,
    pub reflection: ReflectionThresholds,
    /// Fixed RNG seed for reproducible runs. None seeds from entropy.
    pub random_seed: Option<u64>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            num_generations: 10,
            population_size: 8,
            mutation_rate: 0.3,
            crossover_rate: 0.7,
            crossover_types: CrossoverType::ALL.to_vec(),
            use_pareto_selection: true,
            reflection_model_ref: None,
            max_concurrency: 4,
            example_timeout_secs: 30,
            weights: ScoreWeights::default(),
            token_budget: 1000,
            tournament_size: 3,
            reflection: ReflectionThresholds::default(),
            random_seed: None,
        }
    }
}

impl EvolutionConfig {
    pub fn validate(&self) -> EvolvResult<()> {
        if self.population_size == 0 || self.population_size > 1024 {
            return Err(EvolvError::Configuration(format!(
                "population_size must be between 1 and 1024 (got {})",
                self.population_size
            )));
        }
        if self.num_generations > 10_000 {
            return Err(EvolvError::Configuration(format!(
                "num_generations must be <= 10000 (got {})",
                self.num_generations
            )));
        }
        for (name, val) in [
            ("mutation_rate", self.mutation_rate),
            ("crossover_rate", self.crossover_rate),
        ] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                return Err(EvolvError::Configuration(format!(
                    "{name} must be in [0.0, 1.0] and finite, got {val}"
                )));
            }
        }
        if self.crossover_types.is_empty() {
            return Err(EvolvError::Configuration(
                "crossover_types must not be empty".to_string(),
            ));
        }
        if self.max_concurrency == 0 || self.max_concurrency > 256 {
            return Err(EvolvError::Configuration(format!(
                "max_concurrency must be between 1 and 256 (got {})",
                self.max_concurrency
            )));
        }
        if self.example_timeout_secs == 0 || self.example_timeout_secs > 600 {
            return Err(EvolvError::Configuration(format!(
                "example_timeout_secs must be between 1 and 600 (got {})",
                self.example_timeout_secs
            )));
        }
        if self.tournament_size == 0 {
            return Err(EvolvError::Configuration(
                "tournament_size must be > 0".to_string(),
            ));
        }
        if self.token_budget == 0 {
            return Err(EvolvError::Configuration(
                "token_budget must be > 0".to_string(),
            ));
        }
        self.weights.validate()?;
        self.reflection.validate()?;
        Ok(())
    }

    /// Load configuration from `EVOLV_*` environment variables, falling back
    /// to defaults for anything unset. Values are range-validated; a bad
    /// value fails loading rather than being silently clamped.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Ok(v) = env::var("EVOLV_NUM_GENERATIONS") {
            config.num_generations = v
                .parse()
                .context("Failed to parse EVOLV_NUM_GENERATIONS")?;
        }
        if let Ok(v) = env::var("EVOLV_POPULATION_SIZE") {
            config.population_size = v
                .parse()
                .context("Failed to parse EVOLV_POPULATION_SIZE")?;
        }
        if let Ok(v) = env::var("EVOLV_MUTATION_RATE") {
            config.mutation_rate = v.parse().context("Failed to parse EVOLV_MUTATION_RATE")?;
        }
        if let Ok(v) = env::var("EVOLV_CROSSOVER_RATE") {
            config.crossover_rate = v.parse().context("Failed to parse EVOLV_CROSSOVER_RATE")?;
        }
        if let Ok(v) = env::var("EVOLV_CROSSOVER_TYPES") {
            // Unknown names are skipped with a warning instead of failing the
            // whole load; an empty result is still rejected by validate().
            let types: Vec<CrossoverType> = v
                .split(',')
                .filter_map(|name| {
                    let parsed = CrossoverType::parse(name);
                    if parsed.is_none() {
                        tracing::warn!(name = %name.trim(), "Skipping unknown crossover type");
                    }
                    parsed
                })
                .collect();
            config.crossover_types = types;
        }
        if let Ok(v) = env::var("EVOLV_USE_PARETO") {
            config.use_pareto_selection = v
                .parse()
                .context("Failed to parse EVOLV_USE_PARETO as bool")?;
        }
        if let Ok(v) = env::var("EVOLV_REFLECTION_MODEL") {
            config.reflection_model_ref = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = env::var("EVOLV_MAX_CONCURRENCY") {
            config.max_concurrency = v
                .parse()
                .context("Failed to parse EVOLV_MAX_CONCURRENCY")?;
        }
        if let Ok(v) = env::var("EVOLV_EXAMPLE_TIMEOUT_SECS") {
            config.example_timeout_secs = v
                .parse()
                .context("Failed to parse EVOLV_EXAMPLE_TIMEOUT_SECS")?;
        }
        if let Ok(v) = env::var("EVOLV_TOKEN_BUDGET") {
            config.token_budget = v.parse().context("Failed to parse EVOLV_TOKEN_BUDGET")?;
        }
        if let Ok(v) = env::var("EVOLV_RANDOM_SEED") {
            config.random_seed = Some(v.parse().context("Failed to parse EVOLV_RANDOM_SEED")?);
        }

        config.validate()?;
        Ok(config)
    }
}
