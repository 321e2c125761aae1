use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use evolv_shared::{EvolvError, EvolvResult, Example};

// ══════════════════════════════════════════════════════════════
// Genetic operator kinds
// ══════════════════════════════════════════════════════════════

/// Instruction mutation kinds. The set is closed: reflection output naming
/// anything else is filtered before it reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Rewrite,
    Expand,
    Combine,
    Simplify,
    Rephrase,
}

impl MutationKind {
    pub const ALL: [MutationKind; 5] = [
        Self::Rewrite,
        Self::Expand,
        Self::Combine,
        Self::Simplify,
        Self::Rephrase,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rewrite => "rewrite",
            Self::Expand => "expand",
            Self::Combine => "combine",
            Self::Simplify => "simplify",
            Self::Rephrase => "rephrase",
        }
    }

    /// Parse a kind name; returns None for anything outside the fixed set.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "rewrite" => Some(Self::Rewrite),
            "expand" => Some(Self::Expand),
            "combine" => Some(Self::Combine),
            "simplify" => Some(Self::Simplify),
            "rephrase" => Some(Self::Rephrase),
            _ => None,
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crossover operator kinds configurable on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossoverType {
    Uniform,
    Blend,
    Structured,
}

impl CrossoverType {
    pub const ALL: [CrossoverType; 3] = [Self::Uniform, Self::Blend, Self::Structured];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uniform => "uniform",
            Self::Blend => "blend",
            Self::Structured => "structured",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "uniform" => Some(Self::Uniform),
            "blend" => Some(Self::Blend),
            "structured" => Some(Self::Structured),
            _ => None,
        }
    }
}

impl std::fmt::Display for CrossoverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ══════════════════════════════════════════════════════════════
// Fitness
// ══════════════════════════════════════════════════════════════

/// Weights combining the primary metric with the secondary objectives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub primary: f64,
    pub secondary: f64,
}

impl ScoreWeights {
    pub fn validate(&self) -> EvolvResult<()> {
        for (name, val) in [("primary", self.primary), ("secondary", self.secondary)] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                return Err(EvolvError::Configuration(format!(
                    "{name} weight must be in [0.0, 1.0] and finite, got {val}"
                )));
            }
        }
        if self.primary < self.secondary {
            return Err(EvolvError::Configuration(format!(
                "primary weight ({}) must be >= secondary weight ({})",
                self.primary, self.secondary
            )));
        }
        let sum = self.primary + self.secondary;
        if (sum - 1.0).abs() > 0.01 {
            return Err(EvolvError::Configuration(format!(
                "weights must sum to ~1.0, got {sum:.4}"
            )));
        }
        Ok(())
    }
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            primary: 0.6,
            secondary: 0.4,
        }
    }
}

/// Multi-objective fitness of one candidate over a training set.
///
/// Immutable once constructed. `overall_score` is derived deterministically
/// from `primary_score` and the mean of `secondary_scores`; all components
/// are validated into [0.0, 1.0] at construction. Equality and hashing are
/// value-based so identical-content scores collapse when used as map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessScore {
    primary_score: f64,
    secondary_scores: BTreeMap<String, f64>,
    overall_score: f64,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl FitnessScore {
    pub fn new(
        primary_score: f64,
        secondary_scores: BTreeMap<String, f64>,
        weights: &ScoreWeights,
    ) -> EvolvResult<Self> {
        weights.validate()?;
        if !primary_score.is_finite() || !(0.0..=1.0).contains(&primary_score) {
            return Err(EvolvError::Configuration(format!(
                "primary_score must be in [0.0, 1.0], got {primary_score}"
            )));
        }
        for (name, val) in &secondary_scores {
            if !val.is_finite() || !(0.0..=1.0).contains(val) {
                return Err(EvolvError::Configuration(format!(
                    "secondary score {name} must be in [0.0, 1.0], got {val}"
                )));
            }
        }

        let secondary_mean = if secondary_scores.is_empty() {
            0.0
        } else {
            secondary_scores.values().sum::<f64>() / secondary_scores.len() as f64
        };
        let overall_score =
            (weights.primary * primary_score + weights.secondary * secondary_mean).clamp(0.0, 1.0);

        Ok(Self {
            primary_score,
            secondary_scores,
            overall_score,
            metadata: BTreeMap::new(),
        })
    }

    /// Score assigned to a candidate whose evaluation failed entirely:
    /// zero on every objective, with the failure count recorded.
    #[must_use]
    pub fn failed(errors_count: u64) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "errors_count".to_string(),
            serde_json::Value::from(errors_count),
        );
        Self {
            primary_score: 0.0,
            secondary_scores: BTreeMap::new(),
            overall_score: 0.0,
            metadata,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn primary_score(&self) -> f64 {
        self.primary_score
    }

    #[must_use]
    pub fn overall_score(&self) -> f64 {
        self.overall_score
    }

    #[must_use]
    pub fn secondary_scores(&self) -> &BTreeMap<String, f64> {
        &self.secondary_scores
    }

    #[must_use]
    pub fn secondary(&self, name: &str) -> Option<f64> {
        self.secondary_scores.get(name).copied()
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    #[must_use]
    pub fn errors_count(&self) -> u64 {
        self.metadata
            .get("errors_count")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0)
    }

    /// Value along one objective dimension. `"primary"` addresses the
    /// primary metric; anything else addresses a secondary score, with
    /// absent dimensions read as 0.0 so scores with differing secondary
    /// key sets stay comparable.
    #[must_use]
    pub fn objective_value(&self, dimension: &str) -> f64 {
        if dimension == PRIMARY_DIMENSION {
            self.primary_score
        } else {
            self.secondary_scores
                .get(dimension)
                .copied()
                .unwrap_or(0.0)
        }
    }
}

/// Dimension name addressing the primary metric in objective space.
pub const PRIMARY_DIMENSION: &str = "primary";

// Scores are validated finite at construction, so bit-exact comparison is a
// total equality and the Eq marker is sound.
impl PartialEq for FitnessScore {
    fn eq(&self, other: &Self) -> bool {
        self.primary_score.to_bits() == other.primary_score.to_bits()
            && self.overall_score.to_bits() == other.overall_score.to_bits()
            && self.secondary_scores.len() == other.secondary_scores.len()
            && self
                .secondary_scores
                .iter()
                .zip(other.secondary_scores.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && va.to_bits() == vb.to_bits())
            && self.metadata == other.metadata
    }
}

impl Eq for FitnessScore {}

// Hash over the objective values only (a strict subset of the Eq fields,
// which keeps the Eq/Hash contract intact while letting metadata-free
// lookups collapse by score content).
impl Hash for FitnessScore {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.primary_score.to_bits().hash(state);
        self.overall_score.to_bits().hash(state);
        for (key, val) in &self.secondary_scores {
            key.hash(state);
            val.to_bits().hash(state);
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Candidate identity
// ══════════════════════════════════════════════════════════════

/// Content-addressed description of one candidate: the instruction, its
/// few-shot examples, and free-form metadata. Two configs with identical
/// content share a `config_id`, which is what memoizes per-candidate
/// fitness across generations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConfig {
    instruction: String,
    few_shot_examples: Vec<Example>,
    metadata: BTreeMap<String, serde_json::Value>,
    config_id: String,
}

impl CandidateConfig {
    pub fn new(
        instruction: impl Into<String>,
        few_shot_examples: Vec<Example>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let instruction = instruction.into();
        let config_id = Self::derive_id(&instruction, &few_shot_examples, &metadata);
        Self {
            instruction,
            few_shot_examples,
            metadata,
            config_id,
        }
    }

    fn derive_id(
        instruction: &str,
        examples: &[Example],
        metadata: &BTreeMap<String, serde_json::Value>,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(instruction.as_bytes());
        hasher.update([0u8]);
        for example in examples {
            // BTreeMap fields serialize in key order, so the digest is stable
            hasher.update(serde_json::to_vec(example).unwrap_or_default());
            hasher.update([0u8]);
        }
        hasher.update(serde_json::to_vec(metadata).unwrap_or_default());
        let digest = hasher.finalize();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[must_use]
    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    #[must_use]
    pub fn few_shot_examples(&self) -> &[Example] {
        &self.few_shot_examples
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    #[must_use]
    pub fn config_id(&self) -> &str {
        &self.config_id
    }
}

// ══════════════════════════════════════════════════════════════
// Reflection output
// ══════════════════════════════════════════════════════════════

/// Outcome of analyzing a batch of execution traces.
///
/// Immutable once constructed; `confidence` outside [0.0, 1.0] fails
/// construction. Mutation suggestions are typed, so the closed-set
/// invariant holds by construction — the LLM parse path is responsible for
/// filtering foreign kind names before building one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionResult {
    trace_id: String,
    diagnosis: String,
    improvements: Vec<String>,
    confidence: f64,
    reasoning: String,
    suggested_mutations: Vec<MutationKind>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl ReflectionResult {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trace_id: impl Into<String>,
        diagnosis: impl Into<String>,
        improvements: Vec<String>,
        confidence: f64,
        reasoning: impl Into<String>,
        suggested_mutations: Vec<MutationKind>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> EvolvResult<Self> {
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(EvolvError::Configuration(format!(
                "confidence must be in [0.0, 1.0], got {confidence}"
            )));
        }
        Ok(Self {
            trace_id: trace_id.into(),
            diagnosis: diagnosis.into(),
            improvements,
            confidence,
            reasoning: reasoning.into(),
            suggested_mutations,
            metadata,
        })
    }

    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    #[must_use]
    pub fn diagnosis(&self) -> &str {
        &self.diagnosis
    }

    #[must_use]
    pub fn improvements(&self) -> &[String] {
        &self.improvements
    }

    #[must_use]
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    #[must_use]
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    #[must_use]
    pub fn suggested_mutations(&self) -> &[MutationKind] {
        &self.suggested_mutations
    }

    #[must_use]
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }
}

// ══════════════════════════════════════════════════════════════
// Generation history
// ══════════════════════════════════════════════════════════════

/// Per-generation score snapshot recorded by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSnapshot {
    pub generation: u64,
    pub timestamp: DateTime<Utc>,
    pub scores: Vec<FitnessScore>,
    pub best_overall: f64,
    pub mean_overall: f64,
    pub diversity: f64,
}

impl GenerationSnapshot {
    #[must_use]
    pub fn from_scores(generation: u64, scores: Vec<FitnessScore>, diversity: f64) -> Self {
        let best_overall = scores
            .iter()
            .map(FitnessScore::overall_score)
            .fold(0.0_f64, f64::max);
        let mean_overall = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(FitnessScore::overall_score).sum::<f64>() / scores.len() as f64
        };
        Self {
            generation,
            timestamp: Utc::now(),
            scores,
            best_overall,
            mean_overall,
            diversity,
        }
    }
}

/// Fitness direction over recent generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Declining,
    Stable,
}

impl std::fmt::Display for Trend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Declining => write!(f, "declining"),
            Self::Stable => write!(f, "stable"),
        }
    }
}

/// Run context handed to reflection so suggestions account for what the
/// engine has recently tried.
#[derive(Debug, Clone, Default)]
pub struct OptimizationContext {
    pub generation: u64,
    pub recent_mutations: Vec<MutationKind>,
    pub recent_crossovers: Vec<CrossoverType>,
    pub trend: Option<Trend>,
}
