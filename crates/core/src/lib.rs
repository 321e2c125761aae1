//! Evolv core: a genetic instruction optimizer for LLM-backed programs.
//!
//! The engine evolves a program's natural-language instruction against a
//! training set: candidates are evaluated concurrently with fault isolation,
//! ranked with multi-objective (Pareto) selection, recombined and mutated at
//! the instruction level, and steered by reflection over collected execution
//! traces. Provider adapters, prompt rendering, and wire formats live
//! outside this crate behind the contracts in `evolv_shared`.

pub mod config;
pub mod evolution;
pub mod test_utils;
pub mod traces;

pub use config::{EvolutionConfig, ReflectionThresholds};
pub use evolution::{
    CandidateConfig, CrossoverEngine, CrossoverType, EvolutionOutcome, FitnessEvaluator,
    FitnessScore, GenerationSnapshot, GeneticEngine, MutationKind, ParetoSelector,
    ReflectionEngine, ReflectionResult, ScoreWeights, Trend,
};
pub use traces::{ExecutionTrace, TraceCollector, TraceKind};
