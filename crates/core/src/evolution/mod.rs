//! The genetic optimization engine.
//!
//! Components, leaf to root: value types (`types`), fitness evaluation
//! (`fitness`), genetic operators (`crossover`), multi-objective selection
//! (`pareto`), trace-driven reflection (`reflection`), and the generational
//! loop that owns the population (`engine`).

mod crossover;
mod engine;
mod fitness;
mod pareto;
mod reflection;
mod types;

pub use crossover::{
    crossover_diversity, mutate_instruction, perturb_seed_instruction, CrossoverEngine,
};
pub use engine::{EvolutionOutcome, GeneticEngine};
pub use fitness::{
    CallObservation, Consistency, FitnessEvaluator, Latency, SecondaryMetric, TokenEfficiency,
};
pub use pareto::{
    calculate_crowding_distance, dominates, find_pareto_frontier, objective_dimensions,
    ParetoSelector, ScoredProgram,
};
pub use reflection::{ExecutionPatterns, ReflectionEngine};
pub use types::*;
