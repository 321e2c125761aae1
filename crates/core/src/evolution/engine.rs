use rand::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use evolv_shared::llm::ReflectionModel;
use evolv_shared::{Example, Metric, Program};

use crate::config::EvolutionConfig;
use crate::traces::TraceCollector;

use super::crossover::{mutate_instruction, perturb_seed_instruction, CrossoverEngine};
use super::fitness::FitnessEvaluator;
use super::pareto::{ParetoSelector, ScoredProgram};
use super::reflection::ReflectionEngine;
use super::types::{
    CandidateConfig, FitnessScore, GenerationSnapshot, MutationKind, OptimizationContext, Trend,
};

/// Recent mutation applications kept for reflection context.
const MUTATION_HISTORY_LIMIT: usize = 32;

/// History window used for the fitness trend.
const TREND_WINDOW: usize = 5;

// ══════════════════════════════════════════════════════════════
// Genetic Engine
// ══════════════════════════════════════════════════════════════

/// Result of a full optimization run.
pub struct EvolutionOutcome {
    pub best_candidate: Arc<dyn Program>,
    pub best_fitness: FitnessScore,
    pub generation_history: Vec<GenerationSnapshot>,
}

/// Drives the generational loop and owns the population.
///
/// The population is only replaced synchronously between generations, after
/// every evaluation for the generation has completed; callers never observe
/// a partially-formed generation.
pub struct GeneticEngine {
    config: EvolutionConfig,
    evaluator: FitnessEvaluator,
    crossover: CrossoverEngine,
    selector: ParetoSelector,
    reflection: ReflectionEngine,
    collector: Arc<TraceCollector>,
    population: Vec<Arc<dyn Program>>,
    scores: Option<Vec<FitnessScore>>,
    fitness_cache: HashMap<String, FitnessScore>,
    best_seen: Option<(Arc<dyn Program>, FitnessScore)>,
    generation: u64,
    history: Vec<GenerationSnapshot>,
    mutation_history: Vec<MutationKind>,
    rng: StdRng,
}

impl GeneticEngine {
    pub fn new(config: EvolutionConfig, metric: Arc<dyn Metric>) -> anyhow::Result<Self> {
        config.validate()?;

        let collector = Arc::new(TraceCollector::new());
        let evaluator = FitnessEvaluator::new(metric, &config).with_collector(collector.clone());
        let mut crossover =
            CrossoverEngine::new(config.crossover_rate, config.crossover_types.clone());
        let mut selector = ParetoSelector::new(config.tournament_size);
        let rng = match config.random_seed {
            Some(seed) => {
                crossover = crossover.with_seed(seed.wrapping_add(1));
                selector = selector.with_seed(seed.wrapping_add(2));
                StdRng::seed_from_u64(seed)
            }
            None => StdRng::from_entropy(),
        };
        let reflection = ReflectionEngine::new(config.reflection.clone());

        Ok(Self {
            config,
            evaluator,
            crossover,
            selector,
            reflection,
            collector,
            population: Vec::new(),
            scores: None,
            fitness_cache: HashMap::new(),
            best_seen: None,
            generation: 0,
            history: Vec::new(),
            mutation_history: Vec::new(),
            rng,
        })
    }

    /// Attach the reflection model named by `reflection_model_ref`.
    #[must_use]
    pub fn with_reflection_model(mut self, model: Arc<dyn ReflectionModel>) -> Self {
        if let Some(expected) = &self.config.reflection_model_ref {
            if expected != &model.model_ref() {
                warn!(
                    expected = %expected,
                    actual = %model.model_ref(),
                    "Reflection model does not match reflection_model_ref"
                );
            }
        }
        self.reflection = self.reflection.with_model(model);
        self
    }

    /// Collector receiving evaluation trace events for this engine.
    #[must_use]
    pub fn trace_collector(&self) -> Arc<TraceCollector> {
        self.collector.clone()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn population(&self) -> &[Arc<dyn Program>] {
        &self.population
    }

    #[must_use]
    pub fn history(&self) -> &[GenerationSnapshot] {
        &self.history
    }

    // ── Initialization ──

    /// Build the initial population from a seed program: the unmodified
    /// seed plus instruction-perturbed variants. Fails when the program
    /// cannot produce at least two distinct instructions for a population
    /// larger than one.
    pub fn initialize_population(&mut self, seed_program: &Arc<dyn Program>) -> anyhow::Result<()> {
        let seed_instruction = seed_program.instruction_text();
        let mut population: Vec<Arc<dyn Program>> =
            Vec::with_capacity(self.config.population_size);
        for variant in 0..self.config.population_size {
            if variant == 0 {
                population.push(seed_program.clone_program());
            } else {
                let instruction = perturb_seed_instruction(&seed_instruction, variant);
                population.push(seed_program.with_instruction(&instruction));
            }
        }

        if self.config.population_size > 1 {
            let distinct: HashSet<String> =
                population.iter().map(|p| p.instruction_text()).collect();
            anyhow::ensure!(
                distinct.len() >= 2,
                "seed program produced a uniform population of {} members; \
                 it must support instruction mutation",
                self.config.population_size
            );
        }

        self.population = population;
        self.scores = None;
        self.fitness_cache.clear();
        self.best_seen = None;
        self.generation = 0;
        self.history.clear();
        self.mutation_history.clear();

        info!(
            population = self.config.population_size,
            seed = %seed_instruction,
            "🌱 Population initialized"
        );
        Ok(())
    }

    // ── Evaluation ──

    /// Evaluate every population member, memoized by candidate content.
    /// Per-candidate failures become zero scores with counted errors; the
    /// population evaluation itself never aborts.
    pub async fn evaluate_population(&mut self, trainset: &[Example]) -> Vec<FitnessScore> {
        let mut scores = Vec::with_capacity(self.population.len());
        for program in &self.population {
            let config_id = CandidateConfig::new(
                program.instruction_text(),
                Vec::new(),
                BTreeMap::new(),
            )
            .config_id()
            .to_string();

            let score = match self.fitness_cache.get(&config_id) {
                Some(cached) => cached.clone(),
                None => {
                    let score = self.evaluator.evaluate_candidate(program, trainset).await;
                    self.fitness_cache.insert(config_id, score.clone());
                    score
                }
            };
            scores.push(score);
        }

        for (program, score) in self.population.iter().zip(&scores) {
            let is_new_best = self
                .best_seen
                .as_ref()
                .map(|(_, best)| score.overall_score() > best.overall_score())
                .unwrap_or(true);
            if is_new_best {
                info!(
                    generation = self.generation,
                    overall = score.overall_score(),
                    "📈 New best candidate"
                );
                self.best_seen = Some((program.clone(), score.clone()));
            }
        }

        self.scores = Some(scores.clone());
        scores
    }

    // ── Generational step ──

    /// Advance one generation: evaluate (if stale), select parents,
    /// crossover, mutate, and replace the population wholesale.
    pub async fn evolve_generation(&mut self, trainset: &[Example]) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.population.is_empty(),
            "population is not initialized; call initialize_population first"
        );

        let scores = match &self.scores {
            Some(scores) => scores.clone(),
            None => self.evaluate_population(trainset).await,
        };

        let pairs: Vec<ScoredProgram> = self
            .population
            .iter()
            .cloned()
            .zip(scores.iter().cloned())
            .collect();

        let parents = if self.config.use_pareto_selection {
            self.selector
                .select_parents(&pairs, self.config.population_size)
        } else {
            let mut parents = Vec::with_capacity(self.config.population_size);
            while parents.len() < self.config.population_size {
                match self.selector.tournament_selection(&pairs) {
                    Some((program, _)) => parents.push(program),
                    None => break,
                }
            }
            parents
        };
        anyhow::ensure!(!parents.is_empty(), "parent selection returned no candidates");

        let mut offspring = self.crossover.batch_crossover(&parents);

        // Reflection steers which mutation kinds get applied this round.
        let suggested = self.mutation_suggestions();
        let mut applied = 0usize;
        for slot in offspring.iter_mut() {
            if self.config.mutation_rate > 0.0
                && self.rng.gen_bool(self.config.mutation_rate.clamp(0.0, 1.0))
            {
                let kind = if suggested.is_empty() {
                    MutationKind::ALL[self.rng.gen_range(0..MutationKind::ALL.len())]
                } else {
                    suggested[self.rng.gen_range(0..suggested.len())]
                };
                let mutated = mutate_instruction(&mut self.rng, &slot.instruction_text(), kind);
                *slot = slot.with_instruction(&mutated);
                self.mutation_history.push(kind);
                if self.mutation_history.len() > MUTATION_HISTORY_LIMIT {
                    self.mutation_history.remove(0);
                }
                applied += 1;
            }
        }

        debug_assert_eq!(offspring.len(), parents.len());
        self.population = offspring;
        self.scores = None;
        self.generation += 1;

        info!(
            generation = self.generation,
            mutations = applied,
            crossovers = self.crossover.recent_types().len(),
            "🧬 Generation evolved"
        );
        Ok(())
    }

    fn mutation_suggestions(&self) -> Vec<MutationKind> {
        let traces = self.collector.all_traces();
        let context = OptimizationContext {
            generation: self.generation,
            recent_mutations: self.mutation_history.clone(),
            recent_crossovers: self.crossover.recent_types().to_vec(),
            trend: Some(self.fitness_trend()),
        };
        let reflection = self.reflection.reflection_with_context(&traces, &context);
        reflection.suggested_mutations().to_vec()
    }

    // ── Full run ──

    /// Run the complete optimization: initialize, evaluate generation 0,
    /// then evolve and re-evaluate `num_generations` times. Records one
    /// history snapshot per generation (the initial one included) and
    /// always returns a best-effort result.
    pub async fn run_evolution(
        &mut self,
        seed_program: &Arc<dyn Program>,
        trainset: &[Example],
    ) -> anyhow::Result<EvolutionOutcome> {
        self.initialize_population(seed_program)?;

        let scores = self.evaluate_population(trainset).await;
        self.record_snapshot(scores);

        for _ in 0..self.config.num_generations {
            self.evolve_generation(trainset).await?;
            let scores = self.evaluate_population(trainset).await;
            self.record_snapshot(scores);
        }

        let (best_candidate, best_fitness) = match &self.best_seen {
            Some((program, score)) => (program.clone(), score.clone()),
            None => {
                let (program, score) = self
                    .get_best_candidate()
                    .ok_or_else(|| anyhow::anyhow!("no evaluated candidates after run"))?;
                (program, score)
            }
        };

        info!(
            generations = self.config.num_generations,
            best_overall = best_fitness.overall_score(),
            "🏁 Evolution run complete"
        );

        Ok(EvolutionOutcome {
            best_candidate,
            best_fitness,
            generation_history: self.history.clone(),
        })
    }

    fn record_snapshot(&mut self, scores: Vec<FitnessScore>) {
        let snapshot =
            GenerationSnapshot::from_scores(self.generation, scores, self.population_diversity());
        self.history.push(snapshot);
    }

    // ── Introspection ──

    /// Best member of the current evaluated population by overall score;
    /// ties resolve to the earliest population index. None before the
    /// population has been evaluated.
    #[must_use]
    pub fn get_best_candidate(&self) -> Option<(Arc<dyn Program>, FitnessScore)> {
        let scores = self.scores.as_ref()?;
        let mut best: Option<usize> = None;
        for (index, score) in scores.iter().enumerate() {
            let better = match best {
                None => true,
                Some(current) => score.overall_score() > scores[current].overall_score(),
            };
            if better {
                best = Some(index);
            }
        }
        best.map(|i| (self.population[i].clone(), scores[i].clone()))
    }

    /// Instruction variety of the current population: 0.0 for a uniform
    /// population, 1.0 when every instruction is distinct.
    #[must_use]
    pub fn population_diversity(&self) -> f64 {
        if self.population.len() <= 1 {
            return 0.0;
        }
        let distinct: HashSet<String> = self
            .population
            .iter()
            .map(|p| p.instruction_text())
            .collect();
        (distinct.len() as f64 - 1.0) / (self.population.len() as f64 - 1.0)
    }

    /// Fitness direction over the recent history window.
    #[must_use]
    pub fn fitness_trend(&self) -> Trend {
        let window_start = self.history.len().saturating_sub(TREND_WINDOW);
        let window = &self.history[window_start..];
        if window.len() < 2 {
            return Trend::Stable;
        }
        let earlier = window.first().map(|s| s.best_overall).unwrap_or(0.0);
        let recent = window.last().map(|s| s.best_overall).unwrap_or(0.0);
        let delta = recent - earlier;
        if delta > 0.01 {
            Trend::Improving
        } else if delta < -0.01 {
            Trend::Declining
        } else {
            Trend::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{keyword_metric, MockProgram};

    fn config(population: usize, generations: usize) -> EvolutionConfig {
        EvolutionConfig {
            population_size: population,
            num_generations: generations,
            random_seed: Some(42),
            ..Default::default()
        }
    }

    fn engine(population: usize) -> GeneticEngine {
        GeneticEngine::new(config(population, 3), Arc::new(keyword_metric())).unwrap()
    }

    fn seed() -> Arc<dyn Program> {
        Arc::new(MockProgram::new("Answer the question").with_response("expected"))
    }

    fn trainset(n: usize) -> Vec<Example> {
        (0..n)
            .map(|i| {
                Example::new(
                    [("question".to_string(), format!("q{i}"))],
                    [("answer".to_string(), "expected".to_string())],
                )
            })
            .collect()
    }

    // ── Construction ──

    #[test]
    fn test_invalid_config_rejected() {
        let bad = EvolutionConfig {
            population_size: 0,
            ..Default::default()
        };
        assert!(GeneticEngine::new(bad, Arc::new(keyword_metric())).is_err());
    }

    // ── Initialization ──

    #[test]
    fn test_initialize_population_includes_seed_and_variants() {
        let mut eng = engine(4);
        eng.initialize_population(&seed()).unwrap();

        assert_eq!(eng.population().len(), 4);
        assert_eq!(eng.population()[0].instruction_text(), "Answer the question");
        assert_eq!(eng.generation(), 0);

        let distinct: HashSet<String> = eng
            .population()
            .iter()
            .map(|p| p.instruction_text())
            .collect();
        assert!(distinct.len() >= 2);
    }

    #[test]
    fn test_initialize_rejects_immutable_program() {
        // A program relying on the default no-op with_instruction yields a
        // uniform population, which initialization must reject.
        struct Fixed;

        #[async_trait::async_trait]
        impl Program for Fixed {
            async fn call(
                &self,
                _inputs: &BTreeMap<String, String>,
            ) -> anyhow::Result<evolv_shared::Prediction> {
                Ok(evolv_shared::Prediction::default())
            }

            fn clone_program(&self) -> Arc<dyn Program> {
                Arc::new(Fixed)
            }
        }

        let mut eng = engine(4);
        let fixed: Arc<dyn Program> = Arc::new(Fixed);
        assert!(eng.initialize_population(&fixed).is_err());
    }

    // ── Evaluation & caching ──

    #[tokio::test]
    async fn test_evaluate_population_scores_every_member() {
        let mut eng = engine(4);
        eng.initialize_population(&seed()).unwrap();
        let scores = eng.evaluate_population(&trainset(2)).await;
        assert_eq!(scores.len(), 4);
        for score in &scores {
            assert!((0.0..=1.0).contains(&score.overall_score()));
        }
    }

    #[tokio::test]
    async fn test_evaluation_is_memoized_by_content() {
        let mut eng = engine(3);
        let program = MockProgram::new("Answer the question").with_response("expected");
        let calls = program.call_counter();
        let seed: Arc<dyn Program> = Arc::new(program);
        eng.initialize_population(&seed).unwrap();

        eng.evaluate_population(&trainset(2)).await;
        let after_first = calls.load(std::sync::atomic::Ordering::SeqCst);
        assert!(after_first > 0);

        // Same candidates again: cache hits, no further program calls.
        eng.scores = None;
        eng.evaluate_population(&trainset(2)).await;
        let after_second = calls.load(std::sync::atomic::Ordering::SeqCst);
        assert_eq!(after_first, after_second);
    }

    // ── Generational step ──

    #[tokio::test]
    async fn test_evolve_generation_preserves_size_and_increments() {
        let mut eng = engine(4);
        eng.initialize_population(&seed()).unwrap();
        eng.evolve_generation(&trainset(2)).await.unwrap();
        assert_eq!(eng.population().len(), 4);
        assert_eq!(eng.generation(), 1);
    }

    #[tokio::test]
    async fn test_evolve_without_initialize_fails() {
        let mut eng = engine(4);
        assert!(eng.evolve_generation(&trainset(2)).await.is_err());
    }

    // ── Best candidate & diversity ──

    #[tokio::test]
    async fn test_get_best_candidate_ties_to_earliest() {
        let mut eng = engine(4);
        eng.initialize_population(&seed()).unwrap();
        eng.evaluate_population(&trainset(2)).await;

        let (program, score) = eng.get_best_candidate().unwrap();
        let scores = eng.scores.as_ref().unwrap();
        let max = scores
            .iter()
            .map(FitnessScore::overall_score)
            .fold(0.0_f64, f64::max);
        assert!((score.overall_score() - max).abs() < 1e-12);

        // Earliest index wins ties: the winner is the first with max score.
        let first_max = scores
            .iter()
            .position(|s| (s.overall_score() - max).abs() < 1e-12)
            .unwrap();
        assert_eq!(
            program.instruction_text(),
            eng.population()[first_max].instruction_text()
        );
    }

    #[test]
    fn test_get_best_before_evaluation_is_none() {
        let mut eng = engine(4);
        eng.initialize_population(&seed()).unwrap();
        assert!(eng.get_best_candidate().is_none());
    }

    #[test]
    fn test_population_diversity_bounds() {
        let mut eng = engine(4);
        assert_eq!(eng.population_diversity(), 0.0);

        // Uniform population
        let uniform: Arc<dyn Program> = Arc::new(MockProgram::new("same"));
        eng.population = vec![
            uniform.clone_program(),
            uniform.clone_program(),
            uniform.clone_program(),
        ];
        assert_eq!(eng.population_diversity(), 0.0);

        // Fully distinct
        eng.population = vec![
            Arc::new(MockProgram::new("one")),
            Arc::new(MockProgram::new("two")),
            Arc::new(MockProgram::new("three")),
        ];
        assert!((eng.population_diversity() - 1.0).abs() < f64::EPSILON);
    }

    // ── Trend ──

    #[test]
    fn test_fitness_trend_requires_history() {
        let eng = engine(4);
        assert_eq!(eng.fitness_trend(), Trend::Stable);
    }
}
