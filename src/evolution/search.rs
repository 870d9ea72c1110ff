//! Generational genetic search over payloads.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;

use crate::schema::{
    ConfigError, EvolutionPhase, EvolutionProgress, EvolutionResult, EvolutionStats,
    GenerationStats, GrammarError, ResponseClass, RunConfig, StopReason,
};

use super::archive::{PayloadArchive, auto_categorize};
use super::fitness::FitnessEvaluator;
use super::genome::{Individual, PayloadRng, payload_distance};
use super::grammar::Grammar;
use super::operators::{
    Crossover, Mutation, Selection, crossover_operator, mutation_operator, selection_operator,
};
use super::target::HttpTarget;

/// Fatal run errors. Per-individual failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid grammar: {0}")]
    Grammar(#[from] GrammarError),
    #[error("Engine invariant violated: {0}")]
    InvariantViolation(String),
    #[error("Failed to build evaluation pool: {0}")]
    ThreadPool(String),
}

/// Evolution engine that runs the search.
pub struct EvolutionEngine {
    config: RunConfig,
    grammar: Arc<Grammar>,
    rng: PayloadRng,
    evaluator: FitnessEvaluator,
    selection: Box<dyn Selection>,
    crossover: Box<dyn Crossover>,
    mutation: Box<dyn Mutation>,
    pool: rayon::ThreadPool,
    population: Vec<Individual>,
    archive: PayloadArchive,
    history: Vec<GenerationStats>,
    generation: usize,
    best: Option<Individual>,
    stagnation_count: usize,
    evaluations: u64,
    next_id: u64,
    cancelled: Arc<AtomicBool>,
}

impl EvolutionEngine {
    /// Validate the configuration, compile the grammar and set up the
    /// evaluation pool. No request is sent.
    pub fn new(config: RunConfig, target: Arc<dyn HttpTarget>) -> Result<Self, EvolutionError> {
        config.validate()?;
        let grammar = Arc::new(Grammar::new(config.grammar.clone())?);

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.evaluation.concurrency)
            .thread_name(|i| format!("evaluator-{i}"))
            .build()
            .map_err(|e| EvolutionError::ThreadPool(e.to_string()))?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        let evaluator =
            FitnessEvaluator::new(config.fitness.clone(), config.evaluation.clone(), target);
        let archive = PayloadArchive::new(config.archive.max_size)
            .with_diversity_threshold(config.archive.diversity_threshold);

        Ok(Self {
            selection: selection_operator(&config.algorithm.selection),
            crossover: crossover_operator(&config.algorithm.crossover),
            mutation: mutation_operator(&config.algorithm.mutation),
            rng: PayloadRng::new(seed),
            grammar,
            evaluator,
            pool,
            population: Vec::new(),
            archive,
            history: Vec::new(),
            generation: 0,
            best: None,
            stagnation_count: 0,
            evaluations: 0,
            next_id: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// Get cancellation handle. Cancellation is honoured between generations.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// The compiled grammar.
    pub fn grammar(&self) -> &Arc<Grammar> {
        &self.grammar
    }

    /// Current population.
    pub fn population(&self) -> &[Individual] {
        &self.population
    }

    /// Archive of discovered payloads.
    pub fn archive(&self) -> &PayloadArchive {
        &self.archive
    }

    /// Per-generation statistics so far.
    pub fn history(&self) -> &[GenerationStats] {
        &self.history
    }

    /// Current generation (0 is the initial population).
    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Best individual seen in the run.
    pub fn best(&self) -> Option<&Individual> {
        self.best.as_ref()
    }

    /// Evaluations performed in the run.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn best_fitness(&self) -> f32 {
        self.best.as_ref().map_or(f32::NEG_INFINITY, Individual::score)
    }

    /// Build and evaluate generation 0, discarding any previous run state.
    pub fn initialize(&mut self) -> Result<(), EvolutionError> {
        self.population.clear();
        self.archive.clear();
        self.history.clear();
        self.generation = 0;
        self.best = None;
        self.stagnation_count = 0;
        self.evaluations = 0;

        for _ in 0..self.config.population.size {
            let id = self.fresh_id();
            let individual = self.grammar.generate_random(id, 0, &mut self.rng);
            self.population.push(individual);
        }

        self.finish_generation()
    }

    /// Breed, evaluate and record one generation.
    pub fn step(&mut self) -> Result<(), EvolutionError> {
        self.breed_next_generation();
        self.finish_generation()
    }

    fn finish_generation(&mut self) -> Result<(), EvolutionError> {
        let evaluated = self.evaluate_pending();
        self.check_invariants()?;
        self.record_generation(evaluated);
        Ok(())
    }

    /// Evaluate individuals without a cached fitness on the bounded pool.
    /// Returns once every one of them has a fitness.
    fn evaluate_pending(&mut self) -> usize {
        let Self {
            pool,
            population,
            grammar,
            evaluator,
            ..
        } = self;
        let grammar: &Grammar = grammar;
        let evaluator: &FitnessEvaluator = evaluator;

        let pending = population.iter().filter(|c| c.fitness.is_none()).count();
        if pending == 0 {
            return 0;
        }

        pool.install(|| {
            population
                .par_iter_mut()
                .filter(|candidate| candidate.fitness.is_none())
                .for_each(|candidate| {
                    let payload = grammar.to_payload(candidate);
                    let evaluation =
                        match panic::catch_unwind(AssertUnwindSafe(|| evaluator.evaluate(&payload))) {
                            Ok(evaluation) => evaluation,
                            Err(_) => {
                                log::warn!("Evaluation of candidate {} panicked", candidate.id);
                                evaluator.failure(
                                    ResponseClass::Malformed,
                                    "Evaluation panicked",
                                    0,
                                )
                            }
                        };

                    candidate.fitness = Some(evaluation.fitness);
                    candidate.diagnostics = Some(evaluation.diagnostics);
                });
        });

        self.evaluations += pending as u64;
        pending
    }

    fn check_invariants(&self) -> Result<(), EvolutionError> {
        if self.population.len() != self.config.population.size {
            return Err(EvolutionError::InvariantViolation(format!(
                "generation {} has {} individuals, expected {}",
                self.generation,
                self.population.len(),
                self.config.population.size
            )));
        }
        for candidate in &self.population {
            if !self.grammar.conforms(candidate) {
                return Err(EvolutionError::InvariantViolation(format!(
                    "candidate {} has {} fields, grammar declares {}",
                    candidate.id,
                    candidate.genes.len(),
                    self.grammar.len()
                )));
            }
            if candidate.fitness.is_none_or(|f| !f.is_finite()) {
                return Err(EvolutionError::InvariantViolation(format!(
                    "candidate {} has no usable fitness after evaluation",
                    candidate.id
                )));
            }
        }
        Ok(())
    }

    /// Selection, crossover and mutation into a new population of the same
    /// size. With elitism the current best keeps its slot untouched.
    fn breed_next_generation(&mut self) {
        let size = self.config.population.size;
        let crossover_rate = self.config.algorithm.crossover_rate;
        let mutation_rate = self.config.algorithm.mutation_rate;
        let next_generation = self.generation + 1;

        let elite_slot = if self.config.algorithm.elitism {
            best_index(&self.population)
        } else {
            None
        };

        // Selection
        let mut offspring = Vec::with_capacity(size);
        let count = size - usize::from(elite_slot.is_some());
        let picks = self.selection.select_many(&self.population, count, &mut self.rng);
        for idx in picks {
            let id = self.fresh_id();
            let parent = &self.population[idx];
            offspring.push(Individual {
                id,
                generation: next_generation,
                parents: vec![parent.id],
                ..parent.clone()
            });
        }

        // Crossover on consecutive pairs
        for pair in offspring.chunks_exact_mut(2) {
            let [a, b] = pair else { continue };
            if self.rng.chance(crossover_rate) {
                let parents = vec![a.parents[0], b.parents[0]];
                if self.crossover.crossover(&self.grammar, a, b, &mut self.rng) {
                    a.parents = parents.clone();
                    b.parents = parents;
                }
            }
        }

        // Mutation
        for child in &mut offspring {
            if self.rng.chance(mutation_rate) {
                self.mutation.mutate(&self.grammar, child, &mut self.rng);
            }
        }

        if let Some(slot) = elite_slot {
            offspring.insert(slot, self.population[slot].clone());
        }

        self.population = offspring;
        self.generation = next_generation;
    }

    fn record_generation(&mut self, evaluations: usize) {
        let fitness: Vec<f32> = self.population.iter().map(Individual::score).collect();
        let mut stats = GenerationStats::from_fitness(self.generation, &fitness);
        stats.evaluations = evaluations;
        stats.diversity = self.compute_diversity();

        if let Some(idx) = best_index(&self.population) {
            let candidate = &self.population[idx];
            if self.best.as_ref().is_none_or(|b| candidate.score() > b.score()) {
                log::info!(
                    "New best fitness {:.3} in generation {}: {}",
                    candidate.score(),
                    self.generation,
                    serde_json::Value::Object(self.grammar.to_payload(candidate))
                );
                self.best = Some(candidate.clone());
                self.stagnation_count = 0;
            } else {
                self.stagnation_count += 1;
            }
        }
        stats.best_so_far = self.best_fitness();

        self.update_archive();

        log::info!(
            "Generation {}: min={:.3} max={:.3} mean={:.3} std={:.3} evaluations={} diversity={:.3} best={:.3}",
            stats.generation,
            stats.min,
            stats.max,
            stats.mean,
            stats.std_dev,
            stats.evaluations,
            stats.diversity,
            stats.best_so_far
        );
        self.history.push(stats);
    }

    /// Mean pairwise fraction of differing fields.
    fn compute_diversity(&self) -> f32 {
        if self.population.len() < 2 {
            return 0.0;
        }

        let mut total_distance = 0.0f32;
        let mut count = 0usize;
        for i in 0..self.population.len() {
            for j in (i + 1)..self.population.len() {
                total_distance +=
                    payload_distance(&self.population[i].genes, &self.population[j].genes);
                count += 1;
            }
        }
        total_distance / count as f32
    }

    fn update_archive(&mut self) {
        let names = self.grammar.field_names();
        for candidate in &self.population {
            let snapshot = candidate.to_snapshot(names);
            let tags = auto_categorize(&snapshot, self.evaluator.config());
            self.archive.add(snapshot, tags);
        }
    }

    /// Get current progress.
    pub fn progress(&self, phase: EvolutionPhase) -> EvolutionProgress {
        EvolutionProgress {
            generation: self.generation,
            total_generations: self.config.population.max_generations,
            best_fitness: self.best_fitness(),
            stats: self.history.last().cloned(),
            stagnation_count: self.stagnation_count,
            evaluations_total: self.evaluations,
            best_candidate: self
                .best
                .as_ref()
                .map(|b| b.to_snapshot(self.grammar.field_names())),
            phase,
        }
    }

    /// Check if evolution should stop.
    fn should_stop(&self) -> Option<StopReason> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Some(StopReason::Cancelled);
        }

        if self.generation >= self.config.population.max_generations {
            return Some(StopReason::MaxGenerations);
        }

        if let Some(target) = self.config.population.target_fitness
            && self.best_fitness() >= target
        {
            return Some(StopReason::TargetReached);
        }

        if let Some(limit) = self.config.population.stagnation_limit
            && self.stagnation_count >= limit
        {
            return Some(StopReason::Stagnation);
        }

        None
    }

    /// Run evolution with progress callback.
    pub fn run_with_callback<F>(&mut self, mut callback: F) -> Result<EvolutionResult, EvolutionError>
    where
        F: FnMut(&EvolutionProgress),
    {
        let start_time = Instant::now();
        log::info!(
            "Starting payload discovery: population={} generations={} target={}",
            self.config.population.size,
            self.config.population.max_generations,
            self.config.evaluation.target_url
        );

        self.initialize()?;
        callback(&self.progress(EvolutionPhase::Initializing));

        let stop_reason = loop {
            if let Some(reason) = self.should_stop() {
                break reason;
            }
            self.step()?;
            callback(&self.progress(EvolutionPhase::Evaluating));
        };

        log::info!(
            "Evolution stopped after {} generations ({:?}), best fitness {:.3}",
            self.generation,
            stop_reason,
            self.best_fitness()
        );
        let phase = if stop_reason == StopReason::MaxGenerations {
            EvolutionPhase::Complete
        } else {
            EvolutionPhase::Stopped
        };
        callback(&self.progress(phase));

        self.result(stop_reason, start_time.elapsed().as_secs_f64())
    }

    /// Run evolution (blocking).
    pub fn run(&mut self) -> Result<EvolutionResult, EvolutionError> {
        self.run_with_callback(|_| {})
    }

    fn result(&self, stop_reason: StopReason, elapsed: f64) -> Result<EvolutionResult, EvolutionError> {
        let names = self.grammar.field_names();
        let best = self
            .best
            .as_ref()
            .map(|b| b.to_snapshot(names))
            .ok_or_else(|| EvolutionError::InvariantViolation("no evaluated individual".to_string()))?;

        let archive = self
            .archive
            .top_n(self.archive.len())
            .into_iter()
            .map(|p| p.snapshot.clone())
            .collect();

        let final_avg_fitness = if self.population.is_empty() {
            0.0
        } else {
            self.population.iter().map(Individual::score).sum::<f32>() / self.population.len() as f32
        };

        Ok(EvolutionResult {
            best,
            archive,
            stats: EvolutionStats {
                generations: self.generation,
                total_evaluations: self.evaluations,
                best_fitness: self.best_fitness(),
                final_avg_fitness,
                elapsed_seconds: elapsed,
                evaluations_per_second: if elapsed > 0.0 {
                    self.evaluations as f64 / elapsed
                } else {
                    0.0
                },
                stop_reason,
            },
            history: self.history.clone(),
        })
    }
}

/// Index of the fittest individual; the first one wins ties.
fn best_index(population: &[Individual]) -> Option<usize> {
    population
        .iter()
        .enumerate()
        .max_by(|(i, a), (j, b)| a.score().total_cmp(&b.score()).then(j.cmp(i)))
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evolution::target::{TargetResponse, TransportError};
    use crate::schema::{FieldSpec, PopulationConfig, ValueDomain};
    use std::time::Duration;

    /// Status derived from the payload so fitness varies but stays
    /// deterministic.
    struct ByteSumTarget;

    impl HttpTarget for ByteSumTarget {
        fn send(&self, body: &[u8]) -> Result<TargetResponse, TransportError> {
            let sum: u32 = body.iter().map(|&b| b as u32).sum();
            let status = [200, 201, 400, 404, 422, 500][(sum % 6) as usize];
            Ok(TargetResponse {
                status,
                body: String::new(),
                elapsed: Duration::from_millis(1),
            })
        }
    }

    struct FixedStatus(u16);

    impl HttpTarget for FixedStatus {
        fn send(&self, _body: &[u8]) -> Result<TargetResponse, TransportError> {
            Ok(TargetResponse {
                status: self.0,
                body: String::new(),
                elapsed: Duration::from_millis(1),
            })
        }
    }

    struct PanickingTarget;

    impl HttpTarget for PanickingTarget {
        fn send(&self, _body: &[u8]) -> Result<TargetResponse, TransportError> {
            panic!("stub target failure");
        }
    }

    fn test_config(size: usize, generations: usize) -> RunConfig {
        RunConfig {
            grammar: vec![
                FieldSpec::new("age", ValueDomain::Integer { min: 0, max: 200 }),
                FieldSpec::new(
                    "plan",
                    ValueDomain::Categorical {
                        values: vec!["free".into(), "pro".into(), "team".into()],
                    },
                ),
                FieldSpec::new("active", ValueDomain::Boolean),
            ],
            population: PopulationConfig {
                size,
                max_generations: generations,
                ..Default::default()
            },
            random_seed: Some(42),
            ..RunConfig::default()
        }
    }

    #[test]
    fn test_evolution_engine_creation() {
        let mut engine = EvolutionEngine::new(test_config(10, 5), Arc::new(ByteSumTarget)).unwrap();
        engine.initialize().unwrap();

        assert_eq!(engine.population().len(), 10);
        assert_eq!(engine.evaluations(), 10);
        assert_eq!(engine.history().len(), 1);
    }

    #[test]
    fn test_evolution_run() {
        let mut engine = EvolutionEngine::new(test_config(8, 3), Arc::new(ByteSumTarget)).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stats.generations, 3);
        assert_eq!(result.stats.stop_reason, StopReason::MaxGenerations);
        assert_eq!(result.history.len(), 4);
        assert!(result.stats.best_fitness >= 0.0);
        assert_eq!(result.best.fitness, result.stats.best_fitness);
    }

    #[test]
    fn test_cancellation() {
        let mut engine = EvolutionEngine::new(test_config(5, 100), Arc::new(ByteSumTarget)).unwrap();
        let cancel = engine.cancel_handle();

        // Cancel immediately
        cancel.store(true, Ordering::Relaxed);

        let result = engine.run().unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::Cancelled);
        assert_eq!(result.stats.generations, 0);
        assert_eq!(result.best.payload.len(), 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config(10, 5);
        config.algorithm.crossover_rate = 2.0;
        assert!(matches!(
            EvolutionEngine::new(config, Arc::new(ByteSumTarget)),
            Err(EvolutionError::Config(ConfigError::InvalidProbability { .. }))
        ));

        let mut config = test_config(10, 5);
        config.grammar.clear();
        assert!(matches!(
            EvolutionEngine::new(config, Arc::new(ByteSumTarget)),
            Err(EvolutionError::Grammar(GrammarError::Empty))
        ));
    }

    #[test]
    fn test_seeded_runs_reproducible() {
        let run = || {
            let mut config = test_config(12, 4);
            config.evaluation.concurrency = 3;
            let mut engine = EvolutionEngine::new(config, Arc::new(ByteSumTarget)).unwrap();
            engine.run().unwrap()
        };

        let first = run();
        let second = run();
        assert_eq!(first.history, second.history);
        assert_eq!(first.best.payload, second.best.payload);
    }

    #[test]
    fn test_target_fitness_stops_early() {
        let mut config = test_config(6, 20);
        config.population.target_fitness = Some(1.0);
        let mut engine = EvolutionEngine::new(config, Arc::new(FixedStatus(500))).unwrap();

        let result = engine.run().unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::TargetReached);
        assert_eq!(result.stats.generations, 0);
    }

    #[test]
    fn test_stagnation_limit() {
        let mut config = test_config(6, 20);
        config.population.stagnation_limit = Some(2);
        let mut engine = EvolutionEngine::new(config, Arc::new(FixedStatus(200))).unwrap();

        let result = engine.run().unwrap();
        assert_eq!(result.stats.stop_reason, StopReason::Stagnation);
        assert_eq!(result.stats.generations, 2);
    }

    #[test]
    fn test_panicking_evaluation_scored_as_failure() {
        let mut engine = EvolutionEngine::new(test_config(4, 2), Arc::new(PanickingTarget)).unwrap();
        let result = engine.run().unwrap();

        assert_eq!(result.stats.generations, 2);
        assert_eq!(result.stats.best_fitness, 0.0);
        let diagnostics = result.best.diagnostics.unwrap();
        assert_eq!(diagnostics.class, ResponseClass::Malformed);
    }

    #[test]
    fn test_progress_callback_per_generation() {
        let mut engine = EvolutionEngine::new(test_config(6, 3), Arc::new(ByteSumTarget)).unwrap();
        let mut phases = Vec::new();
        engine
            .run_with_callback(|progress| phases.push((progress.generation, progress.phase.clone())))
            .unwrap();

        assert_eq!(phases.first(), Some(&(0, EvolutionPhase::Initializing)));
        assert_eq!(phases.last(), Some(&(3, EvolutionPhase::Complete)));
        assert_eq!(phases.len(), 5);
    }
}
