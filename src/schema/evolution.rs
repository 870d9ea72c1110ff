//! Run configuration and result types for payload discovery.
//!
//! This module provides the top-level [`RunConfig`] consumed by the evolution
//! engine, together with the serializable progress, statistics and result
//! types it produces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    ConfigError, ContentHeuristic, EvaluationConfig, FieldSpec, FitnessConfig, MutationRule,
    ValueDomain, WeightedDomain,
};

/// Top-level configuration for a discovery run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Ordered field declarations of the payload.
    pub grammar: Vec<FieldSpec>,
    /// Population and generation settings.
    #[serde(default)]
    pub population: PopulationConfig,
    /// Genetic operators and their probabilities.
    #[serde(default)]
    pub algorithm: GeneticAlgorithmConfig,
    /// Target API settings.
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Fitness bands and heuristics.
    #[serde(default)]
    pub fitness: FitnessConfig,
    /// Archive of discovered payloads.
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::user_api_example()
    }
}

/// Population and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PopulationConfig {
    /// Number of individuals in population.
    #[serde(default = "default_population_size")]
    pub size: usize,
    /// Number of generations to run.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Stop early once the best fitness reaches this value.
    #[serde(default)]
    pub target_fitness: Option<f32>,
    /// Stagnation limit: stop if no improvement for N generations.
    #[serde(default)]
    pub stagnation_limit: Option<usize>,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            size: default_population_size(),
            max_generations: default_max_generations(),
            target_fitness: None,
            stagnation_limit: None,
        }
    }
}

fn default_population_size() -> usize {
    50
}
fn default_max_generations() -> usize {
    30
}

/// Genetic algorithm configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneticAlgorithmConfig {
    /// Selection method.
    #[serde(default)]
    pub selection: SelectionMethod,
    /// Crossover method.
    #[serde(default)]
    pub crossover: CrossoverMethod,
    /// Mutation method.
    #[serde(default)]
    pub mutation: MutationMethod,
    /// Probability that a parent pair is recombined (0.0-1.0).
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f32,
    /// Probability that an offspring is mutated (0.0-1.0).
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f32,
    /// Preserve the single best individual unchanged.
    #[serde(default = "default_elitism")]
    pub elitism: bool,
}

impl Default for GeneticAlgorithmConfig {
    fn default() -> Self {
        Self {
            selection: SelectionMethod::default(),
            crossover: CrossoverMethod::default(),
            mutation: MutationMethod::default(),
            crossover_rate: default_crossover_rate(),
            mutation_rate: default_mutation_rate(),
            elitism: default_elitism(),
        }
    }
}

fn default_crossover_rate() -> f32 {
    0.7
}
fn default_mutation_rate() -> f32 {
    0.3
}
fn default_elitism() -> bool {
    true
}

/// Selection method for the genetic algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method")]
pub enum SelectionMethod {
    /// Tournament selection with configurable size.
    Tournament {
        #[serde(default = "default_tournament_size")]
        size: usize,
    },
    /// Linear rank-based selection. `pressure` in [1, 2) is the expected
    /// number of copies of the best individual; below 2 the worst keeps a
    /// nonzero share.
    RankBased {
        #[serde(default = "default_rank_pressure")]
        pressure: f32,
    },
    /// Roulette wheel (fitness-proportionate) selection.
    RouletteWheel,
}

impl Default for SelectionMethod {
    fn default() -> Self {
        Self::Tournament {
            size: default_tournament_size(),
        }
    }
}

fn default_tournament_size() -> usize {
    3
}
fn default_rank_pressure() -> f32 {
    1.5
}

/// Crossover method for the genetic algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "method")]
pub enum CrossoverMethod {
    /// Each field independently comes from one parent or the other.
    #[default]
    Uniform,
    /// A contiguous run of fields is exchanged between the parents.
    Segment,
}

/// Mutation method for the genetic algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "method")]
pub enum MutationMethod {
    /// Mutate between one and `max_fields` randomly chosen fields.
    RandomFields {
        #[serde(default = "default_max_mutated_fields")]
        max_fields: usize,
    },
}

impl Default for MutationMethod {
    fn default() -> Self {
        Self::RandomFields {
            max_fields: default_max_mutated_fields(),
        }
    }
}

fn default_max_mutated_fields() -> usize {
    1
}

/// Archive configuration for storing discovered payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Maximum payloads kept in the archive.
    #[serde(default = "default_archive_size")]
    pub max_size: usize,
    /// Number of payloads in the final ranked report.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Payloads closer than this (fraction of differing fields) to an
    /// archived payload replace it only when fitter.
    #[serde(default)]
    pub diversity_threshold: f32,
    /// Output directory for saved reports.
    #[serde(default)]
    pub output_dir: Option<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_size: default_archive_size(),
            top_k: default_top_k(),
            diversity_threshold: 0.0,
            output_dir: None,
        }
    }
}

fn default_archive_size() -> usize {
    100
}
fn default_top_k() -> usize {
    10
}

// ============================================================================
// Example configuration
// ============================================================================

impl RunConfig {
    /// Configuration targeting a user-creation endpoint accepting
    /// `{name, age, email, zipcode, hobbies, memleak}`.
    pub fn user_api_example() -> Self {
        let text = |min_len: usize, max_len: usize| ValueDomain::Text {
            min_len,
            max_len,
            alphabet: "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789"
                .to_string(),
        };
        let digits = |len: usize| ValueDomain::Text {
            min_len: len,
            max_len: len,
            alphabet: "0123456789".to_string(),
        };
        let literal = |s: &str| ValueDomain::Categorical {
            values: vec![Value::from(s)],
        };
        let strings = |items: &[&str]| ValueDomain::Categorical {
            values: items.iter().map(|&s| Value::from(s)).collect(),
        };

        let tld = strings(&[".com", ".org", ".net", ".io", ".co"]);
        let name = FieldSpec::new(
            "name",
            ValueDomain::OneOf {
                variants: vec![
                    WeightedDomain::new(0.8, text(3, 15)),
                    WeightedDomain::new(0.08, text(51, 100)),
                    WeightedDomain::new(0.07, text(1, 2)),
                    WeightedDomain::new(
                        0.05,
                        strings(&[
                            "' OR '1'='1",
                            "'; DROP TABLE users; --",
                            "' UNION SELECT * FROM users; --",
                            "' DELETE FROM users WHERE '1'='1",
                        ]),
                    ),
                ],
            },
        );
        let age = FieldSpec::new(
            "age",
            ValueDomain::OneOf {
                variants: vec![
                    WeightedDomain::new(1.0, ValueDomain::Integer { min: 0, max: 120 }),
                    WeightedDomain::new(1.0, ValueDomain::Integer { min: -100, max: -1 }),
                    WeightedDomain::new(1.0, ValueDomain::Integer { min: 121, max: 1000 }),
                    WeightedDomain::new(1.0, strings(&["0", "18", "42", "120", "150"])),
                    WeightedDomain::new(1.0, text(3, 10)),
                ],
            },
        );
        let email = FieldSpec::new(
            "email",
            ValueDomain::OneOf {
                variants: vec![
                    WeightedDomain::new(
                        0.8,
                        ValueDomain::Template {
                            parts: vec![text(3, 8), literal("@"), text(3, 7), tld.clone()],
                        },
                    ),
                    WeightedDomain::new(
                        0.05,
                        ValueDomain::Template {
                            parts: vec![text(3, 8), text(3, 7), tld.clone()],
                        },
                    ),
                    WeightedDomain::new(
                        0.05,
                        ValueDomain::Template {
                            parts: vec![text(3, 8), literal("@"), tld.clone()],
                        },
                    ),
                    WeightedDomain::new(
                        0.05,
                        ValueDomain::Template {
                            parts: vec![
                                text(3, 8),
                                literal("@"),
                                text(3, 7),
                                tld.clone(),
                                literal("!#"),
                            ],
                        },
                    ),
                    WeightedDomain::new(
                        0.05,
                        ValueDomain::Template {
                            parts: vec![text(3, 8), literal("@@"), text(3, 7), tld],
                        },
                    ),
                ],
            },
        );
        let zipcode = FieldSpec::new(
            "zipcode",
            ValueDomain::OneOf {
                variants: vec![
                    WeightedDomain::new(0.15, literal("90210")),
                    WeightedDomain::new(
                        0.10,
                        strings(&["123", "1234567", "ABC12", "12345-123", "123456-1234", "12345-"]),
                    ),
                    WeightedDomain::new(0.525, digits(5)),
                    WeightedDomain::new(
                        0.225,
                        ValueDomain::Template {
                            parts: vec![digits(5), literal("-"), digits(4)],
                        },
                    ),
                ],
            },
        );
        let hobbies = FieldSpec::new(
            "hobbies",
            ValueDomain::StringList {
                candidates: [
                    "reading",
                    "writing",
                    "gaming",
                    "cooking",
                    "hiking",
                    "programming",
                    "music",
                    "movies",
                    "sports",
                    "photography",
                    "gardening",
                    "painting",
                    "travel",
                    "fishing",
                    "swimming",
                    "hacking",
                    "fraud",
                    "illegal activities",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
                min_items: 1,
                max_items: 5,
            },
        )
        .with_mutation(MutationRule::ListEdit);
        let memleak = FieldSpec::new("memleak", ValueDomain::Boolean);

        let mut fitness = FitnessConfig::default();
        fitness.heuristics.extend([
            ContentHeuristic::FieldEquals {
                field: "zipcode".to_string(),
                value: Value::from("90210"),
                bonus: 0.3,
            },
            ContentHeuristic::DistinctItems {
                field: "hobbies".to_string(),
                min_distinct: 3,
                bonus: 0.2,
            },
            ContentHeuristic::EchoedField {
                field: "name".to_string(),
                bonus: 0.1,
            },
        ]);

        Self {
            grammar: vec![name, age, email, zipcode, hobbies, memleak],
            population: PopulationConfig::default(),
            algorithm: GeneticAlgorithmConfig::default(),
            evaluation: EvaluationConfig::default(),
            fitness,
            archive: ArchiveConfig::default(),
            random_seed: None,
        }
    }
}

// ============================================================================
// Diagnostics, Progress and Result Types
// ============================================================================

/// Classification of an evaluation outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ResponseClass {
    /// 1xx and 3xx.
    Other,
    /// 2xx.
    Success,
    /// 4xx.
    ClientError,
    /// 5xx.
    ServerError,
    /// Connection failure, timeout or an unusable status code.
    NetworkFailure,
    /// Payload could not be serialized or exceeded the body limit.
    Malformed,
}

impl ResponseClass {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            100..=199 | 300..=399 => Self::Other,
            200..=299 => Self::Success,
            400..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => Self::NetworkFailure,
        }
    }
}

/// Diagnostics attached to an evaluated individual.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Diagnostics {
    /// Outcome class.
    pub class: ResponseClass,
    /// HTTP status, if a response arrived.
    pub status: Option<u16>,
    /// Wall time of the call in milliseconds.
    pub elapsed_ms: u64,
    /// Leading part of the response body.
    pub excerpt: Option<String>,
    /// Failure description for network failures and malformed candidates.
    pub failure: Option<String>,
    /// The call hit the evaluation timeout.
    #[serde(default)]
    pub timed_out: bool,
    /// Heuristics that matched, by description.
    #[serde(default)]
    pub matched: Vec<String>,
}

impl Diagnostics {
    /// Diagnostics for a failed evaluation.
    pub fn failure(class: ResponseClass, reason: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            class,
            status: None,
            elapsed_ms,
            excerpt: None,
            failure: Some(reason.into()),
            timed_out: false,
            matched: Vec::new(),
        }
    }

    /// Diagnostics for a call that exceeded the evaluation timeout.
    pub fn timeout(reason: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(ResponseClass::NetworkFailure, reason, elapsed_ms)
        }
    }
}

/// Snapshot of an individual for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    /// Unique identifier.
    pub id: u64,
    /// Fitness score.
    pub fitness: f32,
    /// The JSON payload.
    pub payload: Map<String, Value>,
    /// Diagnostics from the evaluation that produced `fitness`.
    pub diagnostics: Option<Diagnostics>,
    /// Generation this candidate was created.
    pub generation: usize,
    /// Parent IDs (for genealogy).
    pub parents: Vec<u64>,
}

/// Fitness summary of one generation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationStats {
    /// Generation number (0 is the initial population).
    pub generation: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std_dev: f32,
    /// HTTP evaluations performed for this generation.
    pub evaluations: usize,
    /// Mean pairwise fraction of differing fields.
    pub diversity: f32,
    /// Best fitness seen in the run so far.
    pub best_so_far: f32,
}

impl GenerationStats {
    /// Summarize a set of fitness values.
    pub fn from_fitness(generation: usize, fitness: &[f32]) -> Self {
        let n = fitness.len().max(1) as f32;
        let min = fitness.iter().copied().fold(f32::INFINITY, f32::min);
        let max = fitness.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mean = fitness.iter().sum::<f32>() / n;
        let variance = fitness.iter().map(|f| (f - mean).powi(2)).sum::<f32>() / n;

        Self {
            generation,
            min: if fitness.is_empty() { 0.0 } else { min },
            max: if fitness.is_empty() { 0.0 } else { max },
            mean,
            std_dev: variance.sqrt(),
            evaluations: 0,
            diversity: 0.0,
            best_so_far: max,
        }
    }
}

/// Current phase of evolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum EvolutionPhase {
    /// Initializing population.
    #[default]
    Initializing,
    /// Evaluating candidates.
    Evaluating,
    /// Evolution complete.
    Complete,
    /// Evolution stopped early.
    Stopped,
}

/// Progress update emitted after each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionProgress {
    /// Current generation number.
    pub generation: usize,
    /// Total generations planned.
    pub total_generations: usize,
    /// Best fitness seen so far.
    pub best_fitness: f32,
    /// Statistics of the current generation.
    pub stats: Option<GenerationStats>,
    /// Generations since last improvement.
    pub stagnation_count: usize,
    /// HTTP evaluations performed so far.
    pub evaluations_total: u64,
    /// Best candidate seen so far.
    pub best_candidate: Option<CandidateSnapshot>,
    /// Current phase of the algorithm.
    pub phase: EvolutionPhase,
}

/// Final result of an evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionResult {
    /// Best candidate found across the whole run.
    pub best: CandidateSnapshot,
    /// Archived payloads, fittest first.
    pub archive: Vec<CandidateSnapshot>,
    /// Statistics from the run.
    pub stats: EvolutionStats,
    /// Per-generation statistics, generation 0 first.
    pub history: Vec<GenerationStats>,
}

/// Statistics from an evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionStats {
    /// Generations completed after initialization.
    pub generations: usize,
    /// Total HTTP evaluations performed.
    pub total_evaluations: u64,
    /// Best fitness achieved.
    pub best_fitness: f32,
    /// Average fitness of final population.
    pub final_avg_fitness: f32,
    /// Time taken (in seconds).
    pub elapsed_seconds: f64,
    /// Evaluations per second.
    pub evaluations_per_second: f64,
    /// Reason for stopping.
    pub stop_reason: StopReason,
}

/// Reason evolution stopped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StopReason {
    /// Reached maximum generations.
    MaxGenerations,
    /// Reached target fitness.
    TargetReached,
    /// Stagnation limit hit.
    Stagnation,
    /// User cancelled.
    Cancelled,
}

// ============================================================================
// Validation
// ============================================================================

impl RunConfig {
    /// Validate run parameters. The grammar itself is checked when compiled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population.size == 0 {
            return Err(ConfigError::InvalidPopulationSize);
        }
        if self.population.max_generations == 0 {
            return Err(ConfigError::InvalidGenerations);
        }

        let ga = &self.algorithm;
        for (name, value) in [
            ("Crossover", ga.crossover_rate),
            ("Mutation", ga.mutation_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidProbability { name, value });
            }
        }

        match ga.selection {
            SelectionMethod::Tournament { size } if size == 0 => {
                return Err(ConfigError::InvalidTournamentSize);
            }
            SelectionMethod::RankBased { pressure } if !(1.0..2.0).contains(&pressure) => {
                return Err(ConfigError::InvalidRankPressure(pressure));
            }
            _ => {}
        }

        let MutationMethod::RandomFields { max_fields } = ga.mutation;
        if max_fields == 0 {
            return Err(ConfigError::InvalidMutationFields);
        }

        if self.archive.max_size == 0 || self.archive.top_k == 0 {
            return Err(ConfigError::InvalidArchive);
        }

        self.evaluation.validate()?;
        self.fitness.validate()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = RunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grammar.len(), 6);
    }

    #[test]
    fn test_invalid_probabilities() {
        let mut config = RunConfig::default();
        config.algorithm.crossover_rate = 1.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability {
                name: "Crossover",
                ..
            })
        ));

        let mut config = RunConfig::default();
        config.algorithm.mutation_rate = -0.1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProbability {
                name: "Mutation",
                ..
            })
        ));

        let mut config = RunConfig::default();
        config.algorithm.mutation_rate = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_population_rejected() {
        let mut config = RunConfig::default();
        config.population.size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidPopulationSize));
    }

    #[test]
    fn test_selection_pressure_validation() {
        let mut config = RunConfig::default();
        config.algorithm.selection = SelectionMethod::Tournament { size: 0 };
        assert_eq!(config.validate(), Err(ConfigError::InvalidTournamentSize));

        config.algorithm.selection = SelectionMethod::RankBased { pressure: 2.5 };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRankPressure(2.5)));

        config.algorithm.selection = SelectionMethod::RankBased { pressure: 2.0 };
        assert_eq!(config.validate(), Err(ConfigError::InvalidRankPressure(2.0)));
    }

    #[test]
    fn test_generation_stats() {
        let stats = GenerationStats::from_fitness(3, &[0.0, 0.5, 1.0]);
        assert_eq!(stats.generation, 3);
        assert_eq!(stats.min, 0.0);
        assert_eq!(stats.max, 1.0);
        assert!((stats.mean - 0.5).abs() < 1e-6);
        assert!((stats.std_dev - (1.0f32 / 6.0).sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_response_class() {
        assert_eq!(ResponseClass::from_status(201), ResponseClass::Success);
        assert_eq!(ResponseClass::from_status(302), ResponseClass::Other);
        assert_eq!(ResponseClass::from_status(422), ResponseClass::ClientError);
        assert_eq!(ResponseClass::from_status(503), ResponseClass::ServerError);
        assert_eq!(ResponseClass::from_status(999), ResponseClass::NetworkFailure);
    }

    #[test]
    fn test_serialization() {
        let config = RunConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RunConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.population.size, config.population.size);
        assert_eq!(parsed.grammar.len(), config.grammar.len());
    }
}
