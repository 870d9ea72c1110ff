//! Evolutionary search for failure-inducing API payloads.
//!
//! # Overview
//!
//! - **Grammar** (`grammar`): compiled field table driving random generation,
//!   mutation and crossover
//! - **Genome** (`genome`): individuals and the seeded random source
//! - **Target** (`target`): the HTTP boundary, stubbable through [`HttpTarget`]
//! - **Fitness** (`fitness`): one request per evaluation, banded scoring
//! - **Operators** (`operators`): selection, crossover and mutation strategies
//! - **Search** (`search`): the generational engine
//! - **Archive** (`archive`): tagged store of discovered payloads
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use payload_evolver::evolution::{EvolutionEngine, ReqwestTarget};
//! use payload_evolver::schema::RunConfig;
//!
//! let config = RunConfig::user_api_example();
//! let target = ReqwestTarget::from_config(&config.evaluation).unwrap();
//!
//! let mut engine = EvolutionEngine::new(config, Arc::new(target)).unwrap();
//! let result = engine
//!     .run_with_callback(|progress| {
//!         println!(
//!             "Generation {}: best fitness = {:.3}",
//!             progress.generation, progress.best_fitness
//!         );
//!     })
//!     .unwrap();
//!
//! println!("Best payload: {:?}", result.best.payload);
//! ```

mod archive;
mod fitness;
mod genome;
mod grammar;
mod operators;
mod search;
mod target;

pub use archive::{ArchivedPayload, PayloadArchive, PayloadExport, PayloadMetadata, auto_categorize};
pub use fitness::{Evaluation, FitnessEvaluator};
pub use genome::{Individual, PayloadRng, payload_distance};
pub use grammar::Grammar;
pub use operators::{
    Crossover, Mutation, RandomFieldMutation, RankBased, RouletteWheel, SegmentCrossover,
    Selection, Tournament, UniformCrossover, crossover_operator, mutation_operator,
    selection_operator,
};
pub use search::{EvolutionEngine, EvolutionError};
pub use target::{HttpTarget, ReqwestTarget, TargetResponse, TransportError};
