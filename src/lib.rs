//! Payload Evolver - genetic discovery of failure-inducing HTTP JSON payloads.
//!
//! A population of candidate request bodies, shaped by a declared grammar, is
//! evolved against a live endpoint. Server errors score highest, client errors
//! and successes sit in lower bands modulated by content heuristics, and
//! network failures score lowest.
//!
//! # Architecture
//!
//! - `schema`: serde configuration, grammar declarations and result types
//! - `evolution`: grammar compilation, fitness evaluation, genetic operators,
//!   the engine and the payload archive
//! - `discovery`: the driver producing a ranked report
//!
//! # Example
//!
//! ```rust,no_run
//! use payload_evolver::{DiscoveryDriver, schema::RunConfig};
//!
//! let config = RunConfig::user_api_example();
//! let mut driver = DiscoveryDriver::from_config(config).unwrap();
//! let report = driver.run().unwrap();
//!
//! for entry in &report.top {
//!     println!("#{} fitness={:.3} {:?}", entry.rank, entry.fitness, entry.payload);
//! }
//! ```

pub mod discovery;
pub mod evolution;
pub mod schema;

// Re-export commonly used types
pub use discovery::{DiscoveredPayload, DiscoveryDriver, DiscoveryError, DiscoveryReport};
pub use evolution::{EvolutionEngine, HttpTarget, ReqwestTarget};
pub use schema::RunConfig;
