//! Individuals and the random source driving their variation.

use rand::prelude::*;
use serde_json::Value;

use crate::schema::{CandidateSnapshot, Diagnostics};

/// Random number generator owned by a run.
///
/// Every stochastic decision of the engine and the grammar draws from this
/// source, so a fixed seed reproduces a run.
pub struct PayloadRng {
    rng: StdRng,
}

impl PayloadRng {
    /// Create from seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Bernoulli trial. Probabilities outside [0, 1] saturate.
    pub fn chance(&mut self, p: f32) -> bool {
        if p <= 0.0 {
            false
        } else if p >= 1.0 {
            true
        } else {
            self.rng.r#gen::<f32>() < p
        }
    }

    /// Uniform index in `0..len`. `len` must be positive.
    pub fn index(&mut self, len: usize) -> usize {
        self.rng.gen_range(0..len)
    }

    /// Uniform float in `[0, 1)`.
    pub fn unit(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }

    /// Underlying generator for distribution sampling.
    pub fn inner(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

/// A candidate payload.
///
/// `genes` holds one value per grammar field, in grammar order, so the field
/// set of an individual always matches the grammar that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Individual {
    /// Unique identifier.
    pub id: u64,
    /// Field values in grammar order.
    pub genes: Vec<Value>,
    /// Fitness, `None` until evaluated.
    pub fitness: Option<f32>,
    /// Diagnostics from the last evaluation.
    pub diagnostics: Option<Diagnostics>,
    /// Generation created.
    pub generation: usize,
    /// Parent IDs.
    pub parents: Vec<u64>,
}

impl Individual {
    /// Create an unevaluated individual.
    pub fn new(id: u64, genes: Vec<Value>, generation: usize) -> Self {
        Self {
            id,
            genes,
            fitness: None,
            diagnostics: None,
            generation,
            parents: Vec::new(),
        }
    }

    /// Fitness for ranking; unevaluated individuals rank lowest.
    pub fn score(&self) -> f32 {
        self.fitness.unwrap_or(f32::NEG_INFINITY)
    }

    /// Drop the cached evaluation after the genes changed.
    pub fn invalidate(&mut self) {
        self.fitness = None;
        self.diagnostics = None;
    }

    /// Convert to snapshot for serialization.
    pub fn to_snapshot(&self, field_names: &[String]) -> CandidateSnapshot {
        let payload = field_names
            .iter()
            .cloned()
            .zip(self.genes.iter().cloned())
            .collect();

        CandidateSnapshot {
            id: self.id,
            fitness: self.score(),
            payload,
            diagnostics: self.diagnostics.clone(),
            generation: self.generation,
            parents: self.parents.clone(),
        }
    }
}

/// Fraction of fields whose values differ between two individuals.
pub fn payload_distance(a: &[Value], b: &[Value]) -> f32 {
    let len = a.len().max(b.len());
    if len == 0 {
        return 0.0;
    }
    let same = a.iter().zip(b.iter()).filter(|(x, y)| x == y).count();
    (len - same) as f32 / len as f32
}
