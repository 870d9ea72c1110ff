//! Grammar declarations for evolvable payloads.
//!
//! A grammar is an ordered list of field descriptors. Each descriptor names a
//! JSON field, the domain its values are drawn from, the mutation rule applied
//! to it, and how crossover combines two parents' values for it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declaration of a single payload field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// JSON key emitted in the payload.
    pub name: String,
    /// Value domain used by the random generator.
    pub domain: ValueDomain,
    /// Mutation rule. `Auto` picks the natural rule for the domain.
    #[serde(default)]
    pub mutation: MutationRule,
    /// How crossover combines the parents' values for this field.
    #[serde(default)]
    pub crossover: FieldCrossover,
}

impl FieldSpec {
    /// Field with the default mutation and crossover rules.
    pub fn new(name: impl Into<String>, domain: ValueDomain) -> Self {
        Self {
            name: name.into(),
            domain,
            mutation: MutationRule::Auto,
            crossover: FieldCrossover::Swap,
        }
    }

    /// Override the mutation rule.
    pub fn with_mutation(mut self, mutation: MutationRule) -> Self {
        self.mutation = mutation;
        self
    }

    /// Override the crossover rule.
    pub fn with_crossover(mut self, crossover: FieldCrossover) -> Self {
        self.crossover = crossover;
        self
    }
}

/// Domain of values a field may take.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum ValueDomain {
    /// Uniform integer in `min..=max`.
    Integer { min: i64, max: i64 },
    /// Uniform float in `min..=max`.
    Float { min: f64, max: f64 },
    /// `true` or `false`.
    Boolean,
    /// One of a fixed set of JSON values.
    Categorical { values: Vec<Value> },
    /// Random text with length in `min_len..=max_len`.
    Text {
        min_len: usize,
        max_len: usize,
        #[serde(default = "default_alphabet")]
        alphabet: String,
    },
    /// Array of distinct strings drawn from `candidates`.
    StringList {
        candidates: Vec<String>,
        #[serde(default = "default_min_items")]
        min_items: usize,
        max_items: usize,
    },
    /// Weighted mixture of other domains.
    OneOf { variants: Vec<WeightedDomain> },
    /// Concatenation of the string renderings of each part.
    Template { parts: Vec<ValueDomain> },
}

impl ValueDomain {
    /// Short name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Integer { .. } => "Integer",
            Self::Float { .. } => "Float",
            Self::Boolean => "Boolean",
            Self::Categorical { .. } => "Categorical",
            Self::Text { .. } => "Text",
            Self::StringList { .. } => "StringList",
            Self::OneOf { .. } => "OneOf",
            Self::Template { .. } => "Template",
        }
    }

    /// Whether the domain holds a single value.
    pub fn is_singleton(&self) -> bool {
        match self {
            Self::Integer { min, max } => min == max,
            Self::Float { min, max } => min == max,
            Self::Boolean => false,
            Self::Categorical { values } => values.len() == 1,
            Self::Text {
                min_len,
                max_len,
                alphabet,
            } => *max_len == 0 || (min_len == max_len && alphabet.chars().count() == 1),
            Self::StringList {
                candidates,
                min_items,
                max_items,
            } => {
                *max_items == 0
                    || candidates.is_empty()
                    || (candidates.len() == 1 && min_items == max_items)
            }
            Self::OneOf { variants } => variants.len() == 1 && variants[0].domain.is_singleton(),
            Self::Template { parts } => parts.iter().all(ValueDomain::is_singleton),
        }
    }

    /// Validate bounds and non-emptiness.
    pub fn validate(&self, field: &str) -> Result<(), GrammarError> {
        let invalid = |reason: String| GrammarError::InvalidDomain {
            field: field.to_string(),
            reason,
        };

        match self {
            Self::Integer { min, max } => {
                if min > max {
                    return Err(invalid(format!("min ({min}) > max ({max})")));
                }
            }
            Self::Float { min, max } => {
                if !min.is_finite() || !max.is_finite() {
                    return Err(invalid("bounds must be finite".to_string()));
                }
                if min > max {
                    return Err(invalid(format!("min ({min}) > max ({max})")));
                }
                if !(max - min).is_finite() {
                    return Err(invalid(format!("range {min}..={max} is too wide to sample")));
                }
            }
            Self::Boolean => {}
            Self::Categorical { values } => {
                if values.is_empty() {
                    return Err(invalid("no categorical values".to_string()));
                }
            }
            Self::Text {
                min_len,
                max_len,
                alphabet,
            } => {
                if min_len > max_len {
                    return Err(invalid(format!("min_len ({min_len}) > max_len ({max_len})")));
                }
                if alphabet.is_empty() && *max_len > 0 {
                    return Err(invalid("empty alphabet".to_string()));
                }
            }
            Self::StringList {
                candidates,
                min_items,
                max_items,
            } => {
                if min_items > max_items {
                    return Err(invalid(format!(
                        "min_items ({min_items}) > max_items ({max_items})"
                    )));
                }
                if *min_items > candidates.len() {
                    return Err(invalid(format!(
                        "min_items ({min_items}) exceeds {} distinct candidates",
                        candidates.len()
                    )));
                }
            }
            Self::OneOf { variants } => {
                if variants.is_empty() {
                    return Err(invalid("no variants".to_string()));
                }
                for variant in variants {
                    if !variant.weight.is_finite() || variant.weight < 0.0 {
                        return Err(invalid(format!("invalid weight {}", variant.weight)));
                    }
                    variant.domain.validate(field)?;
                }
                if variants.iter().all(|v| v.weight == 0.0) {
                    return Err(invalid("all variant weights are zero".to_string()));
                }
            }
            Self::Template { parts } => {
                if parts.is_empty() {
                    return Err(invalid("template has no parts".to_string()));
                }
                for part in parts {
                    part.validate(field)?;
                }
            }
        }
        Ok(())
    }
}

fn default_alphabet() -> String {
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".to_string()
}
fn default_min_items() -> usize {
    1
}
fn default_weight() -> f64 {
    1.0
}

/// A domain paired with its relative selection weight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightedDomain {
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub domain: ValueDomain,
}

impl WeightedDomain {
    pub fn new(weight: f64, domain: ValueDomain) -> Self {
        Self { weight, domain }
    }
}

/// Mutation rule for a field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "rule")]
pub enum MutationRule {
    /// Natural rule for the domain (perturb numbers, pick another category,
    /// edit lists, resample everything else).
    #[default]
    Auto,
    /// Draw a fresh value from the domain.
    Resample,
    /// Bounded random perturbation of a numeric value. Integers move by a
    /// uniform step in `[-delta, delta]`, floats by Gaussian noise scaled by
    /// `delta`.
    Perturb {
        delta: f64,
        #[serde(default = "default_clamp")]
        clamp: bool,
    },
    /// Pick a different categorical value uniformly at random.
    PickOther,
    /// Append random characters from the text alphabet.
    Append {
        #[serde(default = "default_append_min")]
        min_chars: usize,
        #[serde(default = "default_append_max")]
        max_chars: usize,
        /// Hard cap on the resulting length.
        max_len: usize,
    },
    /// Add, remove or replace a single list item.
    ListEdit,
}

fn default_clamp() -> bool {
    true
}
fn default_append_min() -> usize {
    1
}
fn default_append_max() -> usize {
    5
}

impl MutationRule {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Auto => "Auto",
            Self::Resample => "Resample",
            Self::Perturb { .. } => "Perturb",
            Self::PickOther => "PickOther",
            Self::Append { .. } => "Append",
            Self::ListEdit => "ListEdit",
        }
    }
}

/// Per-field crossover behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FieldCrossover {
    /// Children exchange the parents' values.
    #[default]
    Swap,
    /// Numeric blend of both parents' values.
    Blend,
}

/// Grammar construction and lookup errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GrammarError {
    #[error("Grammar declares no fields")]
    Empty,
    #[error("Field `{0}` is declared more than once")]
    DuplicateField(String),
    #[error("Field name must be non-empty")]
    EmptyFieldName,
    #[error("Invalid domain for field `{field}`: {reason}")]
    InvalidDomain { field: String, reason: String },
    #[error("Mutation rule {rule} cannot apply to {domain} field `{field}`")]
    IncompatibleMutation {
        field: String,
        rule: &'static str,
        domain: &'static str,
    },
    #[error("Blend crossover requires a numeric domain (field `{field}` is {domain})")]
    IncompatibleCrossover { field: String, domain: &'static str },
    #[error("Unknown field `{0}`")]
    UnknownField(String),
}
