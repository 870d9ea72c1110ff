//! Compiled grammar: random generation, per-field mutation and crossover.
//!
//! [`Grammar::new`] resolves every field declaration into an entry of an
//! operation table once. Variation operators then dispatch on that table, never
//! on the runtime shape of a value.

use std::collections::HashSet;

use rand::prelude::*;
use serde_json::{Map, Number, Value};

use crate::schema::{FieldCrossover, FieldSpec, GrammarError, MutationRule, ValueDomain};

use super::genome::{Individual, PayloadRng};

/// Immutable, shareable payload grammar.
#[derive(Debug, Clone)]
pub struct Grammar {
    fields: Vec<FieldOps>,
    names: Vec<String>,
}

/// Operation table entry for one field.
#[derive(Debug, Clone)]
struct FieldOps {
    domain: ValueDomain,
    mutation: FieldMutation,
    crossover: FieldCrossover,
}

/// Resolved mutation operator.
#[derive(Debug, Clone)]
enum FieldMutation {
    Resample,
    PerturbInteger {
        delta: i64,
        clamp: bool,
        min: i64,
        max: i64,
    },
    PerturbFloat {
        delta: f64,
        clamp: bool,
        min: f64,
        max: f64,
    },
    PickOther {
        values: Vec<Value>,
    },
    Append {
        min_chars: usize,
        max_chars: usize,
        max_len: usize,
        alphabet: Vec<char>,
    },
    ListEdit {
        candidates: Vec<String>,
        min_items: usize,
        max_items: usize,
    },
}

impl Grammar {
    /// Compile field declarations into a grammar.
    pub fn new(specs: Vec<FieldSpec>) -> Result<Self, GrammarError> {
        if specs.is_empty() {
            return Err(GrammarError::Empty);
        }

        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(specs.len());
        let mut names = Vec::with_capacity(specs.len());

        for spec in specs {
            if spec.name.is_empty() {
                return Err(GrammarError::EmptyFieldName);
            }
            if !seen.insert(spec.name.clone()) {
                return Err(GrammarError::DuplicateField(spec.name));
            }
            spec.domain.validate(&spec.name)?;

            let mutation = resolve_mutation(&spec)?;
            if spec.crossover == FieldCrossover::Blend
                && !matches!(
                    spec.domain,
                    ValueDomain::Integer { .. } | ValueDomain::Float { .. }
                )
            {
                return Err(GrammarError::IncompatibleCrossover {
                    field: spec.name,
                    domain: spec.domain.kind(),
                });
            }

            fields.push(FieldOps {
                domain: spec.domain,
                mutation,
                crossover: spec.crossover,
            });
            names.push(spec.name);
        }

        Ok(Self { fields, names })
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Always false for a compiled grammar.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> &[String] {
        &self.names
    }

    /// Position of a field.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Draw a value for every field.
    pub fn random_genes(&self, rng: &mut PayloadRng) -> Vec<Value> {
        self.fields
            .iter()
            .map(|field| sample(&field.domain, rng))
            .collect()
    }

    /// A fresh individual with independently drawn field values.
    pub fn generate_random(&self, id: u64, generation: usize, rng: &mut PayloadRng) -> Individual {
        Individual::new(id, self.random_genes(rng), generation)
    }

    /// Apply the declared mutation rule to the named field.
    ///
    /// Returns whether the value changed. Fields with a one-element domain are
    /// left untouched.
    pub fn mutate_field(
        &self,
        individual: &mut Individual,
        name: &str,
        rng: &mut PayloadRng,
    ) -> Result<bool, GrammarError> {
        let index = self
            .field_index(name)
            .ok_or_else(|| GrammarError::UnknownField(name.to_string()))?;
        Ok(self.mutate_index(individual, index, rng))
    }

    /// Apply the mutation rule of the field at `index`.
    pub fn mutate_index(&self, individual: &mut Individual, index: usize, rng: &mut PayloadRng) -> bool {
        let field = &self.fields[index];
        let current = &individual.genes[index];
        let next = mutate_value(field, current, rng);

        match next {
            Some(value) if value != *current => {
                individual.genes[index] = value;
                individual.invalidate();
                true
            }
            _ => false,
        }
    }

    /// Combine two parents' values for the field at `index` in place.
    pub fn cross_field(&self, index: usize, a: &mut Value, b: &mut Value, rng: &mut PayloadRng) {
        match self.fields[index].crossover {
            FieldCrossover::Swap => std::mem::swap(a, b),
            FieldCrossover::Blend => {
                let t = rng.unit();
                match (&self.fields[index].domain, a.as_f64(), b.as_f64()) {
                    (ValueDomain::Integer { .. }, Some(x), Some(y)) => {
                        *a = Value::from((x + t * (y - x)).round() as i64);
                        *b = Value::from((y + t * (x - y)).round() as i64);
                    }
                    (ValueDomain::Float { .. }, Some(x), Some(y)) => {
                        *a = float_value(x + t * (y - x));
                        *b = float_value(y + t * (x - y));
                    }
                    _ => std::mem::swap(a, b),
                }
            }
        }
    }

    /// Whether the individual carries exactly one value per field.
    pub fn conforms(&self, individual: &Individual) -> bool {
        individual.genes.len() == self.fields.len()
    }

    /// JSON object sent to the target.
    pub fn to_payload(&self, individual: &Individual) -> Map<String, Value> {
        self.names
            .iter()
            .cloned()
            .zip(individual.genes.iter().cloned())
            .collect()
    }
}

/// Resolve `Auto` and check rule/domain compatibility.
fn resolve_mutation(spec: &FieldSpec) -> Result<FieldMutation, GrammarError> {
    let incompatible = || GrammarError::IncompatibleMutation {
        field: spec.name.clone(),
        rule: spec.mutation.name(),
        domain: spec.domain.kind(),
    };
    let invalid = |reason: &str| GrammarError::InvalidDomain {
        field: spec.name.clone(),
        reason: reason.to_string(),
    };

    let rule = match &spec.mutation {
        MutationRule::Auto => match &spec.domain {
            ValueDomain::Integer { min, max } => MutationRule::Perturb {
                delta: ((max.saturating_sub(*min)) as f64 * 0.1).max(1.0),
                clamp: true,
            },
            ValueDomain::Float { min, max } => MutationRule::Perturb {
                delta: (max - min) * 0.1,
                clamp: true,
            },
            ValueDomain::Boolean | ValueDomain::Categorical { .. } => MutationRule::PickOther,
            ValueDomain::StringList { .. } => MutationRule::ListEdit,
            ValueDomain::Text { .. } | ValueDomain::OneOf { .. } | ValueDomain::Template { .. } => {
                MutationRule::Resample
            }
        },
        other => other.clone(),
    };

    let resolved = match (rule, &spec.domain) {
        (MutationRule::Resample, _) => FieldMutation::Resample,
        (MutationRule::Perturb { delta, clamp }, domain) => {
            if !delta.is_finite() || delta < 0.0 {
                return Err(invalid("perturbation delta must be non-negative"));
            }
            match domain {
                ValueDomain::Integer { min, max } => FieldMutation::PerturbInteger {
                    delta: delta.round() as i64,
                    clamp,
                    min: *min,
                    max: *max,
                },
                ValueDomain::Float { min, max } => FieldMutation::PerturbFloat {
                    delta,
                    clamp,
                    min: *min,
                    max: *max,
                },
                _ => return Err(incompatible()),
            }
        }
        (MutationRule::PickOther, ValueDomain::Boolean) => FieldMutation::PickOther {
            values: vec![Value::Bool(false), Value::Bool(true)],
        },
        (MutationRule::PickOther, ValueDomain::Categorical { values }) => {
            FieldMutation::PickOther {
                values: values.clone(),
            }
        }
        (
            MutationRule::Append {
                min_chars,
                max_chars,
                max_len,
            },
            ValueDomain::Text { alphabet, .. },
        ) => {
            if min_chars > max_chars {
                return Err(invalid("append min_chars exceeds max_chars"));
            }
            FieldMutation::Append {
                min_chars,
                max_chars,
                max_len,
                alphabet: alphabet.chars().collect(),
            }
        }
        (
            MutationRule::ListEdit,
            ValueDomain::StringList {
                candidates,
                min_items,
                max_items,
            },
        ) => FieldMutation::ListEdit {
            candidates: candidates.clone(),
            min_items: *min_items,
            max_items: *max_items,
        },
        _ => return Err(incompatible()),
    };

    Ok(resolved)
}

/// Draw a value from a domain.
fn sample(domain: &ValueDomain, rng: &mut PayloadRng) -> Value {
    match domain {
        ValueDomain::Integer { min, max } => Value::from(rng.inner().gen_range(*min..=*max)),
        ValueDomain::Float { min, max } => {
            if min == max {
                float_value(*min)
            } else {
                float_value(rng.inner().gen_range(*min..=*max))
            }
        }
        ValueDomain::Boolean => Value::Bool(rng.inner().gen_bool(0.5)),
        ValueDomain::Categorical { values } => values[rng.index(values.len())].clone(),
        ValueDomain::Text {
            min_len,
            max_len,
            alphabet,
        } => {
            let chars: Vec<char> = alphabet.chars().collect();
            let len = rng.inner().gen_range(*min_len..=*max_len);
            Value::String(random_text(&chars, len, rng))
        }
        ValueDomain::StringList {
            candidates,
            min_items,
            max_items,
        } => {
            let upper = (*max_items).min(candidates.len());
            let count = rng.inner().gen_range((*min_items).min(upper)..=upper);
            let items = candidates
                .choose_multiple(rng.inner(), count)
                .map(|s| Value::String(s.clone()))
                .collect();
            Value::Array(items)
        }
        ValueDomain::OneOf { variants } => {
            let total: f64 = variants.iter().map(|v| v.weight).sum();
            let mut target = rng.unit() * total;
            for variant in variants {
                if target < variant.weight {
                    return sample(&variant.domain, rng);
                }
                target -= variant.weight;
            }
            // Rounding can leave `target` just past the last weight.
            let last = variants
                .iter()
                .rev()
                .find(|v| v.weight > 0.0)
                .unwrap_or(&variants[variants.len() - 1]);
            sample(&last.domain, rng)
        }
        ValueDomain::Template { parts } => {
            let mut text = String::new();
            for part in parts {
                match sample(part, rng) {
                    Value::String(s) => text.push_str(&s),
                    other => text.push_str(&other.to_string()),
                }
            }
            Value::String(text)
        }
    }
}

/// Produce a mutated value, `None` when the rule has nothing to change.
fn mutate_value(field: &FieldOps, current: &Value, rng: &mut PayloadRng) -> Option<Value> {
    match &field.mutation {
        FieldMutation::Resample => {
            if field.domain.is_singleton() {
                None
            } else {
                Some(sample(&field.domain, rng))
            }
        }
        FieldMutation::PerturbInteger {
            delta,
            clamp,
            min,
            max,
        } => {
            let Some(value) = current.as_i64() else {
                return Some(sample(&field.domain, rng));
            };
            if *delta == 0 || (*clamp && min == max) {
                return None;
            }
            let step = rng.inner().gen_range(1..=*delta);
            let step = if rng.inner().gen_bool(0.5) { step } else { -step };
            let mut next = value.saturating_add(step);
            if *clamp {
                next = next.clamp(*min, *max);
            }
            Some(Value::from(next))
        }
        FieldMutation::PerturbFloat {
            delta,
            clamp,
            min,
            max,
        } => {
            let Some(value) = current.as_f64() else {
                return Some(sample(&field.domain, rng));
            };
            if *delta == 0.0 || (*clamp && min == max) {
                return None;
            }
            let noise: f64 = rng.inner().sample(rand_distr::StandardNormal);
            let mut next = value + noise * delta;
            if *clamp {
                next = next.clamp(*min, *max);
            }
            Some(float_value(next))
        }
        FieldMutation::PickOther { values } => {
            let others: Vec<&Value> = values.iter().filter(|v| *v != current).collect();
            others.choose(rng.inner()).map(|v| (*v).clone())
        }
        FieldMutation::Append {
            min_chars,
            max_chars,
            max_len,
            alphabet,
        } => {
            let Some(text) = current.as_str() else {
                return Some(sample(&field.domain, rng));
            };
            let room = max_len.saturating_sub(text.chars().count());
            if room == 0 || alphabet.is_empty() {
                return None;
            }
            let count = rng.inner().gen_range(*min_chars..=*max_chars).min(room);
            let mut next = text.to_string();
            next.push_str(&random_text(alphabet, count, rng));
            Some(Value::String(next))
        }
        FieldMutation::ListEdit {
            candidates,
            min_items,
            max_items,
        } => {
            let Some(items) = current.as_array() else {
                return Some(sample(&field.domain, rng));
            };
            let mut items = items.clone();
            let unused: Vec<&String> = candidates
                .iter()
                .filter(|c| !items.iter().any(|item| item.as_str() == Some(c.as_str())))
                .collect();

            let mut edits = Vec::with_capacity(3);
            if items.len() < *max_items && !unused.is_empty() {
                edits.push(ListEdit::Add);
            }
            if items.len() > *min_items {
                edits.push(ListEdit::Remove);
            }
            if !items.is_empty() && !unused.is_empty() {
                edits.push(ListEdit::Replace);
            }

            match edits.choose(rng.inner())? {
                ListEdit::Add => {
                    let pick = unused[rng.index(unused.len())].clone();
                    items.push(Value::String(pick));
                }
                ListEdit::Remove => {
                    let at = rng.index(items.len());
                    items.remove(at);
                }
                ListEdit::Replace => {
                    let pick = unused[rng.index(unused.len())].clone();
                    let at = rng.index(items.len());
                    items[at] = Value::String(pick);
                }
            }
            Some(Value::Array(items))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ListEdit {
    Add,
    Remove,
    Replace,
}

fn random_text(alphabet: &[char], len: usize, rng: &mut PayloadRng) -> String {
    if alphabet.is_empty() {
        return String::new();
    }
    (0..len).map(|_| alphabet[rng.index(alphabet.len())]).collect()
}

fn float_value(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}
