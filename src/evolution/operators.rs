//! Selection, crossover and mutation strategies.
//!
//! Each operator family is a trait with concrete implementations chosen from
//! the tagged configuration enums by the `*_operator` builders.

use std::cmp::Ordering;

use serde_json::Value;

use crate::schema::{CrossoverMethod, MutationMethod, SelectionMethod};

use super::genome::{Individual, PayloadRng};
use super::grammar::Grammar;

/// Picks a parent from an evaluated population.
pub trait Selection: Send + Sync {
    /// Index of the selected individual. `population` must be non-empty.
    fn select(&self, population: &[Individual], rng: &mut PayloadRng) -> usize;

    /// `count` independent draws from the same population.
    fn select_many(&self, population: &[Individual], count: usize, rng: &mut PayloadRng) -> Vec<usize> {
        (0..count).map(|_| self.select(population, rng)).collect()
    }
}

/// Recombines two parents in place.
pub trait Crossover: Send + Sync {
    /// Returns whether either child's genes changed. Changed children have
    /// their cached evaluation dropped.
    fn crossover(
        &self,
        grammar: &Grammar,
        a: &mut Individual,
        b: &mut Individual,
        rng: &mut PayloadRng,
    ) -> bool;
}

/// Mutates an individual in place.
pub trait Mutation: Send + Sync {
    /// Returns whether the genes changed.
    fn mutate(&self, grammar: &Grammar, individual: &mut Individual, rng: &mut PayloadRng) -> bool;
}

/// Build the selection strategy for a method.
pub fn selection_operator(method: &SelectionMethod) -> Box<dyn Selection> {
    match *method {
        SelectionMethod::Tournament { size } => Box::new(Tournament { size }),
        SelectionMethod::RankBased { pressure } => Box::new(RankBased { pressure }),
        SelectionMethod::RouletteWheel => Box::new(RouletteWheel),
    }
}

/// Build the crossover strategy for a method.
pub fn crossover_operator(method: &CrossoverMethod) -> Box<dyn Crossover> {
    match method {
        CrossoverMethod::Uniform => Box::new(UniformCrossover),
        CrossoverMethod::Segment => Box::new(SegmentCrossover),
    }
}

/// Build the mutation strategy for a method.
pub fn mutation_operator(method: &MutationMethod) -> Box<dyn Mutation> {
    match *method {
        MutationMethod::RandomFields { max_fields } => Box::new(RandomFieldMutation { max_fields }),
    }
}

fn by_score(a: &Individual, b: &Individual) -> Ordering {
    a.score().total_cmp(&b.score())
}

/// Best of `size` uniformly drawn contestants (with replacement).
#[derive(Debug, Clone, Copy)]
pub struct Tournament {
    pub size: usize,
}

impl Selection for Tournament {
    fn select(&self, population: &[Individual], rng: &mut PayloadRng) -> usize {
        let mut best = rng.index(population.len());
        for _ in 1..self.size.max(1) {
            let idx = rng.index(population.len());
            if by_score(&population[idx], &population[best]) == Ordering::Greater {
                best = idx;
            }
        }
        best
    }
}

/// Fitness-proportionate selection. Negative fitness counts as zero; an
/// all-zero population is sampled uniformly.
#[derive(Debug, Clone, Copy)]
pub struct RouletteWheel;

impl Selection for RouletteWheel {
    fn select(&self, population: &[Individual], rng: &mut PayloadRng) -> usize {
        let weight = |c: &Individual| c.fitness.unwrap_or(0.0).max(0.0) as f64;
        let total: f64 = population.iter().map(weight).sum();
        if total <= 0.0 || !total.is_finite() {
            return rng.index(population.len());
        }

        let target = rng.unit() * total;
        let mut cumulative = 0.0;
        let mut last_positive = 0;
        for (i, candidate) in population.iter().enumerate() {
            let w = weight(candidate);
            if w > 0.0 {
                last_positive = i;
            }
            cumulative += w;
            if target < cumulative {
                return i;
            }
        }
        last_positive
    }
}

/// Linear ranking. The best individual expects `pressure` copies, the worst
/// `2 - pressure`.
#[derive(Debug, Clone, Copy)]
pub struct RankBased {
    pub pressure: f32,
}

impl RankBased {
    /// Population indices worst first, with the cumulative selection
    /// probability at each rank.
    fn ranking(&self, population: &[Individual]) -> (Vec<usize>, Vec<f64>) {
        let n = population.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| by_score(&population[a], &population[b]));

        let s = self.pressure.clamp(1.0, 2.0) as f64;
        let n_f = n as f64;
        let weight = |rank: usize| (2.0 - s) / n_f + 2.0 * (s - 1.0) * rank as f64 / (n_f * (n_f - 1.0));

        let cumulative = (0..n)
            .scan(0.0, |acc, rank| {
                *acc += weight(rank);
                Some(*acc)
            })
            .collect();
        (order, cumulative)
    }

    fn draw(order: &[usize], cumulative: &[f64], rng: &mut PayloadRng) -> usize {
        let target = rng.unit();
        let rank = cumulative.partition_point(|&c| c <= target);
        order[rank.min(order.len() - 1)]
    }
}

impl Selection for RankBased {
    fn select(&self, population: &[Individual], rng: &mut PayloadRng) -> usize {
        self.select_many(population, 1, rng)[0]
    }

    /// Sorts once for all draws.
    fn select_many(&self, population: &[Individual], count: usize, rng: &mut PayloadRng) -> Vec<usize> {
        if population.len() == 1 {
            return vec![0; count];
        }
        let (order, cumulative) = self.ranking(population);
        (0..count).map(|_| Self::draw(&order, &cumulative, rng)).collect()
    }
}

/// Each field independently crosses with probability one half.
#[derive(Debug, Clone, Copy)]
pub struct UniformCrossover;

impl Crossover for UniformCrossover {
    fn crossover(
        &self,
        grammar: &Grammar,
        a: &mut Individual,
        b: &mut Individual,
        rng: &mut PayloadRng,
    ) -> bool {
        let fields: Vec<usize> = (0..grammar.len()).filter(|_| rng.chance(0.5)).collect();
        cross_fields(grammar, &fields, a, b, rng)
    }
}

/// A contiguous run of fields crosses between the parents.
#[derive(Debug, Clone, Copy)]
pub struct SegmentCrossover;

impl Crossover for SegmentCrossover {
    fn crossover(
        &self,
        grammar: &Grammar,
        a: &mut Individual,
        b: &mut Individual,
        rng: &mut PayloadRng,
    ) -> bool {
        let len = grammar.len();
        if len == 0 {
            return false;
        }
        let start = rng.index(len);
        let end = start + 1 + rng.index(len - start);
        let fields: Vec<usize> = (start..end).collect();
        cross_fields(grammar, &fields, a, b, rng)
    }
}

fn cross_fields(
    grammar: &Grammar,
    fields: &[usize],
    a: &mut Individual,
    b: &mut Individual,
    rng: &mut PayloadRng,
) -> bool {
    let mut a_changed = false;
    let mut b_changed = false;

    for &i in fields {
        let (old_a, old_b): (Value, Value) = (a.genes[i].clone(), b.genes[i].clone());
        grammar.cross_field(i, &mut a.genes[i], &mut b.genes[i], rng);
        a_changed |= a.genes[i] != old_a;
        b_changed |= b.genes[i] != old_b;
    }

    if a_changed {
        a.invalidate();
    }
    if b_changed {
        b.invalidate();
    }
    a_changed || b_changed
}

/// Mutate between one and `max_fields` distinct fields.
#[derive(Debug, Clone, Copy)]
pub struct RandomFieldMutation {
    pub max_fields: usize,
}

impl Mutation for RandomFieldMutation {
    fn mutate(&self, grammar: &Grammar, individual: &mut Individual, rng: &mut PayloadRng) -> bool {
        let len = grammar.len();
        let upper = self.max_fields.clamp(1, len.max(1));
        let count = 1 + rng.index(upper);

        let fields = rand::seq::index::sample(rng.inner(), len, count.min(len));
        let mut changed = false;
        for index in fields.into_vec() {
            changed |= grammar.mutate_index(individual, index, rng);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSpec, ValueDomain};

    fn scored(fitness: &[f32]) -> Vec<Individual> {
        fitness
            .iter()
            .enumerate()
            .map(|(i, &f)| {
                let mut individual = Individual::new(i as u64, vec![Value::from(i)], 0);
                individual.fitness = Some(f);
                individual
            })
            .collect()
    }

    fn counts(selection: &dyn Selection, population: &[Individual], draws: usize) -> Vec<usize> {
        let mut rng = PayloadRng::new(17);
        let mut counts = vec![0; population.len()];
        for _ in 0..draws {
            counts[selection.select(population, &mut rng)] += 1;
        }
        counts
    }

    fn grammar() -> Grammar {
        Grammar::new(vec![
            FieldSpec::new("a", ValueDomain::Integer { min: 0, max: 1000 }),
            FieldSpec::new("b", ValueDomain::Integer { min: 0, max: 1000 }),
            FieldSpec::new("c", ValueDomain::Boolean),
            FieldSpec::new("d", ValueDomain::Integer { min: 0, max: 1000 }),
        ])
        .unwrap()
    }

    #[test]
    fn test_tournament_favors_fitter() {
        let population = scored(&[0.1, 0.2, 0.9]);
        let counts = counts(&Tournament { size: 3 }, &population, 3000);
        assert!(counts[2] > counts[1]);
        assert!(counts[1] > counts[0]);
    }

    #[test]
    fn test_roulette_never_starves_positive_fitness() {
        let population = scored(&[0.0, 0.01, 1.0]);
        let counts = counts(&RouletteWheel, &population, 5000);
        assert_eq!(counts[0], 0);
        assert!(counts[1] > 0);
        assert!(counts[2] > counts[1]);
    }

    #[test]
    fn test_roulette_all_zero_is_uniform() {
        let population = scored(&[0.0, 0.0, 0.0]);
        let counts = counts(&RouletteWheel, &population, 3000);
        assert!(counts.iter().all(|&c| c > 800));
    }

    #[test]
    fn test_rank_based_reaches_every_rank() {
        let population = scored(&[0.5, 0.1, 0.3]);
        let counts = counts(&RankBased { pressure: 1.8 }, &population, 6000);
        assert!(counts.iter().all(|&c| c > 0));
        assert!(counts[0] > counts[2]);
        assert!(counts[2] > counts[1]);
    }

    #[test]
    fn test_rank_based_batch_matches_single_draws() {
        let population = scored(&[0.4, 0.9, 0.0, 0.7, 0.2, 0.7]);
        let selection = RankBased { pressure: 1.5 };

        let mut batch_rng = PayloadRng::new(23);
        let batch = selection.select_many(&population, 200, &mut batch_rng);

        let mut single_rng = PayloadRng::new(23);
        let single: Vec<usize> = (0..200)
            .map(|_| selection.select(&population, &mut single_rng))
            .collect();

        assert_eq!(batch, single);
        assert!((0..population.len()).all(|i| batch.contains(&i)));
        assert_eq!(selection.select_many(&scored(&[0.3]), 4, &mut batch_rng), vec![0; 4]);
    }

    #[test]
    fn test_segment_crossover_swaps_contiguous_fields() {
        let grammar = grammar();
        let mut rng = PayloadRng::new(4);
        let parent_a = Individual::new(
            0,
            vec![Value::from(1), Value::from(2), Value::Bool(true), Value::from(4)],
            0,
        );
        let parent_b = Individual::new(
            1,
            vec![Value::from(10), Value::from(20), Value::Bool(false), Value::from(40)],
            0,
        );

        for _ in 0..20 {
            let mut a = parent_a.clone();
            let mut b = parent_b.clone();
            a.fitness = Some(0.5);
            b.fitness = Some(0.5);
            assert!(SegmentCrossover.crossover(&grammar, &mut a, &mut b, &mut rng));
            assert!(a.fitness.is_none());

            let swapped: Vec<bool> = (0..4).map(|i| a.genes[i] == parent_b.genes[i]).collect();
            let first = swapped.iter().position(|&s| s).unwrap();
            let last = swapped.iter().rposition(|&s| s).unwrap();
            assert!(swapped[first..=last].iter().all(|&s| s));
            for i in 0..4 {
                let pair = [a.genes[i].clone(), b.genes[i].clone()];
                assert!(pair.contains(&parent_a.genes[i]) && pair.contains(&parent_b.genes[i]));
            }
        }
    }

    #[test]
    fn test_crossover_of_identical_parents_keeps_fitness() {
        let grammar = grammar();
        let mut rng = PayloadRng::new(8);
        let mut a = Individual::new(0, vec![Value::from(1), Value::from(2), Value::Bool(true), Value::from(3)], 0);
        a.fitness = Some(0.7);
        let mut b = a.clone();

        assert!(!UniformCrossover.crossover(&grammar, &mut a, &mut b, &mut rng));
        assert_eq!(a.fitness, Some(0.7));
        assert_eq!(b.fitness, Some(0.7));
    }

    #[test]
    fn test_random_field_mutation_bounds() {
        let grammar = grammar();
        let mut rng = PayloadRng::new(21);
        let original = grammar.generate_random(0, 0, &mut rng);
        let mutation = RandomFieldMutation { max_fields: 2 };

        for _ in 0..50 {
            let mut individual = original.clone();
            mutation.mutate(&grammar, &mut individual, &mut rng);
            let differing = (0..4).filter(|&i| individual.genes[i] != original.genes[i]).count();
            assert!(differing <= 2);
            assert_eq!(individual.genes.len(), 4);
        }
    }
}
