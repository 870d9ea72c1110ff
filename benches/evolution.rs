//! Benchmarks for the evolution engine against an in-process target.

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use payload_evolver::{
    evolution::{EvolutionEngine, Grammar, HttpTarget, PayloadRng, TargetResponse, TransportError},
    schema::{PopulationConfig, RunConfig},
};

/// Instant answers keyed on the payload so fitness varies.
struct StubTarget;

impl HttpTarget for StubTarget {
    fn send(&self, body: &[u8]) -> Result<TargetResponse, TransportError> {
        let status = match body.len() % 4 {
            0 => 500,
            1 => 422,
            2 => 400,
            _ => 201,
        };
        Ok(TargetResponse {
            status,
            body: String::new(),
            elapsed: Duration::from_micros(50),
        })
    }
}

fn bench_generation_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("generation_step");

    for size in [20, 50, 100, 200] {
        let config = RunConfig {
            population: PopulationConfig {
                size,
                max_generations: usize::MAX,
                ..Default::default()
            },
            random_seed: Some(1),
            ..RunConfig::user_api_example()
        };

        let mut engine = EvolutionEngine::new(config, Arc::new(StubTarget)).unwrap();
        engine.initialize().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                engine.step().unwrap();
                black_box(engine.population().len());
            });
        });
    }

    group.finish();
}

fn bench_generate_random(c: &mut Criterion) {
    let grammar = Grammar::new(RunConfig::user_api_example().grammar).unwrap();
    let mut rng = PayloadRng::new(7);

    c.bench_function("generate_random", |b| {
        b.iter(|| black_box(grammar.generate_random(0, 0, &mut rng)));
    });
}

criterion_group!(benches, bench_generation_step, bench_generate_random);
criterion_main!(benches);
