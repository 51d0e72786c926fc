//! Criterion benchmarks for full tuning runs on the simulated backend.

use criterion::{criterion_group, criterion_main, Criterion};
use ktuner::{
    DeviceProperties, KernelArg, KernelSource, ParameterSpace, ProblemSize, ResultCache,
    SearchSpace, SimulatedBackend, StrategyConfig, Tuner, TuningOptions, TuningProblem,
};

const KERNEL: &str = "__global__ void vector_add(float *c, const float *a, const float *b, int n) {}";

fn tuner(strategy: StrategyConfig) -> Tuner {
    let params = ParameterSpace::new()
        .with("block_size_x", [32, 64, 128, 256, 512, 1024])
        .unwrap()
        .with("work_per_thread", [1, 2, 4, 8])
        .unwrap();
    let problem = TuningProblem::new(
        KernelSource::from_string("vector_add", KERNEL).unwrap(),
        ProblemSize::d1(1 << 20).unwrap(),
        SearchSpace::new(params, vec![]).unwrap(),
    )
    .with_args(vec![KernelArg::buffer_f32(1 << 20); 3]);
    let options = TuningOptions {
        iterations: 3,
        strategy,
        ..TuningOptions::default()
    };
    Tuner::new(problem, options)
}

fn bench_strategies(c: &mut Criterion) {
    for strategy in [
        StrategyConfig::BruteForce,
        StrategyConfig::RandomSample {
            fraction: Some(0.5),
            max_fevals: None,
            seed: 1,
        },
        StrategyConfig::Mls {
            restarts: 4,
            seed: 1,
        },
    ] {
        let name = format!("tune_24_configs_{}", strategy.name());
        let tuner = tuner(strategy);
        c.bench_function(&name, |b| {
            b.iter(|| {
                let mut backend = SimulatedBackend::new(DeviceProperties::a100());
                tuner.run(&mut backend, ResultCache::in_memory()).unwrap()
            })
        });
    }
}

fn bench_cached_rerun(c: &mut Criterion) {
    let tuner = tuner(StrategyConfig::BruteForce);
    let mut cache = ResultCache::in_memory();
    let mut backend = SimulatedBackend::new(DeviceProperties::a100());
    tuner.run(&mut backend, &mut cache).unwrap();

    c.bench_function("tune_24_configs_all_cached", |b| {
        b.iter(|| tuner.run(&mut backend, &mut cache).unwrap())
    });
}

criterion_group!(benches, bench_strategies, bench_cached_rerun);
criterion_main!(benches);
