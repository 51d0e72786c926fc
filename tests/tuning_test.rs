//! Integration tests: full tuning runs on the simulated and host backends.

use ktuner::{
    ceil_div, tune_devices, Backend, Budget, CancelToken, DeviceProperties, HostBackend,
    KernelArg, KernelSource, Metrics, Objective, ParameterSpace, ProblemSize, ResultCache,
    SearchSpace, SimulatedBackend, StopReason, StrategyConfig, Tuner, TuningJob, TuningOptions,
    TuningProblem,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

const VECTOR_ADD: &str = r#"
__global__ void vector_add(float *c, const float *a, const float *b, int n) {
    int i = blockIdx.x * block_size_x + threadIdx.x;
    if (i < n) {
        c[i] = a[i] + b[i];
    }
}
"#;

const N: u64 = 1_000_000;

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ktuner-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn args() -> Vec<KernelArg> {
    vec![
        KernelArg::buffer_f32(N),
        KernelArg::buffer_f32(N),
        KernelArg::buffer_f32(N),
        KernelArg::Int { value: N as i64 },
    ]
}

fn problem(block_sizes: &[i64]) -> TuningProblem {
    let params = ParameterSpace::new()
        .with("block_size_x", block_sizes.iter().copied())
        .unwrap();
    let space = SearchSpace::new(params, vec![]).unwrap();
    TuningProblem::new(
        KernelSource::from_string("vector_add", VECTOR_ADD).unwrap(),
        ProblemSize::d1(N).unwrap(),
        space,
    )
    .with_args(args())
}

fn tuner(block_sizes: &[i64]) -> Tuner {
    Tuner::new(problem(block_sizes), TuningOptions::default())
}

fn a100() -> SimulatedBackend {
    SimulatedBackend::new(DeviceProperties::a100()).with_seed(7)
}

#[test]
fn ceiling_division_for_grid_sizes() {
    assert_eq!(ceil_div(1_000_000, 256), 3907);
    assert_eq!(ceil_div(1024, 256), 4);
    assert_eq!(ceil_div(1, 1024), 1);

    let report = tuner(&[256]).run(&mut a100(), ResultCache::in_memory()).unwrap();
    let m = report.results[0].measurement().unwrap();
    assert_eq!(m.geometry.grid, [3907, 1, 1]);
    assert_eq!(m.geometry.block, [256, 1, 1]);
}

#[test]
fn measurement_records_every_sample() {
    let report = tuner(&[128]).run(&mut a100(), ResultCache::in_memory()).unwrap();
    let m = report.results[0].measurement().unwrap();
    assert_eq!(m.times_ms.len(), 7);
    assert!(m.min_ms <= m.time_ms * (1.0 + 1e-12));
    assert!(m.time_ms <= m.max_ms * (1.0 + 1e-12));
    assert!(m.std_ms >= 0.0);
}

#[test]
fn infeasible_configurations_never_reach_the_backend() {
    let mut backend = a100();
    let report = tuner(&[256, 2048, 1024])
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();

    assert_eq!(report.results.len(), 3);
    let skipped: Vec<_> = report.skipped().collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].config.get_i64("block_size_x"), Some(2048));
    assert_eq!(
        skipped[0].skip_reason().unwrap().category(),
        "too-many-threads"
    );
    assert_eq!(backend.compile_count(), 2);
    assert_eq!(backend.launch_count(), 2 * 7);
    assert_eq!(report.stats.skipped.get("too-many-threads"), Some(&1));
}

#[test]
fn only_infeasible_configurations_means_zero_compiles() {
    let mut backend = a100();
    let report = tuner(&[2048, 4096])
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();
    assert_eq!(backend.compile_count(), 0);
    assert!(report.best().is_none());
    assert_eq!(report.stats.total_skipped(), 2);
}

#[test]
fn exhaustive_search_ignores_value_order() {
    let run = |values: &[i64]| {
        let mut backend = a100();
        let report = tuner(values)
            .run(&mut backend, ResultCache::in_memory())
            .unwrap();
        let keys: Vec<String> = report.results.iter().map(|r| r.config.key()).collect();
        (keys, backend.compile_count())
    };

    let (forward, compiles_a) = run(&[64, 128, 256, 512, 1024]);
    let (shuffled, compiles_b) = run(&[512, 64, 1024, 256, 128]);

    let a: HashSet<_> = forward.iter().cloned().collect();
    let b: HashSet<_> = shuffled.iter().cloned().collect();
    assert_eq!(a, b);
    assert_eq!(a.len(), forward.len(), "each configuration evaluated once");
    assert_eq!(b.len(), shuffled.len());
    assert_eq!(compiles_a, 5);
    assert_eq!(compiles_b, 5);
}

#[test]
fn cache_round_trip_skips_the_backend() {
    let dir = temp_dir("roundtrip");
    let path = dir.join("cache.jsonl");
    let tuner = tuner(&[64, 128, 256, 2048]);

    let mut first = a100();
    let mut cache = ResultCache::open(&path).unwrap();
    let report1 = tuner.run(&mut first, &mut cache).unwrap();
    drop(cache);
    assert!(first.compile_count() > 0);
    assert_eq!(report1.stats.evaluated, 4);

    let mut second = a100();
    let mut cache = ResultCache::open(&path).unwrap();
    assert_eq!(cache.len(), 4);
    let report2 = tuner.run(&mut second, &mut cache).unwrap();

    assert_eq!(second.compile_count(), 0);
    assert_eq!(second.launch_count(), 0);
    assert_eq!(report2.stats.evaluated, 0);
    assert_eq!(report2.stats.cache_hits, 4);
    for (a, b) in report1.results.iter().zip(&report2.results) {
        assert_eq!(a.config, b.config);
        assert_eq!(a.is_skipped(), b.is_skipped());
        if let (Some(ta), Some(tb)) = (a.time_ms(), b.time_ms()) {
            assert!((ta - tb).abs() <= ta * 1e-12);
        }
    }
    // skips are reused too
    assert_eq!(report2.stats.total_skipped(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cache_entries_do_not_leak_across_devices() {
    let dir = temp_dir("devices");
    let path = dir.join("cache.jsonl");
    let tuner = tuner(&[128, 256]);

    let mut cache = ResultCache::open(&path).unwrap();
    tuner.run(&mut a100(), &mut cache).unwrap();

    let mut other = SimulatedBackend::new(DeviceProperties::rtx3070());
    let report = tuner.run(&mut other, &mut cache).unwrap();
    assert_eq!(report.stats.cache_hits, 0);
    assert_eq!(other.compile_count(), 2);
    assert_eq!(cache.problems().len(), 2);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn string_values_with_commas_get_their_own_cache_entries() {
    let dir = temp_dir("commas");
    let path = dir.join("cache.jsonl");
    let params = ParameterSpace::new()
        .with("a", ["x", "x,y"])
        .unwrap()
        .with("b", ["y,z", "z"])
        .unwrap();
    let problem = TuningProblem::new(
        KernelSource::from_string("vector_add", VECTOR_ADD).unwrap(),
        ProblemSize::d1(N).unwrap(),
        SearchSpace::new(params, vec![]).unwrap(),
    )
    .with_args(args());
    let tuner = Tuner::new(problem, TuningOptions::default());

    let mut cache = ResultCache::open(&path).unwrap();
    let report = tuner.run(&mut a100(), &mut cache).unwrap();
    drop(cache);
    assert_eq!(report.results.len(), 4);
    assert_eq!(report.stats.evaluated, 4);
    assert_eq!(report.stats.cache_hits, 0);
    let shown: HashSet<String> = report.results.iter().map(|r| r.config.to_string()).collect();
    assert_eq!(shown.len(), 4);

    let mut cache = ResultCache::open(&path).unwrap();
    assert_eq!(cache.len(), 4);
    let again = tuner.run(&mut a100(), &mut cache).unwrap();
    assert_eq!(again.stats.cache_hits, 4);
    for (first, second) in report.results.iter().zip(&again.results) {
        assert_eq!(first.config, second.config);
        let (ta, tb) = (first.time_ms().unwrap(), second.time_ms().unwrap());
        assert!((ta - tb).abs() <= ta * 1e-12);
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cache_hits_use_the_current_metrics() {
    let mut cache = ResultCache::in_memory();
    let plain = tuner(&[128, 256]).run(&mut a100(), &mut cache).unwrap();
    assert!(plain.results.iter().all(|r| r.metric("gbs").is_none()));

    let mut rerun = |expr: &str| {
        let metrics = Metrics::new().expr("gbs", expr).unwrap();
        let options = TuningOptions {
            objective: Objective::maximize("gbs"),
            ..TuningOptions::default()
        };
        Tuner::new(problem(&[128, 256]).with_metrics(metrics), options)
            .run(&mut a100(), &mut cache)
            .unwrap()
    };

    let report = rerun("12e6 / (time / 1e3) / 1e9");
    assert_eq!(report.stats.cache_hits, 2);
    assert_eq!(report.stats.evaluated, 0);
    for r in &report.results {
        let expected = 12e6 / (r.time_ms().unwrap() / 1e3) / 1e9;
        let gbs = r.metric("gbs").unwrap();
        assert!((gbs - expected).abs() <= expected * 1e-12);
    }
    assert!(report.best().is_some());

    // a changed expression is not answered with the old value
    let doubled = rerun("2 * 12e6 / (time / 1e3) / 1e9");
    for (a, b) in report.results.iter().zip(&doubled.results) {
        let (a, b) = (a.metric("gbs").unwrap(), b.metric("gbs").unwrap());
        assert!((b - 2.0 * a).abs() <= b * 1e-12);
    }
}

#[test]
fn brute_force_streams_large_spaces() {
    let mut params = ParameterSpace::new().with("block_size_x", [128]).unwrap();
    for i in 0..9 {
        params = params.with(&format!("p{}", i), 0..10i64).unwrap();
    }
    let space = SearchSpace::new(params, vec![]).unwrap();
    assert_eq!(space.cartesian_size(), 1_000_000_000);
    let problem = TuningProblem::new(
        KernelSource::from_string("vector_add", VECTOR_ADD).unwrap(),
        ProblemSize::d1(N).unwrap(),
        space,
    )
    .with_args(args());
    let options = TuningOptions {
        budget: Budget {
            max_fevals: Some(3),
            time_limit: None,
        },
        ..TuningOptions::default()
    };

    let report = Tuner::new(problem, options)
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap();
    assert_eq!(report.stats.stop_reason, StopReason::MaxFevals);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.stats.valid_configurations, 3);
    assert_eq!(report.results[2].config.get_i64("p8"), Some(2));
}

#[test]
fn metrics_compose_in_declaration_order() {
    let metrics = Metrics::new()
        .expr("gbs", "12e6 / (time / 1e3) / 1e9")
        .unwrap()
        .expr("gbs_x2", "gbs * 2")
        .unwrap()
        .closure("blocks_per_gbs", |s| {
            s.get("blocks").unwrap_or(0.0) / s.get("gbs").unwrap_or(f64::NAN)
        })
        .unwrap();
    let problem = problem(&[128, 256]).with_metrics(metrics);
    let report = Tuner::new(problem, TuningOptions::default())
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap();

    for result in &report.results {
        let m = result.measurement().unwrap();
        let names: Vec<&str> = m.metrics.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["gbs", "gbs_x2", "blocks_per_gbs"]);

        let gbs = result.metric("gbs").unwrap();
        assert!(gbs > 0.0);
        assert_eq!(result.metric("gbs_x2"), Some(gbs * 2.0));
        let blocks = m.geometry.blocks() as f64;
        assert_eq!(result.metric("blocks_per_gbs"), Some(blocks / gbs));
    }
}

#[test]
fn metric_forward_reference_is_a_configuration_error() {
    let metrics = Metrics::new()
        .expr("a", "b * 2")
        .unwrap()
        .expr("b", "time")
        .unwrap();
    let problem = problem(&[128]).with_metrics(metrics);
    let mut backend = a100();
    let err = Tuner::new(problem, TuningOptions::default())
        .run(&mut backend, ResultCache::in_memory())
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(backend.compile_count(), 0);
}

#[test]
fn undeclared_objective_is_rejected() {
    let options = TuningOptions {
        objective: Objective::maximize("gflops"),
        ..TuningOptions::default()
    };
    let err = Tuner::new(problem(&[128]), options)
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap_err();
    assert!(err.is_configuration());
}

#[test]
fn maximized_metric_picks_the_highest() {
    let metrics = Metrics::new()
        .expr("gbs", "12e6 / (time / 1e3) / 1e9")
        .unwrap();
    let options = TuningOptions {
        objective: Objective::maximize("gbs"),
        ..TuningOptions::default()
    };
    let report = Tuner::new(problem(&[32, 128, 512, 1024]).with_metrics(metrics), options)
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap();

    let best = report.best().unwrap().metric("gbs").unwrap();
    for r in &report.results {
        assert!(r.metric("gbs").unwrap() <= best);
    }
}

#[test]
fn compile_errors_are_recorded_and_the_run_continues() {
    let mut backend = a100().with_compile_failure(|c| {
        (c.get_i64("block_size_x") == Some(128)).then(|| "ptxas: out of registers".to_string())
    });
    let report = tuner(&[64, 128, 256])
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.stats.stop_reason, StopReason::Completed);
    let failed = report
        .results
        .iter()
        .find(|r| r.config.get_i64("block_size_x") == Some(128))
        .unwrap();
    let reason = failed.skip_reason().unwrap();
    assert_eq!(reason.category(), "compile-error");
    assert!(reason.to_string().contains("out of registers"));
    assert_eq!(report.ranked().len(), 2);
}

#[test]
fn launch_errors_are_recorded() {
    let mut backend = a100().with_launch_failure(|c| {
        (c.get_i64("block_size_x") == Some(64)).then(|| "illegal address".to_string())
    });
    let report = tuner(&[64, 256])
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();
    assert_eq!(report.stats.skipped.get("launch-error"), Some(&1));
    assert_eq!(
        report.best().unwrap().config.get_i64("block_size_x"),
        Some(256)
    );
}

#[test]
fn cancellation_stops_at_a_configuration_boundary() {
    let dir = temp_dir("cancel");
    let path = dir.join("cache.jsonl");
    let token = CancelToken::new();
    let tuner = Tuner::new(problem(&[64, 128, 256, 512]), TuningOptions::default())
        .with_cancel_token(token.clone());

    let trigger = token.clone();
    let mut backend = HostBackend::new(move |_, _, _| {
        trigger.cancel();
        Ok(())
    });
    let mut cache = ResultCache::open(&path).unwrap();
    let report = tuner.run(&mut backend, &mut cache).unwrap();
    drop(cache);

    assert!(token.is_cancelled());
    assert_eq!(report.stats.stop_reason, StopReason::Cancelled);
    // the in-flight configuration finished all its iterations
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].measurement().unwrap().times_ms.len(), 7);

    let reopened = ResultCache::open(&path).unwrap();
    assert_eq!(reopened.len(), 1);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cancelled_before_start_evaluates_nothing() {
    let token = CancelToken::new();
    token.cancel();
    let mut backend = a100();
    let report = tuner(&[64, 128])
        .with_cancel_token(token)
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();
    assert!(report.results.is_empty());
    assert_eq!(report.stats.stop_reason, StopReason::Cancelled);
    assert_eq!(backend.compile_count(), 0);
}

#[test]
fn evaluation_budget_is_respected() {
    let options = TuningOptions {
        budget: Budget {
            max_fevals: Some(3),
            time_limit: None,
        },
        ..TuningOptions::default()
    };
    let mut backend = a100();
    let report = Tuner::new(problem(&[32, 64, 128, 256, 512, 1024]), options)
        .run(&mut backend, ResultCache::in_memory())
        .unwrap();
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.stats.evaluated, 3);
    assert_eq!(report.stats.stop_reason, StopReason::MaxFevals);
    assert_eq!(backend.compile_count(), 3);
}

#[test]
fn zero_time_limit_stops_immediately() {
    let options = TuningOptions {
        budget: Budget {
            max_fevals: None,
            time_limit: Some(Duration::ZERO),
        },
        ..TuningOptions::default()
    };
    let report = Tuner::new(problem(&[64, 128]), options)
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap();
    assert!(report.results.is_empty());
    assert_eq!(report.stats.stop_reason, StopReason::TimeLimit);
}

fn seeded_run(strategy: StrategyConfig) -> Vec<(String, f64)> {
    let params = ParameterSpace::new()
        .with("block_size_x", [32, 64, 128, 256, 512, 1024])
        .unwrap()
        .with("work_per_thread", [1, 2, 4, 8])
        .unwrap();
    let space = SearchSpace::new(params, vec![]).unwrap();
    let problem = TuningProblem::new(
        KernelSource::from_string("vector_add", VECTOR_ADD).unwrap(),
        ProblemSize::d1(N).unwrap(),
        space,
    )
    .with_args(args());
    let options = TuningOptions {
        strategy,
        ..TuningOptions::default()
    };
    let report = Tuner::new(problem, options)
        .run(&mut a100(), ResultCache::in_memory())
        .unwrap();
    report
        .results
        .iter()
        .map(|r| (r.config.key(), r.time_ms().unwrap_or(f64::NAN)))
        .collect()
}

#[test]
fn seeded_strategies_are_reproducible() {
    let strategies = [
        StrategyConfig::RandomSample {
            fraction: Some(0.5),
            max_fevals: None,
            seed: 42,
        },
        StrategyConfig::GeneticAlgorithm {
            popsize: 6,
            generations: 4,
            mutation_chance: 5,
            seed: 42,
        },
        StrategyConfig::SimulatedAnnealing {
            t0: 1.0,
            t_min: 0.01,
            alpha: 0.9,
            seed: 42,
        },
        StrategyConfig::Mls {
            restarts: 3,
            seed: 42,
        },
    ];
    for strategy in strategies {
        let a = seeded_run(strategy.clone());
        let b = seeded_run(strategy.clone());
        assert!(!a.is_empty(), "{} evaluated nothing", strategy.name());
        let keys_a: Vec<&String> = a.iter().map(|(k, _)| k).collect();
        let keys_b: Vec<&String> = b.iter().map(|(k, _)| k).collect();
        assert_eq!(keys_a, keys_b, "{} is not reproducible", strategy.name());
        for ((_, ta), (_, tb)) in a.iter().zip(&b) {
            assert_eq!(ta.to_bits(), tb.to_bits());
        }
    }
}

#[test]
fn random_sample_evaluates_its_fraction() {
    let results = seeded_run(StrategyConfig::RandomSample {
        fraction: Some(0.25),
        max_fevals: None,
        seed: 1,
    });
    assert_eq!(results.len(), 6);
    let unique: HashSet<&String> = results.iter().map(|(k, _)| k).collect();
    assert_eq!(unique.len(), results.len());
}

#[test]
fn job_file_drives_a_full_run() {
    let dir = temp_dir("job");
    std::fs::write(dir.join("vector_add.cu"), VECTOR_ADD).unwrap();
    std::fs::write(
        dir.join("job.json"),
        r#"{
            "kernel": { "path": "vector_add.cu", "name": "vector_add" },
            "problem_size": 1000000,
            "arguments": [
                { "type": "buffer", "elements": 1000000, "elem_bytes": 4 },
                { "type": "buffer", "elements": 1000000, "elem_bytes": 4 },
                { "type": "buffer", "elements": 1000000, "elem_bytes": 4 },
                { "type": "int", "value": 1000000 }
            ],
            "tune_params": [
                { "name": "block_size_x", "values": [128, 256, 512, 2048] }
            ],
            "restrictions": [ "block_size_x >= 256" ],
            "metrics": [ { "name": "gbs", "expr": "12e6 / (time / 1e3) / 1e9" } ],
            "objective": { "metric": "gbs", "direction": "maximize" },
            "strategy": { "name": "exhaustive" },
            "cache": "cache.jsonl",
            "device": "rtx3070",
            "iterations": 3
        }"#,
    )
    .unwrap();

    let job = TuningJob::load(dir.join("job.json")).unwrap();
    assert_eq!(job.cache_path(), Some(dir.join("cache.jsonl")));
    let device = job.device().unwrap();
    assert_eq!(device.name, DeviceProperties::rtx3070().name);

    let tuner = job.tuner().unwrap();
    let mut backend = SimulatedBackend::new(device);
    let mut cache = ResultCache::open(job.cache_path().unwrap()).unwrap();
    let report = tuner.run(&mut backend, &mut cache).unwrap();

    // 128 is restricted away, 2048 is infeasible
    assert_eq!(report.stats.valid_configurations, 3);
    assert_eq!(report.results.len(), 3);
    assert_eq!(report.stats.total_skipped(), 1);
    assert_eq!(report.environment.iterations, 3);
    assert!(report.best().unwrap().metric("gbs").is_some());

    let out = dir.join("report.json");
    report.save(&out).unwrap();
    let loaded = ktuner::TuningReport::load(&out).unwrap();
    assert_eq!(loaded.results.len(), report.results.len());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn job_with_unknown_field_is_rejected() {
    let err = TuningJob::from_json(
        r#"{ "block_size": 3, "kernel": { "path": "k.cu", "name": "k" },
             "problem_size": 1, "tune_params": [] }"#,
        ".",
    )
    .unwrap_err();
    assert!(err.to_string().contains("block_size"));
}

#[test]
fn devices_tune_in_parallel_against_one_cache() {
    let tuner = tuner(&[64, 128, 256]);
    let backends: Vec<Box<dyn Backend>> = vec![
        Box::new(SimulatedBackend::new(DeviceProperties::a100())),
        Box::new(SimulatedBackend::new(DeviceProperties::rtx3070())),
    ];
    let cache = Mutex::new(ResultCache::in_memory());
    let reports = tune_devices(&tuner, backends, &cache);

    assert_eq!(reports.len(), 2);
    let reports: Vec<_> = reports.into_iter().map(Result::unwrap).collect();
    assert_eq!(reports[0].problem.device_name, DeviceProperties::a100().name);
    assert_eq!(reports[1].problem.device_name, DeviceProperties::rtx3070().name);
    for report in &reports {
        assert_eq!(report.results.len(), 3);
    }
    assert_eq!(cache.lock().unwrap().len(), 6);
    assert_eq!(tuner.telemetry().evaluations(), 6);
}
