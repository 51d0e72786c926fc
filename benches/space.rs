//! Criterion benchmarks for space enumeration and restriction evaluation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ktuner::{Expr, ParameterSpace, Restriction, SearchSpace};
use std::collections::HashMap;

fn matmul_params() -> ParameterSpace {
    ParameterSpace::new()
        .with("block_size_x", [8, 16, 32, 64, 128])
        .unwrap()
        .with("block_size_y", [1, 2, 4, 8, 16, 32])
        .unwrap()
        .with("tile_size_x", [1, 2, 4, 8])
        .unwrap()
        .with("tile_size_y", [1, 2, 4, 8])
        .unwrap()
        .with("unroll", [0, 1])
        .unwrap()
}

fn bench_enumeration(c: &mut Criterion) {
    let open = SearchSpace::new(matmul_params(), vec![]).unwrap();
    let restricted = SearchSpace::new(
        matmul_params(),
        vec![
            Restriction::parse("block_size_x * block_size_y <= 1024").unwrap(),
            Restriction::parse("block_size_x * tile_size_x >= 32").unwrap(),
            Restriction::parse("unroll == 0 or tile_size_y > 1").unwrap(),
        ],
    )
    .unwrap();

    c.bench_function("space_iter_unrestricted_960", |b| {
        b.iter(|| black_box(&open).count())
    });
    c.bench_function("space_iter_three_restrictions_960", |b| {
        b.iter(|| black_box(&restricted).count())
    });
}

fn bench_expressions(c: &mut Criterion) {
    let expr = Expr::parse("max(1, block_size_x * tile_size_x) // 4 + 2 ** unroll <= 64").unwrap();
    let scope: HashMap<String, ktuner::Value> = [
        ("block_size_x", 32),
        ("tile_size_x", 4),
        ("unroll", 1),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), ktuner::Value::Int(v)))
    .collect();

    c.bench_function("expr_parse", |b| {
        b.iter(|| Expr::parse(black_box("block_size_x * block_size_y <= 1024 and unroll == 1")))
    });
    c.bench_function("expr_eval", |b| b.iter(|| black_box(&expr).eval(&scope)));
}

criterion_group!(benches, bench_enumeration, bench_expressions);
criterion_main!(benches);
