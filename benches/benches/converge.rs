// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use serde_json::{Map, Value, json};
use understory_converge::{
    ConvergeMode, ConvergeOptions, Converger, DirtyAllReason, DirtyRoots, Draft, PlanCache,
    Program, Rule, RuleDecl, paths_to_dirty_set,
};

/// `chains` independent chains of `depth` computed fields each.
fn chains(chains: usize, depth: usize) -> Program {
    let mut builder = Program::builder("bench");
    for c in 0..chains {
        for d in 0..depth {
            let input = if d == 0 {
                format!("in{c}")
            } else {
                format!("c{c}_{}", d - 1)
            };
            let read = input.clone();
            builder = builder.rule(RuleDecl::new(
                format!("c{c}_{d}"),
                Rule::computed([input], move |s| {
                    Ok(json!(s.read_i64(&read).unwrap_or(0) + 1))
                }),
            ));
        }
    }
    builder.build().expect("bench program is acyclic")
}

fn seed(chains: usize, program: &Program) -> Draft {
    let mut inputs = Map::new();
    for c in 0..chains {
        inputs.insert(format!("in{c}"), json!(0));
    }
    let mut draft = Draft::new(Arc::new(Value::Object(inputs)));
    Converger::new(program, ConvergeOptions::default())
        .run(&DirtyRoots::all(DirtyAllReason::ColdStart), &mut draft);
    draft
}

fn options(mode: ConvergeMode) -> ConvergeOptions {
    ConvergeOptions {
        mode,
        budget: None,
        ..ConvergeOptions::default()
    }
}

fn bench_converge(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_converge");
    group.sample_size(50);

    for &(n, depth) in &[(16_usize, 4_usize), (128, 4), (512, 2)] {
        let program = chains(n, depth);
        let base = seed(n, &program).finalize();

        for (label, mode) in [("dirty", ConvergeMode::Dirty), ("full", ConvergeMode::Full)] {
            group.bench_function(format!("one_input_{label}(chains={n},depth={depth})"), |b| {
                b.iter_batched(
                    || {
                        let mut draft = Draft::new(Arc::clone(&base));
                        draft.set("in0", json!(5));
                        draft
                    },
                    |mut draft| {
                        let dirty = paths_to_dirty_set(program.registry(), ["in0"]);
                        let outcome = Converger::new(&program, options(mode)).run(&dirty, &mut draft);
                        black_box((outcome, draft));
                    },
                    BatchSize::SmallInput,
                );
            });
        }

        group.bench_function(format!("one_input_cached(chains={n},depth={depth})"), |b| {
            let mut cache = PlanCache::new(32);
            b.iter_batched(
                || {
                    let mut draft = Draft::new(Arc::clone(&base));
                    draft.set("in0", json!(5));
                    draft
                },
                |mut draft| {
                    let dirty = paths_to_dirty_set(program.registry(), ["in0"]);
                    let outcome = Converger::new(&program, options(ConvergeMode::Dirty))
                        .with_cache(&mut cache)
                        .run(&dirty, &mut draft);
                    black_box((outcome, draft));
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.bench_function("build_program(chains=128,depth=4)", |b| {
        b.iter(|| black_box(chains(128, 4)));
    });

    group.finish();
}

criterion_group!(benches, bench_converge);
criterion_main!(benches);
