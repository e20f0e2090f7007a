// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use understory_dirty::{DirtyGraph, DirtySet, TopoOrder, TraversalScratch};

#[derive(Clone)]
struct Lcg(u64);

impl Lcg {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        // Numerical Recipes LCG parameters.
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        (self.0 >> 32) as u32
    }

    fn gen_range_usize(&mut self, upper_exclusive: usize) -> usize {
        if upper_exclusive == 0 {
            return 0;
        }
        (self.next_u32() as usize) % upper_exclusive
    }
}

fn build_dag_graph(n: u32, edges_per_node: u32, seed: u64) -> DirtyGraph<u32> {
    let mut graph = DirtyGraph::new();
    let mut rng = Lcg::new(seed);

    // Edges only point at lower keys, so the graph is acyclic.
    for from in 0..n {
        graph.add_node(from);
        let out = edges_per_node.min(from);
        for _ in 0..out {
            let to = rng.gen_range_usize(from as usize) as u32;
            graph.add_dependency(from, to);
        }
    }

    graph
}

fn bench_dirty(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_dirty");
    group.sample_size(50);

    for &(n, edges_per_node) in &[
        (256_u32, 1_u32),
        (256_u32, 4_u32),
        (4_096_u32, 1_u32),
        (4_096_u32, 4_u32),
    ] {
        let graph = build_dag_graph(n, edges_per_node, 0xD1A7_0000_0000_0001);

        group.bench_function(format!("reverse_closure(n={n},e={edges_per_node})"), |b| {
            b.iter(|| black_box(graph.reverse_closure([0])));
        });

        group.bench_function(
            format!("reverse_closure_with_scratch(n={n},e={edges_per_node})"),
            |b| {
                let mut scratch = TraversalScratch::with_capacity(n as usize / 2);
                b.iter(|| {
                    let mut dirty = DirtySet::new();
                    graph.for_each_in_reverse_closure([0], &mut scratch, |key| {
                        dirty.mark(key);
                    });
                    black_box(dirty);
                });
            },
        );

        group.bench_function(format!("topo_order_all(n={n},e={edges_per_node})"), |b| {
            b.iter(|| {
                let sum: u64 = TopoOrder::new(&graph, graph.keys().iter().copied())
                    .fold(0_u64, |acc, k| acc + u64::from(k));
                black_box(sum);
            });
        });

        group.bench_function(
            format!("closure_then_topo(n={n},e={edges_per_node})"),
            |b| {
                b.iter_batched(
                    || graph.reverse_closure([n / 2]),
                    |closure| {
                        let (order, completion) =
                            TopoOrder::new(&graph, closure).collect_with_completion();
                        black_box((order, completion));
                    },
                    BatchSize::SmallInput,
                );
            },
        );

        group.bench_function(format!("find_cycle_acyclic(n={n},e={edges_per_node})"), |b| {
            b.iter(|| black_box(graph.find_cycle()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dirty);
criterion_main!(benches);
