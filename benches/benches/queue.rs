// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::time::Duration;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use understory_transaction::{Lane, QueueMode, QueuePolicy, TxnQueue};

fn drain(queue: &mut TxnQueue<u32>, now: Duration) -> usize {
    let mut served = 0;
    while let Some(batch) = queue.pop(now) {
        served += batch.items.len();
    }
    served
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_transaction_queue");

    for &items in &[64_u32, 1_024_u32] {
        for (label, policy) in [
            ("lanes_coalesce", QueuePolicy::default()),
            (
                "lanes_single",
                QueuePolicy {
                    coalesce: false,
                    ..QueuePolicy::default()
                },
            ),
            (
                "fifo",
                QueuePolicy {
                    mode: QueueMode::Fifo,
                    ..QueuePolicy::default()
                },
            ),
        ] {
            group.bench_function(format!("mixed_push_drain_{label}(n={items})"), |b| {
                b.iter(|| {
                    let mut queue = TxnQueue::new(policy);
                    for i in 0..items {
                        let lane = if i % 4 == 0 {
                            Lane::Urgent
                        } else {
                            Lane::NonUrgent
                        };
                        queue.push(lane, i, Duration::from_micros(u64::from(i)));
                    }
                    black_box(drain(&mut queue, Duration::from_secs(1)));
                });
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_queue);
criterion_main!(benches);
