//! Allocation throughput: fresh bump allocation vs. free-list reuse.
//!
//! Run with:
//!   cargo bench --bench alloc

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use heap::{Heap, HeapSettings, Phases};

const ARENA: usize = 1 << 20;
const ROUNDS: usize = 1024;

fn bench_bump_alloc(c: &mut Criterion) {
    c.bench_function("bump_alloc_64", |b| {
        b.iter_batched(
            || Heap::new(HeapSettings { heap_size: ARENA }).expect("arena"),
            |mut heap| {
                for _ in 0..ROUNDS {
                    black_box(heap.alloc(64).expect("alloc"));
                }
                heap
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_reuse_alloc(c: &mut Criterion) {
    c.bench_function("reuse_alloc_64", |b| {
        b.iter_batched(
            || {
                let mut heap = Heap::new(HeapSettings { heap_size: ARENA }).expect("arena");
                for _ in 0..ROUNDS {
                    heap.alloc(64).expect("alloc");
                }
                // No stack top recorded: the root set is empty and every
                // chunk lands on the free list.
                heap.collect(Phases::MARK | Phases::SWEEP);
                heap
            },
            |mut heap| {
                for _ in 0..ROUNDS {
                    black_box(heap.alloc(64).expect("alloc"));
                }
                heap
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_bump_alloc, bench_reuse_alloc);
criterion_main!(benches);
