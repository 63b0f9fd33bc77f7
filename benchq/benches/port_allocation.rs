//! Benchmarks for port block allocation.
//!
//! - Allocate + release of a single block on an empty pool
//! - Allocation when the pool is nearly full (worst-case scan)
//! - Contended allocate/release from several threads


use std::sync::Arc;
use std::thread;

use benchq::{PortAllocator, PortPoolConfig, RunId};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn pool(start: u16, end: u16) -> PortAllocator {
    PortAllocator::new(PortPoolConfig {
        start,
        end,
        ..PortPoolConfig::default()
    })
}

/// Allocate then release one block on an otherwise empty pool.
fn bench_allocate_release(c: &mut Criterion) {
    let allocator = pool(6000, 6999);

    c.bench_function("allocate_release/empty_pool", |b| {
        b.iter(|| {
            let run_id = RunId::new();
            let allocation = allocator.allocate(run_id).expect("pool has room");
            std::hint::black_box(&allocation);
            allocator.release(run_id);
        });
    });
}

/// Allocate the last free block of a pool holding `occupied` runs.
fn bench_allocate_nearly_full(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_nearly_full");

    for occupied in [10usize, 50, 100] {
        let per_run = PortPoolConfig::default().ports_per_run as usize;
        let end = 10_000 + ((occupied + 1) * per_run) as u16;
        let allocator = pool(10_000, end);
        for _ in 0..occupied {
            allocator.allocate(RunId::new()).expect("pool sized for occupants");
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(occupied), &occupied, |b, _| {
            b.iter(|| {
                let run_id = RunId::new();
                allocator.allocate(run_id).expect("one block left");
                allocator.release(run_id);
            });
        });
    }

    group.finish();
}

/// Several threads allocating and releasing against one pool.
fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_contended");
    group.sample_size(20);

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 100) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            let allocator = Arc::new(pool(20_000, 21_000));
            b.iter(|| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        let allocator = Arc::clone(&allocator);
                        thread::spawn(move || {
                            for _ in 0..100 {
                                let run_id = RunId::new();
                                if allocator.allocate(run_id).is_ok() {
                                    allocator.release(run_id);
                                }
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().expect("worker thread panicked");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_allocate_release,
    bench_allocate_nearly_full,
    bench_contended
);
criterion_main!(benches);
