//! Lock contention benchmarks: several threads incrementing one counter

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::{Arc, Barrier};
use std::thread;

use svcio_core::{ClhLock, McsLock, RwSpinLock, SpinLock};

const ITERS: usize = 10_000;

fn contend<F>(threads: usize, op: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let op = Arc::new(op);
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let op = Arc::clone(&op);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ITERS {
                    op();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

fn bench_locks(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_contention");
    group.sample_size(10);

    for &threads in &[1usize, 2, 4] {
        group.bench_with_input(BenchmarkId::new("spin", threads), &threads, |b, &n| {
            b.iter(|| {
                let lock = Arc::new(SpinLock::new(0usize));
                contend(n, move || *lock.lock() += 1);
            })
        });
        group.bench_with_input(BenchmarkId::new("clh", threads), &threads, |b, &n| {
            b.iter(|| {
                let lock = Arc::new(ClhLock::new(0usize));
                contend(n, move || *lock.lock() += 1);
            })
        });
        group.bench_with_input(BenchmarkId::new("mcs", threads), &threads, |b, &n| {
            b.iter(|| {
                let lock = Arc::new(McsLock::new(0usize));
                contend(n, move || *lock.lock() += 1);
            })
        });
        group.bench_with_input(BenchmarkId::new("rw_write", threads), &threads, |b, &n| {
            b.iter(|| {
                let lock = Arc::new(RwSpinLock::new(0usize));
                contend(n, move || *lock.write() += 1);
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_locks);
criterion_main!(benches);
