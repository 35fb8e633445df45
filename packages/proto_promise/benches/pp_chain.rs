//! Throughput of promise chains and fan-in for the `proto_promise` package.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use proto_promise::{CancelationSource, Deferred, Promise};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const CHAIN_LENGTH: usize = 16;
const FAN_IN_WIDTH: usize = 16;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pp_chain");

    group.bench_function("settled_then", |b| {
        b.iter(|| {
            let promise = Promise::resolved(black_box(1_u64)).then(|value| value + 1);
            black_box(promise.wait().unwrap())
        });
    });

    group.bench_function("deferred_then", |b| {
        b.iter(|| {
            let (deferred, promise) = Deferred::new();
            let promise = promise.then(|value: u64| value + 1);
            deferred.resolve(black_box(1));
            black_box(promise.wait().unwrap())
        });
    });

    group.bench_function("deferred_chain", |b| {
        b.iter(|| {
            let (deferred, mut promise) = Deferred::new();

            for _ in 0..CHAIN_LENGTH {
                promise = promise.then(|value: u64| value + 1);
            }

            deferred.resolve(black_box(0));
            black_box(promise.wait().unwrap())
        });
    });

    group.bench_function("deferred_then_cancelable", |b| {
        let source = CancelationSource::new();
        let token = source.token();

        b.iter(|| {
            let (deferred, promise) = Deferred::new();
            let promise = promise.then_cancelable(&token, |value: u64| value + 1);
            deferred.resolve(black_box(1));
            black_box(promise.wait().unwrap())
        });
    });

    group.finish();

    let mut fan_in = c.benchmark_group("pp_fan_in");

    fan_in.bench_function("all", |b| {
        b.iter(|| {
            let (deferreds, promises): (Vec<_>, Vec<_>) =
                (0..FAN_IN_WIDTH).map(|_| Deferred::new()).unzip();

            let all = Promise::all(promises);

            for (value, deferred) in deferreds.into_iter().enumerate() {
                deferred.resolve(value);
            }

            black_box(all.wait().unwrap())
        });
    });

    fan_in.bench_function("race", |b| {
        b.iter(|| {
            let (deferreds, promises): (Vec<_>, Vec<_>) =
                (0..FAN_IN_WIDTH).map(|_| Deferred::new()).unzip();

            let race = Promise::race(promises);

            for (value, deferred) in deferreds.into_iter().enumerate() {
                deferred.resolve(value);
            }

            black_box(race.wait().unwrap())
        });
    });

    fan_in.bench_function("preserve_branches", |b| {
        b.iter(|| {
            let (deferred, promise) = Deferred::new();
            let preserved = promise.preserve();

            let branches: Vec<_> = (0..FAN_IN_WIDTH).map(|_| preserved.branch()).collect();
            deferred.resolve(black_box(7_u64));

            for branch in branches {
                black_box(branch.wait().unwrap());
            }
        });
    });

    fan_in.finish();
}
