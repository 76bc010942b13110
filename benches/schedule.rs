//! Scheduling benchmarks: insertion and cancellation throughput.
//!
//! The worker runs with a one-second tick so the measured loops never
//! contend with a drain.
//!
//! Run with:
//!     cargo bench --bench schedule

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::time::Duration;
use tourbillon::{TimerBuilder, WheelTimer};

/// Operations executed per criterion iteration (hot-loop size).
const OPS: u64 = 1_000;

fn idle_wheel_timer() -> WheelTimer {
    TimerBuilder::new()
        .tick_duration(Duration::from_secs(1))
        .ticks_per_wheel(512)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Group 1: schedule
// ---------------------------------------------------------------------------
// Pure insertion cost across delays that scatter over the whole wheel.
// Handles are cancelled after the measured loop so entries do not pile up
// across iterations.

fn bench_schedule(c: &mut Criterion) {
    let timer = idle_wheel_timer();

    let mut group = c.benchmark_group("schedule");
    group.throughput(Throughput::Elements(OPS));

    group.bench_function("varied_delays", |b| {
        b.iter_with_large_drop(|| {
            let handles: Vec<_> = (0..OPS)
                .map(|i| {
                    let delay = Duration::from_secs(60 + (i % 512));
                    timer.schedule_fn(|_t| {}, black_box(delay)).unwrap()
                })
                .collect();
            for handle in &handles {
                handle.cancel();
            }
            handles
        })
    });

    group.finish();
    let _ = timer.stop();
}

// ---------------------------------------------------------------------------
// Group 2: cancel
// ---------------------------------------------------------------------------
// Cancellation of already-scheduled timeouts: one CAS plus a bucket
// removal each.

fn bench_cancel(c: &mut Criterion) {
    let timer = idle_wheel_timer();

    let mut group = c.benchmark_group("cancel");
    group.throughput(Throughput::Elements(OPS));

    group.bench_function("pending_timeouts", |b| {
        b.iter_batched(
            || {
                (0..OPS)
                    .map(|i| {
                        let delay = Duration::from_secs(60 + (i % 512));
                        timer.schedule_fn(|_t| {}, delay).unwrap()
                    })
                    .collect::<Vec<_>>()
            },
            |handles| {
                for handle in &handles {
                    black_box(handle.cancel());
                }
            },
            criterion::BatchSize::LargeInput,
        )
    });

    group.finish();
    let _ = timer.stop();
}

criterion_group!(benches, bench_schedule, bench_cancel);
criterion_main!(benches);
