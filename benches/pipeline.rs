//! Integration benchmark for the reading pipeline.
//!
//! Feeds synthetic readings through the metrics engine and broadcast hub
//! using the same shapes as the integration tests, without a real sensor.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pulselink::metrics::{MetricsConfig, MetricsEngine};
use pulselink::{BroadcastHub, Event, Reading};
use std::sync::Arc;

fn engine_with_samples(count: usize) -> (MetricsEngine, DateTime<Utc>) {
    let engine = MetricsEngine::new(MetricsConfig::default());
    let t0 = DateTime::<Utc>::UNIX_EPOCH;
    let mut now = t0;
    for i in 0..count {
        now = t0 + ChronoDuration::milliseconds(i as i64 * 500);
        let bpm = 60 + (i % 60) as u16;
        engine.push(now, bpm, &[60_000 / u32::from(bpm)]);
    }
    (engine, now)
}

fn bench_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("metrics_push");
    group.throughput(Throughput::Elements(1));
    group.bench_function("with_rr", |b| {
        let (engine, now) = engine_with_samples(600);
        b.iter(|| {
            engine.push(black_box(now), black_box(72), black_box(&[833]));
        });
    });
    group.finish();
}

fn bench_compute_stats(c: &mut Criterion) {
    let mut group = c.benchmark_group("compute_stats");
    for window_secs in [10u64, 60, 300] {
        // 2 Hz samples covering the whole retention span.
        let (engine, now) = engine_with_samples(660);
        group.bench_with_input(
            BenchmarkId::from_parameter(window_secs),
            &window_secs,
            |b, &window_secs| {
                b.iter(|| engine.compute_stats_at(black_box(window_secs), now));
            },
        );
    }
    group.finish();
}

fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");
    for subscribers in [1usize, 8, 64] {
        let hub = BroadcastHub::new();
        let mut subs: Vec<_> = (0..subscribers).map(|_| hub.subscribe()).collect();
        let event = Event::Reading {
            reading: Arc::new(Reading {
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                bpm: 72,
                battery_percent: Some(85),
                energy_expended: None,
                rr_intervals_ms: vec![833, 830],
            }),
        };
        group.throughput(Throughput::Elements(subscribers as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                b.iter(|| {
                    black_box(hub.broadcast(black_box(&event)));
                    // Drain so bounded channels never fill up and evict.
                    for sub in subs.iter_mut() {
                        let _ = sub.rx.try_recv();
                    }
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_push, bench_compute_stats, bench_broadcast);
criterion_main!(benches);
