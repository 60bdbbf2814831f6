//! Benchmark suite for the measurement frame decoder.
//!
//! Isolates decoding from the async pipeline so the hot path of every
//! notification can be measured on its own.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use pulselink::{decode_battery_level, decode_measurement};

/// Minimal frame: u8 bpm, no optional fields.
fn minimal_frame() -> Vec<u8> {
    vec![0x00, 72]
}

/// Fully loaded frame: u16 bpm, energy expended, four RR intervals.
fn full_frame() -> Vec<u8> {
    vec![
        0x19, // u16 bpm + energy expended + RR intervals
        0x48, 0x00, // bpm: 72
        0x10, 0x27, // energy: 10000 kJ
        0x00, 0x04, // RR: 1024 (1000 ms)
        0x33, 0x03, // RR: 819 (800 ms)
        0x9A, 0x03, // RR: 922 (900 ms)
        0xCD, 0x04, // RR: 1229 (1200 ms)
    ]
}

fn bench_decode_measurement(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_measurement");
    for (name, frame) in [("minimal", minimal_frame()), ("full", full_frame())] {
        group.throughput(Throughput::Bytes(frame.len() as u64));
        group.bench_function(name, |b| {
            b.iter(|| decode_measurement(black_box(&frame)));
        });
    }
    group.finish();
}

fn bench_decode_truncated(c: &mut Criterion) {
    // Flags promise RR intervals but the payload stops mid-field.
    let truncated = vec![0x10, 72, 0x00];
    c.bench_function("decode_measurement_truncated", |b| {
        b.iter(|| decode_measurement(black_box(&truncated)));
    });
}

fn bench_decode_battery(c: &mut Criterion) {
    let payload = vec![85u8];
    c.bench_function("decode_battery_level", |b| {
        b.iter(|| decode_battery_level(black_box(&payload)));
    });
}

criterion_group!(
    benches,
    bench_decode_measurement,
    bench_decode_truncated,
    bench_decode_battery
);
criterion_main!(benches);
