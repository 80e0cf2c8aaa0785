//! Performance benchmarks for the audio hot paths
//!
//! Run with: cargo bench
//! Or for specific benchmarks: cargo bench -- <filter>

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use live_consult::core::codec::{decode, encode, f32_to_i16, resample_linear};
use live_consult::core::playback::AudioPlaybackScheduler;
use live_consult::devices::ManualClockSpeaker;

fn tone(len: usize) -> Vec<i16> {
    (0..len)
        .map(|i| ((i as f32 * 0.05).sin() * 12_000.0) as i16)
        .collect()
}

/// Base64 PCM in both directions at typical frame sizes
fn bench_wire_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");
    group.measurement_time(Duration::from_secs(5));

    // 1024 samples is one capture chunk; 4800 is 200 ms of agent speech.
    for len in [1024usize, 4800, 24_000] {
        let samples = tone(len);
        let wire = encode(&samples);

        group.throughput(Throughput::Bytes((len * 2) as u64));
        group.bench_with_input(BenchmarkId::new("encode", len), &samples, |b, s| {
            b.iter(|| encode(black_box(s)));
        });
        group.bench_with_input(BenchmarkId::new("decode", len), &wire, |b, w| {
            b.iter(|| decode(black_box(w)));
        });
    }

    group.finish();
}

/// Device-rate conversion on the capture path
fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");

    let block: Vec<f32> = (0..4410).map(|i| (i as f32 * 0.01).sin()).collect();
    group.throughput(Throughput::Elements(block.len() as u64));
    group.bench_function("44100_to_16000", |b| {
        b.iter(|| f32_to_i16(&resample_linear(black_box(&block), 44_100, 16_000)));
    });
    group.bench_function("24000_to_48000", |b| {
        b.iter(|| resample_linear(black_box(&block), 24_000, 48_000));
    });

    group.finish();
}

/// Scheduling a reply, then a barge-in
fn bench_playback(c: &mut Criterion) {
    let mut group = c.benchmark_group("playback");
    let buffer = tone(2400);

    group.bench_function("enqueue_then_interrupt_50", |b| {
        b.iter(|| {
            let speaker = ManualClockSpeaker::new(24_000);
            let mut scheduler = AudioPlaybackScheduler::new(Arc::new(speaker));
            for _ in 0..50 {
                let _ = scheduler.enqueue(black_box(&buffer), 24_000, scheduler.generation());
            }
            scheduler.interrupt()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_wire_codec, bench_resample, bench_playback);
criterion_main!(benches);
