//! Throughput of the VAD gate: PCM in, chunk/silence events out.
//!
//! The gate sits on the hot path between the decoder and every model
//! lane, so it must stay far cheaper than real time.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use echostream::backend::mock::EnergyVad;
use echostream::vad::VadGate;

/// Alternating one-second voiced/quiet regions.
fn alternating_pcm(seconds: usize) -> Vec<i16> {
    let mut pcm = Vec::with_capacity(seconds * 16_000);
    for second in 0..seconds {
        let amplitude = if second % 2 == 0 { 8000 } else { 0 };
        pcm.extend(std::iter::repeat(amplitude).take(16_000));
    }
    pcm
}

fn bench_gate_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("vad_gate_feed");
    for seconds in [1usize, 10, 30] {
        let pcm = alternating_pcm(seconds);
        group.bench_with_input(BenchmarkId::from_parameter(seconds), &pcm, |b, pcm| {
            b.iter(|| {
                let mut gate = VadGate::new(Box::new(EnergyVad::new(1000)));
                let mut events = gate.feed(pcm).expect("feed");
                events.extend(gate.finish().expect("finish"));
                events
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gate_feed);
criterion_main!(benches);
