//! Audio-thread hot path: one pull per device callback

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;

use radio_audio_receiver::audio::buffer::{Chunk, JitterBuffer};
use radio_audio_receiver::audio::pull::PullEngine;
use radio_audio_receiver::dsp::upsample;

fn bench_fill(c: &mut Criterion) {
    let buffer = Arc::new(JitterBuffer::new());
    let (mut engine, _events) = PullEngine::new(buffer.clone());
    let mut out = vec![0.0f32; 512 * 2];

    c.bench_function("fill_512_frames", |b| {
        b.iter(|| {
            while buffer.queued_samples() < out.len() * 4 {
                buffer.push(Chunk::new(vec![0.25; 2048]));
            }
            black_box(engine.fill(&mut out));
        })
    });

    c.bench_function("fill_starved", |b| {
        buffer.flush();
        b.iter(|| black_box(engine.fill(&mut out)))
    });
}

fn bench_upsample(c: &mut Criterion) {
    let frame = vec![0.1f32; 1024];
    c.bench_function("upsample_stereo_x4", |b| {
        b.iter(|| black_box(upsample(&frame, 2, 4)))
    });
}

criterion_group!(benches, bench_fill, bench_upsample);
criterion_main!(benches);
