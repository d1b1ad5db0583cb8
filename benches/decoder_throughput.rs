//! Benchmarks for the wire path
//!
//! Measures how fast a connection's byte stream turns into queued messages:
//! - Message encoding for frame-sized payloads
//! - Decoding the same stream in one buffer and in socket-sized chunks
//! - Queue hand-off between the readiness loop and a worker
//!
//! Platform: Cross-platform (synthetic frames, CI-safe)

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use vigil::wire::{FRAME, FrameDecoder, Message};
use vigil::{Frame, FramePayload, InterruptibleQueue};

/// A stream of `count` encoded frame messages of `width`x`height` BGR.
fn frame_stream(width: u32, height: u32, count: usize) -> Vec<u8> {
    let payload = FramePayload::new(&Frame::filled(width, height, 3, 0x7f), "2024-01-01_00-00-00")
        .to_json()
        .expect("payload");
    let message = Message::new(FRAME, payload);
    (0..count).flat_map(|_| message.encode()).collect()
}

fn bench_encode(c: &mut Criterion) {
    let payload = FramePayload::new(&Frame::filled(320, 240, 3, 0x40), "label").to_json().expect("payload");
    let message = Message::new(FRAME, payload);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(message.payload().len() as u64));
    group.bench_function("frame_320x240", |b| b.iter(|| black_box(black_box(&message).encode())));
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let stream = frame_stream(160, 120, 16);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    group.bench_function("whole_buffer", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            black_box(decoder.feed(black_box(&stream)).count())
        })
    });

    for chunk in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(BenchmarkId::new("chunked", chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = FrameDecoder::new();
                let mut decoded = 0;
                for piece in stream.chunks(chunk) {
                    decoded += decoder.feed(black_box(piece)).count();
                }
                black_box(decoded)
            })
        });
    }

    group.finish();
}

fn bench_queue_handoff(c: &mut Criterion) {
    let queue = InterruptibleQueue::new(1500);
    let message = Message::new(FRAME, "x".repeat(256));

    c.bench_function("queue_enqueue_dequeue", |b| {
        b.iter(|| {
            queue.enqueue(black_box(message.clone()));
            black_box(queue.dequeue())
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_queue_handoff);
criterion_main!(benches);
