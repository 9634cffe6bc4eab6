//! Criterion benchmarks for the lip-sync envelope codec.
//!
//! Payload validation dominates per-request CPU on the session task, so the
//! interesting numbers are the decode+validate cost at realistic payload
//! sizes and the cost of encoding a large `result` frame.
//!
//! Run with:
//! ```bash
//! cargo bench --package lipsync-core --bench codec_bench
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lipsync_core::protocol::{encode_video, validate_process, PayloadLimits};
use lipsync_core::{
    decode_client_message, encode_server_message, ClientMessage, JobId, ModelVariant,
    ServerMessage,
};

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn make_process_frame(audio_bytes: usize, image_bytes: usize) -> String {
    serde_json::json!({
        "type": "process",
        "audio_base64": STANDARD.encode(vec![0x5Au8; audio_bytes]),
        "image_base64": STANDARD.encode(vec![0xA5u8; image_bytes]),
        "options": {"model_type": "fast", "pads": [0, 10, 0, 0]},
    })
    .to_string()
}

fn make_result(video_bytes: usize) -> ServerMessage {
    let video = vec![0x11u8; video_bytes];
    ServerMessage::Result {
        job_id: JobId(1),
        video_size_bytes: video.len() as u64,
        video_base64: encode_video(&video),
        processing_time: 3.2,
        model_used: ModelVariant::Fast,
        timestamp: 0.0,
    }
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_small_envelopes(c: &mut Criterion) {
    c.bench_function("decode_ping", |b| {
        b.iter(|| decode_client_message(black_box(r#"{"type":"ping"}"#)))
    });
    c.bench_function("encode_progress", |b| {
        let msg = ServerMessage::progress(JobId(1), 40, "Running lip-sync inference");
        b.iter(|| encode_server_message(black_box(&msg)))
    });
}

fn bench_process_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_and_validate_process");
    let limits = PayloadLimits::default();
    for audio_kib in [64usize, 1024, 8192] {
        let frame = make_process_frame(audio_kib * 1024, 256 * 1024);
        group.bench_with_input(BenchmarkId::from_parameter(audio_kib), &frame, |b, frame| {
            b.iter(|| {
                if let Ok(ClientMessage::Process(req)) = decode_client_message(black_box(frame)) {
                    let _ = validate_process(req, &limits);
                }
            })
        });
    }
    group.finish();
}

fn bench_result_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_result");
    for video_kib in [256usize, 4096] {
        let msg = make_result(video_kib * 1024);
        group.bench_with_input(BenchmarkId::from_parameter(video_kib), &msg, |b, msg| {
            b.iter(|| encode_server_message(black_box(msg)))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_small_envelopes,
    bench_process_validation,
    bench_result_encoding
);
criterion_main!(benches);
