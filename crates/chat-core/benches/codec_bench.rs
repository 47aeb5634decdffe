//! Criterion benchmarks for the envelope codec and the encryption stage.
//!
//! Run with:
//! ```bash
//! cargo bench --package chat-core --bench codec_bench
//! ```

use std::sync::Arc;

use chat_core::protocol::{decode_envelope, encode_envelope, Envelope, FrameDecoder, MessageType};
use chat_core::{EncryptionStage, SessionKey, SessionKeyStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const PAYLOAD_SIZES: [usize; 4] = [0, 256, 4 * 1024, 64 * 1024];

fn make_envelope(size: usize) -> Envelope {
    Envelope::new(MessageType::MessageSendRequest, vec![0x5A; size])
}

// ── Benchmark groups ──────────────────────────────────────────────────────────

/// Benchmarks `encode_envelope` across payload sizes.
fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_envelope");
    for size in PAYLOAD_SIZES {
        let env = make_envelope(size);
        group.throughput(Throughput::Bytes(env.frame_len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &env, |b, env| {
            b.iter(|| encode_envelope(black_box(env)).expect("encode must succeed"))
        });
    }
    group.finish();
}

/// Benchmarks `decode_envelope` (including CRC verification).
fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_envelope");
    for size in PAYLOAD_SIZES {
        let bytes = encode_envelope(&make_envelope(size)).expect("encode must succeed");
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| decode_envelope(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Streaming decode of 100 coalesced small frames fed in 1 KiB chunks.
fn bench_frame_decoder(c: &mut Criterion) {
    let stream: Vec<u8> = (0..100)
        .flat_map(|_| encode_envelope(&make_envelope(64)).expect("encode must succeed"))
        .collect();

    c.bench_function("frame_decoder/100x64B_in_1KiB_chunks", |b| {
        b.iter(|| {
            let mut decoder = FrameDecoder::new();
            let mut count = 0;
            for chunk in stream.chunks(1024) {
                decoder.extend(black_box(chunk));
                while let Ok(Some(_)) = decoder.next_envelope() {
                    count += 1;
                }
            }
            assert_eq!(count, 100);
        })
    });
}

/// Seal + encode + decode + open: the full per-message hot path.
fn bench_encrypted_roundtrip(c: &mut Criterion) {
    let keys = Arc::new(SessionKeyStore::new());
    keys.install(SessionKey::generate());
    let stage = EncryptionStage::new(keys, true);

    let mut group = c.benchmark_group("encrypted_roundtrip");
    for size in PAYLOAD_SIZES {
        let env = make_envelope(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &env, |b, env| {
            b.iter(|| {
                let sealed = stage.outbound(black_box(env.clone())).expect("seal");
                let bytes = encode_envelope(&sealed).expect("encode");
                let (decoded, _) = decode_envelope(&bytes).expect("decode");
                stage.inbound(decoded).expect("open")
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_encode,
    bench_decode,
    bench_frame_decoder,
    bench_encrypted_roundtrip
);
criterion_main!(benches);
