//! Benchmarks for PPMd7 decompression throughput.
//!
//! Run with: `cargo bench --features test-support`
//! Compare with baseline: `cargo bench --features test-support -- --save-baseline main`
//! Compare against baseline: `cargo bench --features test-support -- --baseline main`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ppmd_stream::decompress::ppm::Ppmd7Encoder;
use ppmd_stream::{IncrementalDecoder, Ppmd7Decoder};

const ORDER: u32 = 6;
const MEM: u32 = 16 << 20;

/// Text-like input with some repetition, similar to source files.
fn corpus(len: usize) -> Vec<u8> {
    let words: &[&[u8]] = &[
        b"fn ", b"let ", b"mut ", b"self", b".feed(", b"input", b", ", b"limit", b");\n",
        b"    ", b"match ", b"Some(", b"None", b" => ", b"return ", b"Ok(", b"out", b"}\n",
    ];
    let mut state = 0x1234_5678_u32;
    let mut out = Vec::with_capacity(len + 16);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        out.extend_from_slice(words[state as usize % words.len()]);
    }
    out.truncate(len);
    out
}

/// Benchmark decoding a whole stream in one call
fn bench_single_call(c: &mut Criterion) {
    let data = corpus(1 << 20);
    let packed = Ppmd7Encoder::compress(&data, ORDER, MEM, true).expect("encode");

    let mut group = c.benchmark_group("decompress");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("single_call", |b| {
        b.iter(|| {
            let mut decoder = Ppmd7Decoder::new(ORDER, MEM).expect("open");
            let result = decoder.feed(black_box(&packed), None);
            black_box(result)
        });
    });

    group.finish();
}

/// Benchmark the carry-over path with small input chunks
fn bench_chunked(c: &mut Criterion) {
    let data = corpus(256 << 10);
    let packed = Ppmd7Encoder::compress(&data, ORDER, MEM, true).expect("encode");

    let mut group = c.benchmark_group("chunked");
    group.throughput(Throughput::Bytes(data.len() as u64));

    for chunk in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &chunk, |b, &chunk| {
            b.iter(|| {
                let mut decoder = Ppmd7Decoder::new(ORDER, MEM).expect("open");
                let mut total = 0;
                for piece in packed.chunks(chunk) {
                    total += decoder.feed(black_box(piece), None).map_or(0, |v| v.len());
                }
                black_box(total)
            });
        });
    }

    group.finish();
}

/// Benchmark small output quotas against the same input
fn bench_quota(c: &mut Criterion) {
    let data = corpus(256 << 10);
    let packed = Ppmd7Encoder::compress(&data, ORDER, MEM, true).expect("encode");

    let mut group = c.benchmark_group("quota");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("limit_512", |b| {
        b.iter(|| {
            let mut decoder = Ppmd7Decoder::new(ORDER, MEM).expect("open");
            let mut total = decoder.feed(&packed, Some(512)).map_or(0, |v| v.len());
            while !decoder.eof() {
                match decoder.feed(&[], Some(512)) {
                    Ok(v) => total += v.len(),
                    Err(_) => break,
                }
            }
            black_box(total)
        });
    });

    group.finish();
}

#[cfg(feature = "thread-bridge")]
/// Benchmark the worker-thread strategy with mid-sized chunks
fn bench_thread_bridge(c: &mut Criterion) {
    use ppmd_stream::ThreadedPpmd7Decoder;

    let data = corpus(256 << 10);
    let packed = Ppmd7Encoder::compress(&data, ORDER, MEM, true).expect("encode");

    let mut group = c.benchmark_group("thread_bridge");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("chunk_4096", |b| {
        b.iter(|| {
            let mut decoder = ThreadedPpmd7Decoder::new(ORDER, MEM).expect("open");
            let mut total = 0;
            for piece in packed.chunks(4096) {
                total += decoder.feed(black_box(piece), None).map_or(0, |v| v.len());
            }
            black_box(total)
        });
    });

    group.finish();
}

#[cfg(not(feature = "thread-bridge"))]
fn bench_thread_bridge(_c: &mut Criterion) {}

criterion_group!(
    benches,
    bench_single_call,
    bench_chunked,
    bench_quota,
    bench_thread_bridge,
);
criterion_main!(benches);
