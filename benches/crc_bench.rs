//! Benchmarks for CRC_A framing.
//!
//! Every frame after anticollision carries a CRC_A, so appending and checking
//! it sits on the path of each exchange.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench crc_bench
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tapkit_core::BitBuffer;
use tapkit_protocol::{append_crc_a, check_crc_a, crc_a};

/// Raw CRC over payloads of growing size, up to a full ISO14443-4 frame.
fn bench_crc_a(c: &mut Criterion) {
    let mut group = c.benchmark_group("crc_a");

    for size in [2usize, 16, 64, 254] {
        let payload: Vec<u8> = (0..size).map(|i| i as u8).collect();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.iter(|| black_box(crc_a(black_box(payload))));
        });
    }

    group.finish();
}

/// Framing a Mifare Classic block write (16 data bytes).
fn bench_append_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_crc_a");
    group.throughput(Throughput::Elements(1));

    let block = [0x5Cu8; 16];
    group.bench_function("block_frame", |b| {
        b.iter(|| {
            let mut frame = BitBuffer::from_bytes(black_box(&block));
            append_crc_a(&mut frame).unwrap();
            black_box(frame);
        });
    });

    group.finish();
}

/// Validating a received block (16 data bytes plus CRC).
fn bench_check_crc(c: &mut Criterion) {
    let mut group = c.benchmark_group("check_crc_a");
    group.throughput(Throughput::Elements(1));

    let mut frame = BitBuffer::from_bytes(&[0xA5; 16]);
    append_crc_a(&mut frame).unwrap();
    group.bench_function("block_answer", |b| {
        b.iter(|| black_box(check_crc_a(black_box(&frame))));
    });

    group.finish();
}

criterion_group!(benches, bench_crc_a, bench_append_crc, bench_check_crc);
criterion_main!(benches);
