//! Benchmarks for the Crypto1 stream cipher.
//!
//! A dictionary attack runs one authentication per candidate key, so the
//! cost of keying the cipher bounds how fast keys can be tried.
//!
//! Run benchmarks with:
//! ```sh
//! cargo bench --bench crypto1_bench
//! ```

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use tapkit_core::BitBuffer;
use tapkit_protocol::mf_classic::crypto1::prng_successor;
use tapkit_protocol::{Crypto1, MfClassicKey};

const CUID: u32 = 0xDEAD_1001;
const NT: u32 = 0x0102_0304;
const NR: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

/// Reader answer of a first authentication: key load, nonce mixing and
/// encrypted `{nr}{ar}`.
fn bench_authentication(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto1_auth");
    group.throughput(Throughput::Elements(1));

    let key = MfClassicKey::DEFAULT;
    group.bench_function("encrypt_reader_nonce", |b| {
        b.iter(|| {
            let mut cipher = Crypto1::new(black_box(&key));
            let answer = cipher
                .encrypt_reader_nonce(black_box(&key), CUID, NT, NR)
                .unwrap();
            black_box(answer);
        });
    });

    group.bench_function("prng_successor_64", |b| {
        b.iter(|| black_box(prng_successor(black_box(NT), 64)));
    });

    group.finish();
}

/// Encrypting frames once the session is established.
fn bench_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto1_encrypt");

    for size in [4usize, 18] {
        let frame = BitBuffer::from_bytes(&vec![0x30; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &frame, |b, frame| {
            let mut cipher = Crypto1::new(&MfClassicKey::DEFAULT);
            b.iter(|| black_box(cipher.encrypt(black_box(frame)).unwrap()));
        });
    }

    group.finish();
}

/// Trying a batch of candidate keys, as one sector of a dictionary attack.
fn bench_key_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto1_key_batch");

    for batch_size in [10u64, 100, 1000] {
        let keys: Vec<MfClassicKey> = (0..batch_size)
            .map(|i| {
                let bytes = i.to_be_bytes();
                MfClassicKey::new([bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]])
            })
            .collect();
        group.throughput(Throughput::Elements(batch_size));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &keys, |b, keys| {
            b.iter(|| {
                let mut cipher = Crypto1::new(&MfClassicKey::DEFAULT);
                for key in keys {
                    black_box(cipher.encrypt_reader_nonce(key, CUID, NT, NR).unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_authentication, bench_encrypt, bench_key_batch);
criterion_main!(benches);
