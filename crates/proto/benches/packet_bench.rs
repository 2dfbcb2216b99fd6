//! Packet layer benchmarks
//!
//! Seal and open throughput for each cipher and MAC pairing, and the cost of
//! decoding SFTP attribute blocks.
//!
//! Run with: `cargo bench --bench packet_bench`

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tern_proto::ssh::crypto::{CipherAlgorithm, Direction, MacAlgorithm, MacKey};
use tern_proto::ssh::packet::{OpeningState, SealingState};
use tern_proto::ssh::sftp::FileAttributes;
use tern_proto::ssh::wire::Reader;

const PAYLOAD_SIZES: [usize; 3] = [64, 4096, 32768];

const PAIRS: [(CipherAlgorithm, MacAlgorithm); 3] = [
    (CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256),
    (CipherAlgorithm::Aes256Ctr, MacAlgorithm::HmacSha512),
    (CipherAlgorithm::Aes256Cbc, MacAlgorithm::HmacSha1),
];

fn keyed_pair(cipher: CipherAlgorithm, mac: MacAlgorithm) -> (SealingState, OpeningState) {
    let key = [0x5a; 64];
    let iv = [0x3c; 16];
    let mut sealer = SealingState::plaintext();
    sealer.set_keys(
        cipher.build(Direction::Encrypt, &key, &iv).unwrap(),
        Some(MacKey::new(mac, &key).unwrap()),
    );
    let mut opener = OpeningState::plaintext();
    opener.set_keys(
        cipher.build(Direction::Decrypt, &key, &iv).unwrap(),
        Some(MacKey::new(mac, &key).unwrap()),
    );
    (sealer, opener)
}

/// Benchmark sealing packets
fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_seal");

    for (cipher, mac) in PAIRS {
        for size in PAYLOAD_SIZES {
            let payload = vec![0xA5u8; size];
            let (mut sealer, _) = keyed_pair(cipher, mac);
            group.throughput(Throughput::Bytes(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("{}+{}", cipher, mac), size),
                &payload,
                |b, payload| b.iter(|| sealer.seal(black_box(payload)).unwrap()),
            );
        }
    }

    group.finish();
}

/// Benchmark sealing then opening, as a peer would see it
fn bench_seal_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_seal_open");

    for (cipher, mac) in PAIRS {
        let size = 32768;
        let payload = vec![0x5Au8; size];
        let (mut sealer, mut opener) = keyed_pair(cipher, mac);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}+{}", cipher, mac), |b| {
            b.iter(|| {
                let wire = sealer.seal(&payload).unwrap();
                opener.feed(&wire);
                black_box(opener.try_open().unwrap())
            })
        });
    }

    group.finish();
}

/// Benchmark decoding a full SFTP attribute block
fn bench_attrs_decode(c: &mut Criterion) {
    let attrs = FileAttributes {
        size: Some(1 << 40),
        uid: Some(1000),
        gid: Some(1000),
        permissions: Some(0o100644),
        atime: Some(1_700_000_000),
        mtime: Some(1_700_000_000),
        ..Default::default()
    };
    let mut buf = BytesMut::new();
    attrs.encode(&mut buf);
    let encoded = buf.to_vec();

    c.bench_function("sftp_attrs_decode", |b| {
        b.iter(|| {
            let mut r = Reader::new(black_box(&encoded));
            FileAttributes::decode(&mut r).unwrap()
        })
    });
}

criterion_group!(benches, bench_seal, bench_seal_open, bench_attrs_decode);
criterion_main!(benches);
