use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use graphd::{CompressedWal, OpType, Wal};

const SEED: u64 = 42;

/// Payload sizes to test, in bytes.
const PAYLOAD_SIZES: &[usize] = &[64, 512, 4096];

fn bench_data_dir() -> PathBuf {
    PathBuf::from("target/bench-data-wal")
}

fn cleanup() {
    let _ = fs::remove_dir_all(bench_data_dir());
}

fn wal_dir(name: &str) -> PathBuf {
    let path = bench_data_dir().join(name);
    let _ = fs::remove_dir_all(&path);
    path
}

fn generate_payload(rng: &mut StdRng, size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    rng.fill_bytes(&mut payload);
    payload
}

fn append_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("wal_append");
    group.sample_size(100);
    group.measurement_time(Duration::from_secs(20));

    cleanup();

    for payload_size in PAYLOAD_SIZES {
        let mut rng = StdRng::seed_from_u64(SEED);
        let payload = generate_payload(&mut rng, *payload_size);

        let dir = wal_dir(&format!("plain_{payload_size}"));
        let wal = Wal::open(&dir).expect("failed to open WAL");
        group.bench_with_input(
            BenchmarkId::new("plain", payload_size),
            payload_size,
            |b, _| {
                b.iter(|| {
                    wal.append(OpType::CreateNode, black_box(&payload))
                        .expect("append failed")
                });
            },
        );
        wal.close().expect("close failed");

        let dir = wal_dir(&format!("compressed_{payload_size}"));
        let wal = CompressedWal::open(&dir).expect("failed to open compressed WAL");
        group.bench_with_input(
            BenchmarkId::new("compressed", payload_size),
            payload_size,
            |b, _| {
                b.iter(|| {
                    wal.append(OpType::CreateNode, black_box(&payload))
                        .expect("append failed")
                });
            },
        );
        wal.close().expect("close failed");
    }

    group.finish();
    cleanup();
}

criterion_group!(benches, append_latency);
criterion_main!(benches);
