use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use seglog::{Log, LogConfig};

// Appends into a two-segment ring so the log continuously recycles the
// head segment; measures the steady-state append + reclaim path.
fn append_expiring(c: &mut Criterion) {
  let mut group = c.benchmark_group("log_append_expiring");

  for blob_size in [8usize, 64, 512, 4096, 8192] {
    group.throughput(Throughput::Bytes(blob_size as u64));
    group.bench_with_input(
      BenchmarkId::from_parameter(blob_size),
      &blob_size,
      |b, &blob_size| {
        let mut log = Log::new(&LogConfig {
          memory_size: 2 * 1024 * 1024,
          segment_size: 1024 * 1024,
        })
        .unwrap();
        let blob = vec![0x61u8; blob_size];

        b.iter(|| {
          assert!(log.append(b"benchkey", &blob));
        });
      },
    );
  }

  group.finish();
}

criterion_group!(benches, append_expiring);
criterion_main!(benches);
