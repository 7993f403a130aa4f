//! Benchmarks for the converter cache's append/compact path (§4.5, §9 S2).
//!
//! Run with: cargo bench -p manager

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use manager::cache::varint::{read_varint, write_varint};
use manager::cache::{CompactionThresholds, ConverterCache};
use streamcore::{Direction, Packet};
use tempfile::TempDir;

fn packets(len: usize) -> Vec<Packet> {
  vec![Packet::new(Direction::ClientToServer, vec![b'x'; len])]
}

fn bench_set_data_append(c: &mut Criterion) {
  let rt = tokio::runtime::Runtime::new().unwrap();

  let mut group = c.benchmark_group("converter_cache_set_data_append");
  group.throughput(Throughput::Elements(1));

  group.bench_function("2kib_record", |b| {
    b.iter(|| {
      rt.block_on(async {
        let dir = TempDir::new().unwrap();
        let cache = ConverterCache::open(dir.path().join("bench.cidx"), CompactionThresholds::default()).unwrap();
        for id in 0..256u64 {
          cache.set_data(id, black_box(&packets(2048))).await.unwrap();
        }
      });
    });
  });

  group.finish();
}

fn bench_compaction(c: &mut Criterion) {
  let rt = tokio::runtime::Runtime::new().unwrap();

  let mut group = c.benchmark_group("converter_cache_compaction");

  for stream_count in [256, 1024, 4096].iter() {
    group.throughput(Throughput::Elements(*stream_count as u64));
    group.bench_with_input(BenchmarkId::from_parameter(stream_count), stream_count, |b, &stream_count| {
      b.iter(|| {
        rt.block_on(async {
          let dir = TempDir::new().unwrap();
          let cache = ConverterCache::open(
            dir.path().join("bench.cidx"),
            CompactionThresholds { min_free_bytes: 64 * 1024, min_free_ratio: 0.3 },
          )
          .unwrap();

          for id in 0..stream_count {
            cache.set_data(id as u64, &packets(2048)).await.unwrap();
          }
          // Overwrite every even stream with a tiny record to force reclaimable
          // free space past the compaction threshold.
          for id in (0..stream_count).step_by(2) {
            cache.set_data(black_box(id as u64), &packets(1)).await.unwrap();
          }
        });
      });
    });
  }

  group.finish();
}

fn bench_varint(c: &mut Criterion) {
  let mut group = c.benchmark_group("varint");

  for value in [44u64, 16_384, u32::MAX as u64, u64::MAX].iter() {
    group.bench_with_input(BenchmarkId::new("write", value), value, |b, &value| {
      b.iter(|| {
        let mut buf = Vec::with_capacity(10);
        write_varint(&mut buf, black_box(value));
        buf
      });
    });

    let mut encoded = Vec::new();
    write_varint(&mut encoded, *value);
    group.bench_with_input(BenchmarkId::new("read", value), &encoded, |b, encoded| {
      b.iter(|| {
        let mut pos = 0;
        read_varint(black_box(encoded), &mut pos)
      });
    });
  }

  group.finish();
}

criterion_group!(benches, bench_set_data_append, bench_compaction, bench_varint);
criterion_main!(benches);
