use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use delve_index::chunker::{ChunkerConfig, chunk_text};
use delve_index::hash::content_hash;
use std::hint::black_box;

fn generate_source(lines: usize) -> String {
    let line = "    let value = compute(input, &mut state).unwrap_or_default();\n";
    line.repeat(lines)
}

fn chunking(c: &mut Criterion) {
    let mut group = c.benchmark_group("chunk_text");
    let config = ChunkerConfig::default();

    for lines in [100, 1_000, 10_000] {
        let input = generate_source(lines);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("lines", lines), &input, |b, input| {
            b.iter(|| chunk_text(black_box(input), &config));
        });
    }

    group.finish();
}

fn hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("content_hash");

    for size in [1_000, 100_000] {
        let input = generate_source(size / 64 + 1);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_with_input(BenchmarkId::new("bytes", size), &input, |b, input| {
            b.iter(|| content_hash(black_box(input.as_bytes())));
        });
    }

    group.finish();
}

criterion_group!(benches, chunking, hashing);
criterion_main!(benches);
