//! Benchmarks for track encoding and module loading.
//!
//! Run with: cargo bench --bench load_bench -p um-formats

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use um_formats::{load_module, LoadOptions};
use um_ir::{Opcode, TrackWriter};

const PATTERN_BYTES: usize = 64 * 4 * 4;

/// A "M.K." module whose patterns carry a note, a sample and a volume slide
/// on every other row, with one 4 KiB sample.
fn synthetic_mod(patterns: usize) -> Vec<u8> {
    let mut data = vec![0u8; 1084];
    data[..5].copy_from_slice(b"bench");
    // sample 1: 2048 words, full volume
    data[42..44].copy_from_slice(&2048u16.to_be_bytes());
    data[45] = 64;
    data[950] = patterns as u8;
    for (i, o) in data[952..952 + patterns].iter_mut().enumerate() {
        *o = i as u8;
    }
    data[1080..1084].copy_from_slice(b"M.K.");

    for p in 0..patterns {
        for row in 0..64 {
            for _ in 0..4 {
                let cell: [u8; 4] = if row % 2 == 0 {
                    [0x01, 0xac, 0x1a, 0x04]
                } else {
                    [0; 4]
                };
                data.extend_from_slice(&cell);
            }
        }
        debug_assert_eq!(data.len(), 1084 + (p + 1) * PATTERN_BYTES);
    }
    data.extend((0..4096u32).map(|i| (i % 251) as u8));
    data
}

fn bench_track_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("track_encoding");

    for rows in [64usize, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(rows), rows, |b, &rows| {
            let mut w = TrackWriter::new();
            b.iter(|| {
                w.reset();
                for row in 0..rows {
                    if row % 4 == 0 {
                        w.instrument(0);
                        w.note(48 + (row % 12) as u8);
                        w.effect(Opcode::PtEffectA, 0x04);
                    }
                    w.newline();
                }
                black_box(w.finish());
            });
        });
    }

    group.finish();
}

fn bench_mod_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("mod_load");

    for patterns in [1usize, 16, 64].iter() {
        let data = synthetic_mod(*patterns);
        group.bench_with_input(
            BenchmarkId::from_parameter(patterns),
            &data,
            |b, data| {
                b.iter(|| black_box(load_module(data, LoadOptions::default())));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_track_encoding, bench_mod_load);
criterion_main!(benches);
