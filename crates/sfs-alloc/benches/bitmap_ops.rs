//! Benchmark: packed bitmap scan helpers.
//!
//! Measures the linear-scan primitives the allocator is built on, over a
//! realistic 25600-block image bitmap with scattered free clusters.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sfs_alloc::{bitmap_count_set, bitmap_find_set};

/// Build a 100 MiB-image bitmap (25600 bits): mostly allocated, with a
/// 16-block free cluster every ~600 blocks.
fn make_bitmap() -> Vec<u8> {
    let mut bm = vec![0_u8; 3200];
    let mut pos = 200_usize;
    while pos + 16 < 25_600 {
        for i in pos..pos + 16 {
            bm[i / 8] |= 1 << (i % 8);
        }
        pos += 600;
    }
    bm
}

fn bench_count_set(c: &mut Criterion) {
    let bm = make_bitmap();
    c.bench_function("bitmap_count_set", |b| {
        b.iter(|| black_box(bitmap_count_set(black_box(&bm), 25_600)));
    });
}

fn bench_find_set(c: &mut Criterion) {
    let bm = make_bitmap();
    let mut group = c.benchmark_group("bitmap_find_set");

    group.bench_function("from_start", |b| {
        b.iter(|| black_box(bitmap_find_set(black_box(&bm), 25_600, 0)));
    });

    group.bench_function("from_middle", |b| {
        b.iter(|| black_box(bitmap_find_set(black_box(&bm), 25_600, black_box(12_800))));
    });

    group.finish();
}

criterion_group!(benches, bench_count_set, bench_find_set);
criterion_main!(benches);
