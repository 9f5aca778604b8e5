//! Benchmarks for shader assembly and host-side layout math.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ngrav::shader_sources as shaders;
use ngrav::{Assignment, LevelSet, PackedLayout};

fn bench_shader_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("shader_assembly");

    group.bench_function("deposit_cic", |b| {
        b.iter(|| black_box(shaders::deposit_wgsl(Assignment::Cic, 4)))
    });
    group.bench_function("poisson", |b| b.iter(|| black_box(shaders::poisson_wgsl())));
    group.bench_function("traversal_monopole", |b| {
        b.iter(|| black_box(shaders::traversal_wgsl(false, false, 1)))
    });
    group.bench_function("traversal_quadrupole_masked", |b| {
        b.iter(|| black_box(shaders::traversal_wgsl(true, true, 2)))
    });

    group.finish();
}

fn bench_layout_math(c: &mut Criterion) {
    let mut group = c.benchmark_group("packed_layout");

    for n in [16u32, 64, 128] {
        let layout = PackedLayout::new(n, 8.min(n)).unwrap();
        group.bench_with_input(BenchmarkId::new("voxel_index_sweep", n), &layout, |b, l| {
            b.iter(|| {
                let mut acc = 0u64;
                for z in 0..l.n() {
                    for y in 0..l.n() {
                        for x in 0..l.n() {
                            acc += l.voxel_index([x, y, z]) as u64;
                        }
                    }
                }
                black_box(acc)
            })
        });
    }

    group.bench_function("level_set_build", |b| {
        b.iter(|| black_box(LevelSet::new(8, 8).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_shader_assembly, bench_layout_math);
criterion_main!(benches);
