use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tessera_core::TileGrid;

/// Grow a `size × size` block of tiles from the seed, row by row.
fn filled_block(size: i32) -> TileGrid {
    let mut grid = TileGrid::seeded();
    for y in 0..size {
        for x in 0..size {
            grid.add_tile(x, y, 1, 0.5);
        }
    }
    grid
}

fn bench_add_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("Grid Mutations");
    group.throughput(Throughput::Elements(32 * 32));

    group.bench_function("fill_block_32x32", |b| {
        b.iter(|| black_box(filled_block(black_box(32))))
    });

    group.finish();
}

fn bench_remove_tile(c: &mut Criterion) {
    let mut group = c.benchmark_group("Grid Mutations");
    let block = filled_block(32);

    group.bench_function("clear_block_32x32", |b| {
        b.iter(|| {
            let mut grid = block.clone();
            for y in (0..32).rev() {
                for x in (0..32).rev() {
                    grid.remove_tile(x, y);
                }
            }
            black_box(grid);
        })
    });

    group.finish();
}

fn bench_repaint(c: &mut Criterion) {
    let mut grid = filled_block(32);
    let mut kind = 1;

    c.bench_function("repaint_single_tile", |b| {
        b.iter(|| {
            kind = kind % 7 + 1;
            black_box(grid.add_tile(black_box(16), black_box(16), kind, 0.5));
        })
    });
}

criterion_group!(benches, bench_add_tile, bench_remove_tile, bench_repaint);
criterion_main!(benches);
