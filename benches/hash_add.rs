//! Hot-path benchmarks: matrix-vector product and the atomic add.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use mercount::{Array, SquareMatrix};

fn bench_matrix_times(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let mut m = SquareMatrix::new(42);
    m.randomize_pseudo_inverse(&mut rng);
    let keys: Vec<u64> = (0..1024).map(|_| rng.gen::<u64>() & ((1 << 42) - 1)).collect();

    let mut g = c.benchmark_group("matrix");
    g.throughput(Throughput::Elements(keys.len() as u64));
    g.bench_function("times_42bit", |b| {
        b.iter(|| {
            let mut acc = 0u64;
            for &k in &keys {
                acc ^= m.times(black_box(k));
            }
            acc
        })
    });
    g.finish();
}

fn bench_array_add(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(2);
    let keys: Vec<u64> = (0..4096).map(|_| rng.gen::<u64>() & ((1 << 42) - 1)).collect();

    let mut g = c.benchmark_group("array");
    g.throughput(Throughput::Elements(keys.len() as u64));
    g.bench_function("add_distinct_21mers", |b| {
        let ary = Array::new(1 << 16, 42, 7, 62).unwrap();
        b.iter(|| {
            for &k in &keys {
                let _ = ary.add(black_box(k), 1);
            }
        })
    });
    g.bench_function("add_hot_key", |b| {
        let ary = Array::new(1 << 16, 42, 7, 62).unwrap();
        b.iter(|| {
            for _ in 0..keys.len() {
                let _ = ary.add(black_box(0xABCDEF), 1);
            }
        })
    });
    g.finish();
}

criterion_group!(benches, bench_matrix_times, bench_array_add);
criterion_main!(benches);
