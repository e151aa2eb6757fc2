use criterion::{black_box, criterion_group, criterion_main, Criterion};
use facekit_core::types::squared_distance;
use facekit_core::SpacePartitionTree;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const DIM: usize = 16;
const POINTS: usize = 2_000;

fn random_points(rng: &mut StdRng, n: usize) -> Vec<Vec<f32>> {
    (0..n)
        .map(|_| (0..DIM).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
        .collect()
}

fn bench_knn(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let points = random_points(&mut rng, POINTS);
    let queries = random_points(&mut rng, 64);

    let mut tree = SpacePartitionTree::new();
    for (i, p) in points.iter().enumerate() {
        tree.insert(p, i as i64).expect("insert");
    }

    c.bench_function("range_limited_knn k=5", |b| {
        b.iter(|| {
            for q in &queries {
                black_box(tree.range_limited_knn(black_box(q), f32::MAX, 5).expect("query"));
            }
        })
    });

    c.bench_function("linear scan k=5", |b| {
        b.iter(|| {
            for q in &queries {
                let mut d: Vec<f32> = points.iter().map(|p| squared_distance(q, p)).collect();
                d.sort_by(|a, b| a.total_cmp(b));
                d.truncate(5);
                black_box(d);
            }
        })
    });
}

fn bench_insert(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(7);
    let points = random_points(&mut rng, POINTS);

    c.bench_function("insert 2000", |b| {
        b.iter(|| {
            let mut tree = SpacePartitionTree::new();
            for (i, p) in points.iter().enumerate() {
                tree.insert(black_box(p), i as i64).expect("insert");
            }
            black_box(tree.len())
        })
    });
}

criterion_group!(benches, bench_knn, bench_insert);
criterion_main!(benches);
