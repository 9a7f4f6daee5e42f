use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{Point2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use screen_geometry::{
    build_mesh, ransac, CoordinateMapper, MeshBuilderParams, RansacParams, RotationModel,
    ScannerType, ScreenToImageParameters, SolverModel, SolverPoint,
};

const WIDTH: usize = 2000;
const HEIGHT: usize = 1500;

fn planted() -> ScreenToImageParameters {
    ScreenToImageParameters {
        center: Point2::new(1000.0, 750.0),
        coordinate1: Vector2::new(9.5, 0.4),
        coordinate2: Vector2::new(-0.3, 9.7),
        tilt_x: 0.0001,
        tilt_y: -0.00005,
        ..Default::default()
    }
}

/// Correspondences on a screen grid with pixel noise and 10% outliers.
fn observations(half: i32, spacing: f64) -> Vec<SolverPoint> {
    let map = CoordinateMapper::new(&planted(), WIDTH, HEIGHT);
    let mut rng = StdRng::seed_from_u64(42);
    let mut pts = Vec::new();
    for j in -half..=half {
        for i in -half..=half {
            let s = Point2::new(i as f64 * spacing, j as f64 * spacing);
            let mut img = map.to_img(s);
            if rng.gen_range(0.0..1.0) < 0.1 {
                img.x += rng.gen_range(-50.0..50.0);
                img.y += rng.gen_range(-50.0..50.0);
            } else {
                img.x += rng.gen_range(-0.2..0.2);
                img.y += rng.gen_range(-0.2..0.2);
            }
            pts.push(SolverPoint::new(img, s));
        }
    }
    pts
}

fn bench_ransac(c: &mut Criterion) {
    let pts = observations(15, 6.0);
    let params = RansacParams::default();
    for (name, rotation) in [
        ("ransac_affine_961", RotationModel::None),
        ("ransac_constrained_961", RotationModel::Constrained),
    ] {
        let model = SolverModel::new(rotation);
        c.bench_function(name, |b| {
            b.iter(|| {
                let r = ransac(
                    black_box(&pts),
                    model,
                    ScannerType::FixedLens,
                    None,
                    black_box(&params),
                    None,
                );
                black_box(r.map(|r| r.inliers).unwrap_or(0))
            })
        });
    }
}

fn bench_mesh(c: &mut Criterion) {
    let pts = observations(30, 3.5);
    let params = planted();
    let config = MeshBuilderParams {
        step: 20.0,
        ..Default::default()
    };
    c.bench_function("mesh_build_3721", |b| {
        b.iter(|| {
            let built = build_mesh(
                black_box(&params),
                black_box(&pts),
                WIDTH,
                HEIGHT,
                &config,
                None,
            );
            black_box(built.map(|(m, _)| m.width()).unwrap_or(0))
        })
    });
}

criterion_group!(benches, bench_ransac, bench_mesh);
criterion_main!(benches);
