//! Solve the geometry of a synthetic scan and report it as JSON.
//!
//! Usage: `cargo run --example solve_grid -- [config.json]`. The optional
//! config overrides the solver and mesh parameters.

use std::{env, fs};

use nalgebra::{Point2, Vector2};
use screen_geometry::{
    build_mesh, init_with_level, solve_geometry, CoordinateMapper, MeshBuilderParams,
    ScannerType, ScreenToImageParameters, SolverParams, SolverPoint,
};
use serde::{Deserialize, Serialize};

const WIDTH: usize = 1600;
const HEIGHT: usize = 1200;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExampleConfig {
    solver: SolverParams,
    mesh: MeshBuilderParams,
    /// Also fit a mesh after the projective model.
    with_mesh: bool,
}

#[derive(Debug, Serialize)]
struct SolveReport {
    points: usize,
    inliers: Option<usize>,
    chisq: f64,
    params: ScreenToImageParameters,
    screen_range: [i64; 4],
    mesh_nodes: Option<[usize; 2]>,
    max_mesh_deviation: Option<f64>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_with_level(log::LevelFilter::Info)?;
    let cfg: ExampleConfig = match env::args().nth(1) {
        Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
        None => ExampleConfig::default(),
    };

    let truth = ScreenToImageParameters {
        center: Point2::new(812.0, 590.0),
        coordinate1: Vector2::new(10.2, 0.6),
        coordinate2: Vector2::new(-0.5, 10.4),
        tilt_x: 0.00015,
        tilt_y: 0.0001,
        scanner_type: ScannerType::FixedLensSensorMoveHorizontally,
        ..Default::default()
    };
    let points = synthesize(&truth);
    log::info!("synthesized {} correspondences", points.len());

    let start = ScreenToImageParameters {
        scanner_type: truth.scanner_type,
        ..Default::default()
    };
    let out = solve_geometry(&start, &points, WIDTH, HEIGHT, &cfg.solver)?;
    let map = CoordinateMapper::new(&out.params, WIDTH, HEIGHT);
    let range = map.get_range_for_image(WIDTH, HEIGHT);

    let mut mesh_nodes = None;
    let mut max_mesh_deviation = None;
    if cfg.with_mesh {
        let (mesh, report) = build_mesh(&out.params, &points, WIDTH, HEIGHT, &cfg.mesh, None)?;
        log::info!(
            "mesh {}x{} after {} growth steps",
            report.width,
            report.height,
            report.growth_iterations
        );
        mesh_nodes = Some([report.width, report.height]);
        let meshed = CoordinateMapper::new(&out.params.clone().with_mesh(mesh), WIDTH, HEIGHT);
        max_mesh_deviation = points
            .iter()
            .map(|p| (meshed.to_img(p.scr) - p.img).norm())
            .reduce(f64::max);
    }

    let report = SolveReport {
        points: points.len(),
        inliers: out.ransac.as_ref().map(|r| r.inliers),
        chisq: out.chisq,
        params: out.params,
        screen_range: [range.xshift, range.yshift, range.width, range.height],
        mesh_nodes,
        max_mesh_deviation,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Grid of correspondences with a few wrong screen assignments.
fn synthesize(truth: &ScreenToImageParameters) -> Vec<SolverPoint> {
    let map = CoordinateMapper::new(truth, WIDTH, HEIGHT);
    let mut points = Vec::new();
    for j in -6..=6 {
        for i in -6..=6 {
            let scr = Point2::new(i as f64 * 8.0, j as f64 * 8.0);
            let mut img = map.to_img(scr);
            if (i * 7 + j * 3) % 17 == 0 && i != 0 {
                img.x += 35.0;
            }
            points.push(SolverPoint::new(img, scr));
        }
    }
    points
}
