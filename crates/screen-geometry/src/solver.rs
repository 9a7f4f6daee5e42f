//! Solving [`ScreenToImageParameters`] from correspondences.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::CalibrationError;
use crate::homography::{screen_chisq, solve, RotationModel, SolverModel, Weighting};
use crate::mapper::CoordinateMapper;
use crate::matrix::TransMatrix;
use crate::mesh::Mesh;
use crate::mesh_builder::{MeshBuildReport, MeshBuilder, MeshBuilderParams};
use crate::params::{ScannerType, ScreenToImageParameters, SolverPoint};
use crate::ransac::{ransac, RansacParams, RansacResult};

/// Tilt search covers `-TILT_RANGE..=TILT_RANGE` on both axes.
const TILT_RANGE: f64 = 0.003;
const TILT_STEPS: usize = 21;
const TILT_REFINEMENTS: usize = 10;

/// Parameters of [`solve_geometry`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    /// Single weighted least-squares fit instead of RANSAC.
    pub weighted: bool,
    /// Image position the weighted fit favors.
    pub weight_center: Point2<f64>,
    /// Fit a perspective and search the tilt (needs more than 10 points).
    pub optimize_tilt: bool,
    pub ransac: RansacParams,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            weighted: false,
            weight_center: Point2::origin(),
            optimize_tilt: true,
            ransac: RansacParams::default(),
        }
    }
}

/// Output of [`solve_geometry`].
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    pub params: ScreenToImageParameters,
    /// Screen-space chi-square of the fit.
    pub chisq: f64,
    /// Present unless the weighted fit was used.
    pub ransac: Option<RansacResult>,
}

/// Determine center, basis and (optionally) tilt of `params` from
/// correspondences. Nonlinear corrections of `params` are kept and applied
/// to the image positions before fitting; any mesh is dropped.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(params, points, config), fields(points = points.len()))
)]
pub fn solve_geometry(
    params: &ScreenToImageParameters,
    points: &[SolverPoint],
    image_width: usize,
    image_height: usize,
    config: &SolverParams,
) -> Result<SolveOutcome, CalibrationError> {
    if points.len() < 3 {
        return Err(CalibrationError::NotEnoughPoints {
            needed: 3,
            got: points.len(),
        });
    }
    let mut out = params.clone();
    out.mesh = None;
    out.center = Point2::origin();
    out.coordinate1 = Vector2::new(1.0, 0.0);
    out.coordinate2 = Vector2::new(0.0, 1.0);
    if config.optimize_tilt {
        out.tilt_x = 0.0;
        out.tilt_y = 0.0;
    }
    // With an identity linear part the mapper applies only the nonlinear
    // corrections.
    let map = CoordinateMapper::new(&out, image_width, image_height);

    let rotation = if config.optimize_tilt && points.len() > 10 {
        RotationModel::Constrained
    } else {
        RotationModel::None
    };
    let model = SolverModel {
        rotation,
        vertical_strips: params.screen_type.has_vertical_strips(),
        invert: false,
    };
    let scanner = params.scanner_type;

    let (matrix, chisq, ransac_result) = if config.weighted {
        let corrected: Vec<SolverPoint> = points
            .iter()
            .map(|p| SolverPoint {
                img: map.apply_early_correction(p.img),
                ..*p
            })
            .collect();
        let center = map.apply_early_correction(config.weight_center);
        let m = solve(&corrected, model, scanner, Weighting::Image(center))?;
        let chisq = screen_chisq(&m, &corrected, model.vertical_strips);
        (m, chisq, None)
    } else {
        let r = ransac(points, model, scanner, Some(&map), &config.ransac, None)?;
        (r.matrix, r.chisq, Some(r))
    };

    let fitted = |s: Point2<f64>| map.to_img(matrix.perspective_transform(s));
    out.center = fitted(Point2::origin());
    out.coordinate1 = fitted(Point2::new(1.0, 0.0)) - out.center;
    out.coordinate2 = fitted(Point2::new(0.0, 1.0)) - out.center;

    if rotation == RotationModel::Constrained {
        let (tx, ty) = search_tilt(&out, &map, &matrix);
        out.tilt_x = tx;
        out.tilt_y = ty;
    }
    log::debug!(
        "solved center ({:.3}, {:.3}) basis ({:.4}, {:.4}) ({:.4}, {:.4}) tilt ({:.3e}, {:.3e}) chisq {:.4}",
        out.center.x,
        out.center.y,
        out.coordinate1.x,
        out.coordinate1.y,
        out.coordinate2.x,
        out.coordinate2.y,
        out.tilt_x,
        out.tilt_y,
        chisq
    );
    Ok(SolveOutcome {
        params: out,
        chisq,
        ransac: ransac_result,
    })
}

/// Grid search for the tilt whose mapper best reproduces `matrix` on a
/// coarse screen grid around the origin. The axis a translating lens
/// ignores stays at zero.
fn search_tilt(
    params: &ScreenToImageParameters,
    map: &CoordinateMapper,
    matrix: &TransMatrix,
) -> (f64, f64) {
    let targets: Vec<(Point2<f64>, Point2<f64>)> = [-100.0, 0.0, 100.0]
        .iter()
        .flat_map(|&y| [-100.0, 0.0, 100.0].map(|x| Point2::new(x, y)))
        .map(|s| (s, map.to_img(matrix.perspective_transform(s))))
        .collect();

    let mut trial = map.clone();
    let mut candidate = params.clone();
    let mut cost = |tx: f64, ty: f64| -> f64 {
        candidate.tilt_x = tx;
        candidate.tilt_y = ty;
        trial.update_linear_parameters(&candidate);
        let sq: f64 = targets
            .iter()
            .map(|(s, img)| (trial.to_img(*s) - img).norm_squared())
            .sum();
        if sq.is_finite() {
            sq
        } else {
            f64::INFINITY
        }
    };

    let free_x = params.scanner_type != ScannerType::LensMoveHorizontally;
    let free_y = params.scanner_type != ScannerType::LensMoveVertically;
    let axis = |free: bool, c: f64, half: f64, step: f64, k: usize| {
        if free {
            c - half + k as f64 * step
        } else {
            0.0
        }
    };
    let steps = |free: bool| if free { TILT_STEPS } else { 1 };

    let mut best = (0.0, 0.0);
    let mut best_sq = cost(0.0, 0.0);
    let (mut cx, mut cy) = (0.0, 0.0);
    let mut half = TILT_RANGE;
    for _ in 0..TILT_REFINEMENTS {
        let step = 2.0 * half / (TILT_STEPS - 1) as f64;
        for j in 0..steps(free_y) {
            let ty = axis(free_y, cy, half, step, j);
            for i in 0..steps(free_x) {
                let tx = axis(free_x, cx, half, step, i);
                let sq = cost(tx, ty);
                if sq < best_sq {
                    best_sq = sq;
                    best = (tx, ty);
                }
            }
        }
        (cx, cy) = best;
        half = step;
    }
    log::trace!("tilt search: ({:.3e}, {:.3e}) sq {:.3e}", best.0, best.1, best_sq);
    best
}

/// Build a mesh from `points` over the screen range `params` gives the
/// image. The result can be attached with
/// [`ScreenToImageParameters::with_mesh`].
pub fn build_mesh(
    params: &ScreenToImageParameters,
    points: &[SolverPoint],
    image_width: usize,
    image_height: usize,
    config: &MeshBuilderParams,
    cancel: Option<&AtomicBool>,
) -> Result<(Arc<Mesh>, MeshBuildReport), CalibrationError> {
    let (mesh, report) =
        MeshBuilder::new(params, points, image_width, image_height, config).build(cancel)?;
    Ok((Arc::new(mesh), report))
}
