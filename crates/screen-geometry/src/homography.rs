//! Linear least-squares fits of screen-to-image transforms.
//!
//! Every model is linear in its unknowns once the denominators are multiplied
//! out. Both point sets are conditioned with [`PointNormalizer`] first and
//! the solution is mapped back afterwards.

use nalgebra::{DMatrix, DVector, Matrix3, Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::matrix::TransMatrix;
use crate::normalize::PointNormalizer;
use crate::params::{ScannerType, SolverPoint};

/// Largest unknown count of any model.
const MAX_UNKNOWNS: usize = 10;

/// Squared screen residual at which a point stops contributing to
/// [`screen_chisq`].
pub const CHISQ_CAP: f64 = 10_000.0;

/// Screen points used by [`five_point_matrix`], in argument order.
pub const FIVE_POINT_SCREEN: [[f64; 2]; 5] = [
    [0.0, 0.0],
    [1000.0, 0.0],
    [0.0, 1000.0],
    [1000.0, 1000.0],
    [2000.0, 3000.0],
];

/// Perspective freedom of the fitted model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationModel {
    /// Affine.
    #[default]
    None,
    /// One shared denominator (a homography); a translating lens drops the
    /// denominator along its moving axis.
    Constrained,
    /// Independent x and y denominators.
    Free,
}

/// Which transform family to fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SolverModel {
    pub rotation: RotationModel,
    /// Only screen x is observable (strip screens). The fit then runs image
    /// to screen and is inverted.
    pub vertical_strips: bool,
    /// Fit image to screen instead of screen to image.
    pub invert: bool,
}

#[derive(Clone, Copy)]
struct Row {
    coef: [f64; MAX_UNKNOWNS],
    rhs: f64,
}

impl Row {
    const ZERO: Row = Row {
        coef: [0.0; MAX_UNKNOWNS],
        rhs: 0.0,
    };
}

/// Builds the equations of one sample from normalized source `s` and
/// target `d`.
type RowBuilder = fn(ScannerType, Point2<f64>, Point2<f64>) -> [Row; 2];

struct ModelShape {
    unknowns: usize,
    equations: usize,
    rows: RowBuilder,
}

static BASE: ModelShape = ModelShape {
    unknowns: 6,
    equations: 2,
    rows: base_rows,
};
static CONSTRAINED: ModelShape = ModelShape {
    unknowns: 8,
    equations: 2,
    rows: constrained_rows,
};
static FREE: ModelShape = ModelShape {
    unknowns: 10,
    equations: 2,
    rows: free_rows,
};
static STRIPS: ModelShape = ModelShape {
    unknowns: 3,
    equations: 1,
    rows: strip_rows,
};
static STRIPS_ROTATION: ModelShape = ModelShape {
    unknowns: 5,
    equations: 1,
    rows: strip_rotation_rows,
};

fn base_rows(_: ScannerType, s: Point2<f64>, d: Point2<f64>) -> [Row; 2] {
    let mut x = Row::ZERO;
    x.coef[..3].copy_from_slice(&[s.x, s.y, 1.0]);
    x.rhs = d.x;
    let mut y = Row::ZERO;
    y.coef[3..6].copy_from_slice(&[s.x, s.y, 1.0]);
    y.rhs = d.y;
    [x, y]
}

fn constrained_rows(scanner: ScannerType, s: Point2<f64>, d: Point2<f64>) -> [Row; 2] {
    let [mut x, mut y] = base_rows(scanner, s, d);
    if scanner != ScannerType::LensMoveHorizontally {
        x.coef[6] = -d.x * s.x;
        x.coef[7] = -d.x * s.y;
    }
    if scanner != ScannerType::LensMoveVertically {
        y.coef[6] = -d.y * s.x;
        y.coef[7] = -d.y * s.y;
    }
    [x, y]
}

fn free_rows(scanner: ScannerType, s: Point2<f64>, d: Point2<f64>) -> [Row; 2] {
    let [mut x, mut y] = base_rows(scanner, s, d);
    x.coef[6] = -d.x * s.x;
    x.coef[7] = -d.x * s.y;
    y.coef[8] = -d.y * s.x;
    y.coef[9] = -d.y * s.y;
    [x, y]
}

fn strip_rows(_: ScannerType, s: Point2<f64>, d: Point2<f64>) -> [Row; 2] {
    let mut x = Row::ZERO;
    x.coef[..3].copy_from_slice(&[d.x, d.y, 1.0]);
    x.rhs = s.x;
    [x, Row::ZERO]
}

fn strip_rotation_rows(scanner: ScannerType, s: Point2<f64>, d: Point2<f64>) -> [Row; 2] {
    let [mut x, unused] = strip_rows(scanner, s, d);
    x.coef[3] = -d.x * s.x;
    x.coef[4] = -d.y * s.x;
    [x, unused]
}

impl SolverModel {
    pub fn new(rotation: RotationModel) -> Self {
        Self {
            rotation,
            ..Default::default()
        }
    }

    pub fn strips(rotation: RotationModel) -> Self {
        Self {
            rotation,
            vertical_strips: true,
            invert: false,
        }
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    fn shape(&self) -> &'static ModelShape {
        match (self.vertical_strips, self.rotation) {
            (false, RotationModel::None) => &BASE,
            (false, RotationModel::Constrained) => &CONSTRAINED,
            (false, RotationModel::Free) => &FREE,
            (true, RotationModel::None) => &STRIPS,
            (true, _) => &STRIPS_ROTATION,
        }
    }

    pub fn unknowns(&self) -> usize {
        self.shape().unknowns
    }

    pub fn equations_per_sample(&self) -> usize {
        self.shape().equations
    }

    /// Smallest number of correspondences that determines the model.
    pub fn min_samples(&self) -> usize {
        let s = self.shape();
        s.unknowns.div_ceil(s.equations)
    }

    /// Source and target of the fit for one correspondence.
    fn roles(&self, p: &SolverPoint) -> (Point2<f64>, Point2<f64>) {
        if self.invert && !self.vertical_strips {
            (p.img, p.scr)
        } else {
            (p.scr, p.img)
        }
    }
}

/// Per-point weighting of [`solve`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum Weighting {
    #[default]
    None,
    /// Favor points near a screen position: `1 / (dist + 0.5)`.
    Screen(Point2<f64>),
    /// Favor points near an image position: `1 / (d² + 0.5)` with `d` the
    /// squared distance.
    Image(Point2<f64>),
}

/// Axis scales of weighting distances; a moving lens's axis counts 100x.
fn distance_scales(scanner: ScannerType) -> (f64, f64) {
    match scanner {
        ScannerType::LensMoveHorizontally => (100.0, 1.0),
        ScannerType::LensMoveVertically => (1.0, 100.0),
        _ => (1.0, 1.0),
    }
}

/// Normalized weights, zero for points dropped from large sets.
fn compute_weights(points: &[SolverPoint], scanner: ScannerType, weighting: Weighting) -> Vec<f64> {
    let (xs, ys) = distance_scales(scanner);
    let scaled_sq = |d: Vector2<f64>| d.x * d.x * xs * xs + d.y * d.y * ys * ys;
    let mut w: Vec<f64> = match weighting {
        Weighting::None => return vec![1.0; points.len()],
        Weighting::Screen(c) => points
            .iter()
            .map(|p| 1.0 / (scaled_sq(p.scr - c).sqrt() + 0.5))
            .collect(),
        Weighting::Image(c) => points
            .iter()
            .map(|p| {
                let d = scaled_sq(p.img - c);
                1.0 / (d * d + 0.5)
            })
            .collect(),
    };
    let max = w.iter().copied().fold(0.0_f64, f64::max);
    if max > 0.0 {
        for v in &mut w {
            *v /= max;
        }
    }
    if points.len() > 500 {
        let sum: f64 = w.iter().sum();
        let mut threshold = sum / 100.0;
        while w.iter().filter(|&&v| v >= threshold).count() < 100 {
            threshold /= 8.0;
        }
        let mut dropped = 0;
        for v in &mut w {
            if *v < threshold {
                *v = 0.0;
                dropped += 1;
            }
        }
        log::trace!("weighted solve drops {} of {} points", dropped, points.len());
    }
    w
}

/// Weighted least-squares fit of `model` to `points`.
///
/// The returned matrix maps screen to image (image to screen when
/// `model.invert`). Rank deficient input gives
/// [`CalibrationError::ColinearPoints`].
pub fn solve(
    points: &[SolverPoint],
    model: SolverModel,
    scanner: ScannerType,
    weighting: Weighting,
) -> Result<TransMatrix, CalibrationError> {
    let shape = model.shape();
    let needed = model.min_samples();
    if points.len() < needed {
        return Err(CalibrationError::NotEnoughPoints {
            needed,
            got: points.len(),
        });
    }
    let weights = compute_weights(points, scanner, weighting);
    let used: Vec<(&SolverPoint, f64)> = points
        .iter()
        .zip(weights)
        .filter(|(_, w)| *w > 0.0)
        .collect();
    if used.len() < needed {
        return Err(CalibrationError::NotEnoughPoints {
            needed,
            got: used.len(),
        });
    }

    let mut src_norm = PointNormalizer::new(scanner);
    let mut dst_norm = PointNormalizer::new(scanner);
    for (p, _) in &used {
        let (s, d) = model.roles(p);
        if model.vertical_strips {
            src_norm.account1_x_only(s);
        } else {
            src_norm.account1(s);
        }
        dst_norm.account1(d);
    }
    src_norm.finish1();
    dst_norm.finish1();
    for (p, _) in &used {
        let (s, d) = model.roles(p);
        if model.vertical_strips {
            src_norm.account2_x_only(s);
        } else {
            src_norm.account2(s);
        }
        dst_norm.account2(d);
    }
    let ts = src_norm.matrix();
    let td = dst_norm.matrix();

    let nrows = used.len() * shape.equations;
    let mut a = DMatrix::<f64>::zeros(nrows, shape.unknowns);
    let mut b = DVector::<f64>::zeros(nrows);
    for (k, (p, w)) in used.iter().enumerate() {
        let (s, d) = model.roles(p);
        let rows = (shape.rows)(
            scanner,
            ts.perspective_transform(s),
            td.perspective_transform(d),
        );
        let sw = w.sqrt();
        for (e, row) in rows.iter().take(shape.equations).enumerate() {
            let r = k * shape.equations + e;
            for c in 0..shape.unknowns {
                a[(r, c)] = row.coef[c] * sw;
            }
            b[r] = row.rhs * sw;
        }
    }

    let svd = a.svd(true, true);
    let max_sv = svd.singular_values.max();
    let eps = max_sv * 1e-12;
    if !(max_sv > 0.0) || svd.rank(eps) < shape.unknowns {
        return Err(CalibrationError::ColinearPoints);
    }
    let v = svd
        .solve(&b, eps)
        .map_err(|_| CalibrationError::ColinearPoints)?;
    solution_to_matrix(v.as_slice(), model, scanner, &ts, &td)
}

/// Place the solved unknowns, undo the normalization and bring the result
/// to canonical form.
fn solution_to_matrix(
    v: &[f64],
    model: SolverModel,
    scanner: ScannerType,
    ts: &TransMatrix,
    td: &TransMatrix,
) -> Result<TransMatrix, CalibrationError> {
    let get = |i: usize| v.get(i).copied().unwrap_or(0.0);
    if model.vertical_strips {
        let (r2, r3) = if model.rotation == RotationModel::None {
            ([0.0, 0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0])
        } else {
            ([get(3), get(4), 1.0, 0.0], [get(3), get(4), 0.0, 1.0])
        };
        let hn = TransMatrix::from_rows([
            [get(0), get(1), get(2), 0.0],
            [-get(1), get(0), 0.0, 0.0],
            r2,
            r3,
        ]);
        // Screen normalizer on the left: this fit runs image to screen.
        let ts_inv = ts.invert().ok_or(CalibrationError::NumericalDivergence)?;
        let img_to_scr = finalize(ts_inv.then_after(&hn).then_after(td))?;
        if model.invert {
            return Ok(img_to_scr);
        }
        let inv = img_to_scr
            .to_homography()
            .try_inverse()
            .ok_or(CalibrationError::ColinearPoints)?;
        return finalize(TransMatrix::from_homography(&inv));
    }

    let rotating_x = (model.rotation == RotationModel::Constrained
        && scanner != ScannerType::LensMoveHorizontally)
        || model.rotation == RotationModel::Free;
    let r2 = if rotating_x {
        [get(6), get(7), 1.0, 0.0]
    } else {
        [0.0, 0.0, 1.0, 0.0]
    };
    let r3 = match model.rotation {
        RotationModel::Free => [get(8), get(9), 0.0, 1.0],
        RotationModel::Constrained if scanner != ScannerType::LensMoveVertically => {
            [get(6), get(7), 0.0, 1.0]
        }
        _ => [0.0, 0.0, 0.0, 1.0],
    };
    let hn = TransMatrix::from_rows([
        [get(0), get(1), get(2), 0.0],
        [get(3), get(4), 0.0, get(5)],
        r2,
        r3,
    ]);
    let td_inv = td.invert().ok_or(CalibrationError::NumericalDivergence)?;
    finalize(td_inv.then_after(&hn).then_after(ts))
}

/// Fold the duplicated constant columns and scale so that `m33 == 1`.
fn finalize(t: TransMatrix) -> Result<TransMatrix, CalibrationError> {
    let mut m = t.m;
    m[(0, 2)] += m[(0, 3)];
    m[(0, 3)] = 0.0;
    m[(1, 3)] += m[(1, 2)];
    m[(1, 2)] = 0.0;
    m[(2, 2)] += m[(2, 3)];
    m[(2, 3)] = 0.0;
    m[(3, 3)] += m[(3, 2)];
    m[(3, 2)] = 0.0;
    let scale = m[(3, 3)];
    if !scale.is_finite() || scale.abs() < 1e-12 {
        return Err(CalibrationError::NumericalDivergence);
    }
    let out = TransMatrix::new(m / scale);
    if !out.is_finite() {
        return Err(CalibrationError::NumericalDivergence);
    }
    Ok(out)
}

/// Sum of squared screen residuals of `points` under `matrix` (screen to
/// image), each capped at [`CHISQ_CAP`]. Strip screens compare x only.
pub fn screen_chisq(matrix: &TransMatrix, points: &[SolverPoint], vertical_strips: bool) -> f64 {
    points
        .iter()
        .map(|p| match matrix.inverse_perspective_transform(p.img) {
            Some(s) => {
                let d = if vertical_strips {
                    (s.x - p.scr.x).powi(2)
                } else {
                    (s - p.scr).norm_squared()
                };
                if d.is_finite() {
                    d.min(CHISQ_CAP)
                } else {
                    CHISQ_CAP
                }
            }
            None => CHISQ_CAP,
        })
        .sum()
}

/// Exact free-rotation transform through five correspondences: the image
/// positions of the screen points in [`FIVE_POINT_SCREEN`].
///
/// With `invert` the result maps image to screen.
pub fn five_point_matrix(
    invert: bool,
    zero: Point2<f64>,
    x: Point2<f64>,
    y: Point2<f64>,
    xpy: Point2<f64>,
    txpy: Point2<f64>,
) -> Result<TransMatrix, CalibrationError> {
    let points: Vec<SolverPoint> = [zero, x, y, xpy, txpy]
        .iter()
        .zip(FIVE_POINT_SCREEN)
        .map(|(&img, [sx, sy])| SolverPoint::new(img, Point2::new(sx, sy)))
        .collect();
    let mut model = SolverModel::new(RotationModel::Free);
    model.invert = invert;
    solve(&points, model, ScannerType::FixedLens, Weighting::None)
}

/// Plain 3x3 homography of a transform with shared denominators.
pub fn as_homography(t: &TransMatrix) -> Option<Matrix3<f64>> {
    t.has_shared_denominator(1e-9).then(|| t.to_homography())
}
