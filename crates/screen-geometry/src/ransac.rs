//! Robust model fitting by random sample consensus.

use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::Vector2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::CalibrationError;
use crate::homography::{screen_chisq, solve, RotationModel, SolverModel, Weighting};
use crate::mapper::CoordinateMapper;
use crate::matrix::TransMatrix;
use crate::params::{ScannerType, SolverPoint};

/// Parameters of [`ransac`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Iteration budget.
    pub max_iters: usize,
    /// Largest per-axis image residual (px) of an inlier.
    pub inlier_threshold: f64,
    /// Largest screen x residual of an inlier on strip screens.
    pub strip_inlier_threshold: f64,
    /// Redraws of a degenerate sample before giving up.
    pub max_sample_attempts: usize,
    /// Seed of the per-call random generator.
    pub seed: u64,
    /// Shrink the budget as the inlier ratio becomes known.
    pub adaptive: bool,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 1.0,
            strip_inlier_threshold: 0.1,
            max_sample_attempts: 10_000,
            seed: 0,
            adaptive: false,
        }
    }
}

/// Output of [`ransac`].
#[derive(Clone, Debug)]
pub struct RansacResult {
    /// Screen to (early-corrected) image transform.
    pub matrix: TransMatrix,
    /// Screen-space chi-square over the inliers.
    pub chisq: f64,
    pub inliers: usize,
    pub inlier_mask: Vec<bool>,
    pub iterations: usize,
    /// The matrix was refitted over all inliers.
    pub refined: bool,
}

struct Candidate {
    matrix: TransMatrix,
    inliers: usize,
    chisq: f64,
    mask: Vec<bool>,
}

/// Residual test of every point against `matrix`.
fn score(
    matrix: &TransMatrix,
    points: &[SolverPoint],
    model: SolverModel,
    params: &RansacParams,
) -> (usize, f64, Vec<bool>) {
    let mut inliers = 0;
    let mut chisq = 0.0;
    let mut mask = vec![false; points.len()];
    for (p, m) in points.iter().zip(mask.iter_mut()) {
        let (inside, sq) = if model.vertical_strips {
            match matrix.inverse_perspective_transform(p.img) {
                Some(s) => {
                    let dx = s.x - p.scr.x;
                    (dx.abs() < params.strip_inlier_threshold, dx * dx)
                }
                None => (false, 0.0),
            }
        } else {
            let d = matrix.perspective_transform(p.scr) - p.img;
            (
                d.x.abs() <= params.inlier_threshold && d.y.abs() <= params.inlier_threshold,
                d.norm_squared(),
            )
        };
        if inside && sq.is_finite() {
            *m = true;
            inliers += 1;
            chisq += sq;
        }
    }
    (inliers, chisq, mask)
}

/// Fit `model` to `points` tolerating outliers.
///
/// Image positions are early-corrected through `mapper` first when given, so
/// the result maps screen to corrected image. Minimal samples are drawn from
/// a generator seeded with `params.seed`; the same input always yields the
/// same result.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(points, mapper, params, cancel), fields(points = points.len()))
)]
pub fn ransac(
    points: &[SolverPoint],
    model: SolverModel,
    scanner: ScannerType,
    mapper: Option<&CoordinateMapper>,
    params: &RansacParams,
    cancel: Option<&AtomicBool>,
) -> Result<RansacResult, CalibrationError> {
    let points: Vec<SolverPoint> = match mapper {
        Some(map) => points
            .iter()
            .map(|p| SolverPoint {
                img: map.apply_early_correction(p.img),
                ..*p
            })
            .collect(),
        None => points.to_vec(),
    };
    let n = points.len();
    // A translating lens removes the perspective along one axis, leaving
    // the minimal sample underdetermined on the other.
    let nsamples = model.min_samples()
        + usize::from(model.rotation == RotationModel::Constrained && !scanner.is_fixed_lens());
    if n < nsamples {
        return Err(CalibrationError::NotEnoughPoints {
            needed: nsamples,
            got: n,
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<Candidate> = None;
    let mut budget = params.max_iters;
    let mut iterations = 0;
    let mut most_inliers = 0;
    let mut sample = Vec::with_capacity(nsamples);

    while iterations < budget {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(CalibrationError::Cancelled);
        }
        iterations += 1;

        let mut attempts = 0;
        let matrix = loop {
            sample.clear();
            sample.extend(
                rand::seq::index::sample(&mut rng, n, nsamples)
                    .iter()
                    .map(|i| points[i]),
            );
            match solve(&sample, model, scanner, Weighting::None) {
                Ok(m) => break m,
                Err(CalibrationError::ColinearPoints | CalibrationError::NumericalDivergence) => {
                    attempts += 1;
                    if attempts >= params.max_sample_attempts {
                        log::error!(
                            "no non-degenerate sample after {} attempts; points are always colinear",
                            attempts
                        );
                        return Err(CalibrationError::ColinearPoints);
                    }
                }
                Err(e) => return Err(e),
            }
        };

        let (inliers, chisq, mask) = score(&matrix, &points, model, params);
        most_inliers = most_inliers.max(inliers);
        if inliers < nsamples {
            continue;
        }
        let better = best
            .as_ref()
            .map_or(true, |b| inliers > b.inliers || (inliers == b.inliers && chisq < b.chisq));
        if !better {
            continue;
        }
        best = Some(Candidate {
            matrix,
            inliers,
            chisq,
            mask,
        });
        if inliers == n {
            break;
        }
        if params.adaptive {
            if chisq < n as f64 {
                break;
            }
            let ratio = inliers as f64 / n as f64;
            let needed = (0.01_f64.ln() / (1.0 - ratio.powi(4)).ln()).ceil();
            if needed.is_finite() && needed >= 0.0 {
                budget = budget.min((needed as usize).max(iterations));
            }
        }
    }

    let Some(best) = best else {
        log::error!(
            "failed to find inliers: no sample explains {} points ({} at best after {} iterations)",
            nsamples,
            most_inliers,
            iterations
        );
        return Err(CalibrationError::NotEnoughPoints {
            needed: nsamples,
            got: most_inliers,
        });
    };

    let inlier_points: Vec<SolverPoint> = points
        .iter()
        .zip(&best.mask)
        .filter(|(_, &m)| m)
        .map(|(p, _)| *p)
        .collect();

    if best.inliers > nsamples {
        match solve(&inlier_points, model, scanner, Weighting::None) {
            Ok(matrix) => {
                // Inliers are reported for the refitted matrix.
                let (inliers, _, mask) = score(&matrix, &points, model, params);
                let refit_points: Vec<SolverPoint> = points
                    .iter()
                    .zip(&mask)
                    .filter(|(_, &m)| m)
                    .map(|(p, _)| *p)
                    .collect();
                let chisq = screen_chisq(&matrix, &refit_points, model.vertical_strips);
                log::debug!(
                    "ransac: {} of {} inliers ({} before refit) after {} iterations, chisq {:.4}",
                    inliers,
                    n,
                    best.inliers,
                    iterations,
                    chisq
                );
                return Ok(RansacResult {
                    matrix,
                    chisq,
                    inliers,
                    inlier_mask: mask,
                    iterations,
                    refined: true,
                });
            }
            Err(e) => log::warn!("refit over {} inliers failed: {}", best.inliers, e),
        }
    } else {
        log::warn!(
            "failed to find inliers ({} of {} after {} iterations)",
            best.inliers,
            n,
            iterations
        );
    }
    Ok(RansacResult {
        chisq: screen_chisq(&best.matrix, &inlier_points, model.vertical_strips),
        matrix: best.matrix,
        inliers: best.inliers,
        inlier_mask: best.mask,
        iterations,
        refined: false,
    })
}

/// Image residual of one correspondence under a screen-to-image transform.
pub fn residual(matrix: &TransMatrix, p: &SolverPoint) -> Vector2<f64> {
    matrix.perspective_transform(p.scr) - p.img
}
