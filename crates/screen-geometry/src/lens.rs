//! Radial lens warp correction.
//!
//! The correction is the DNG-style polynomial
//! `ratio(r²) = kr0 + kr1·r² + kr2·r⁴ + kr3·r⁶` with `r` measured relative
//! to the largest distance between the lens center and an image corner.
//! A corrected point `p` is seen in the scan at `c + (p - c) · ratio`.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Coefficients and center of the radial correction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LensWarpCorrectionParameters {
    pub kr: [f64; 4],
    /// Lens center in relative image coordinates (`0..1` on both axes).
    pub center: Point2<f64>,
}

impl Default for LensWarpCorrectionParameters {
    fn default() -> Self {
        Self {
            kr: [1.0, 0.0, 0.0, 0.0],
            center: Point2::new(0.5, 0.5),
        }
    }
}

impl LensWarpCorrectionParameters {
    pub fn is_noop(&self) -> bool {
        self.kr == [1.0, 0.0, 0.0, 0.0]
    }

    /// Scale factor at relative squared radius `rsq`; `rsq` saturates at 1.
    #[inline]
    pub fn ratio(&self, rsq: f64) -> f64 {
        let rsq = rsq.min(1.0);
        let k = &self.kr;
        k[0] + rsq * (k[1] + rsq * (k[2] + rsq * k[3]))
    }

    /// `r · ratio(r²)` is strictly increasing over the relative radius
    /// range `0..1`.
    pub fn is_monotone(&self) -> bool {
        let mut last = 0.0;
        for i in 1..=1024 * 1024 {
            let p = i as f64 / 1024.0;
            let next = p * self.ratio(p * p);
            if next <= last {
                return false;
            }
            if next > 1.0 || p >= 1.0 {
                return true;
            }
            last = next;
        }
        false
    }

    /// Rescale the coefficients so that `ratio(1) == 1`.
    ///
    /// Returns `false` (leaving the coefficients untouched) when the ratio at
    /// the border vanishes.
    pub fn normalize(&mut self) -> bool {
        let r1 = self.ratio(1.0);
        if !r1.is_finite() || r1.abs() < 1e-12 {
            return false;
        }
        for k in &mut self.kr {
            *k /= r1;
        }
        true
    }
}

/// Intervals of the tabulated forward radius used for inversion.
const INVERSE_TABLE_STEPS: usize = 1024;

/// Radial correction prepared for a concrete image.
#[derive(Clone, Debug)]
pub struct LensWarpCorrection {
    params: LensWarpCorrectionParameters,
    center: Point2<f64>,
    max_dist: f64,
    inv_max_dist_sq: f64,
    noop: bool,
    /// Scan radius at `k * max_dist / INVERSE_TABLE_STEPS`; empty when the
    /// correction is a no-op or not strictly increasing.
    inverse_table: Vec<f64>,
}

impl LensWarpCorrection {
    /// `center` is the lens center in image coordinates and `corners` the
    /// points whose farthest distance defines the unit radius.
    pub fn new(
        params: LensWarpCorrectionParameters,
        center: Point2<f64>,
        corners: &[Point2<f64>],
    ) -> Self {
        let max_dist = corners
            .iter()
            .map(|c| (c - center).norm())
            .fold(0.0_f64, f64::max);
        let noop = params.is_noop() || max_dist <= 0.0;
        let mut lens = Self {
            params,
            center,
            max_dist,
            inv_max_dist_sq: if max_dist > 0.0 {
                1.0 / (max_dist * max_dist)
            } else {
                0.0
            },
            noop,
            inverse_table: Vec::new(),
        };
        if !noop {
            lens.inverse_table = lens.tabulate();
        }
        lens
    }

    fn tabulate(&self) -> Vec<f64> {
        let h = self.max_dist / INVERSE_TABLE_STEPS as f64;
        let table: Vec<f64> = (0..=INVERSE_TABLE_STEPS)
            .map(|k| self.forward_radius(k as f64 * h))
            .collect();
        if table.windows(2).all(|w| w[1] > w[0]) {
            table
        } else {
            log::debug!("lens correction is not monotone; inverting by bisection");
            Vec::new()
        }
    }

    pub fn identity() -> Self {
        Self::new(LensWarpCorrectionParameters::default(), Point2::origin(), &[])
    }

    pub fn is_noop(&self) -> bool {
        self.noop
    }

    pub fn center(&self) -> Point2<f64> {
        self.center
    }

    pub fn max_dist(&self) -> f64 {
        self.max_dist
    }

    /// Corrected (ideal) position to the position seen in the scan.
    #[inline]
    pub fn corrected_to_scan(&self, p: Point2<f64>) -> Point2<f64> {
        self.corrected_to_scan_about(p, self.center)
    }

    /// Scan position to corrected position.
    #[inline]
    pub fn scan_to_corrected(&self, p: Point2<f64>) -> Point2<f64> {
        self.scan_to_corrected_about(p, self.center)
    }

    /// As [`corrected_to_scan`](Self::corrected_to_scan) with an explicit
    /// center; translating lenses move the center with the query point.
    pub fn corrected_to_scan_about(&self, p: Point2<f64>, center: Point2<f64>) -> Point2<f64> {
        if self.noop {
            return p;
        }
        let d = p - center;
        let ratio = self.params.ratio(d.norm_squared() * self.inv_max_dist_sq);
        center + d * ratio
    }

    pub fn scan_to_corrected_about(&self, p: Point2<f64>, center: Point2<f64>) -> Point2<f64> {
        if self.noop {
            return p;
        }
        let d = p - center;
        let dist = d.norm();
        if dist == 0.0 {
            return p;
        }
        center + d * (self.inverse_radius(dist) / dist)
    }

    #[inline]
    fn forward_radius(&self, r: f64) -> f64 {
        r * self.params.ratio(r * r * self.inv_max_dist_sq)
    }

    /// Solve `r · ratio(r² / max²) = dist` for `r`.
    fn inverse_radius(&self, dist: f64) -> f64 {
        let border = self.max_dist * self.params.ratio(1.0);
        if dist >= border && border > 0.0 {
            // Past the unit radius the ratio saturates and the map is linear.
            return dist * self.max_dist / border;
        }
        self.invert_by_table(dist)
            .unwrap_or_else(|| self.invert_by_bisection(dist))
    }

    /// Table lookup with linear interpolation, polished by fixed-slope
    /// Newton steps.
    fn invert_by_table(&self, dist: f64) -> Option<f64> {
        let table = &self.inverse_table;
        let k = table.partition_point(|&v| v <= dist);
        if k == 0 || k >= table.len() {
            return None;
        }
        let (lo, hi) = (table[k - 1], table[k]);
        let h = self.max_dist / INVERSE_TABLE_STEPS as f64;
        let slope = (hi - lo) / h;
        let mut r = (k - 1) as f64 * h + (dist - lo) / slope;
        for _ in 0..3 {
            r -= (self.forward_radius(r) - dist) / slope;
        }
        Some(r)
    }

    fn invert_by_bisection(&self, dist: f64) -> f64 {
        let mut lo = 0.0;
        let mut hi = self.max_dist;
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if mid == lo || mid == hi {
                break;
            }
            let ra = self.forward_radius(mid);
            if (ra - dist).abs() < 1e-10 * self.max_dist.max(1.0) {
                return mid;
            }
            if ra < dist {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corners(w: f64, h: f64) -> [Point2<f64>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(w, 0.0),
            Point2::new(0.0, h),
            Point2::new(w, h),
        ]
    }

    #[test]
    fn default_parameters_are_noop() {
        let p = LensWarpCorrectionParameters::default();
        assert!(p.is_noop());
        assert!(p.is_monotone());
        let l = LensWarpCorrection::new(p, Point2::new(50.0, 50.0), &corners(100.0, 100.0));
        let q = Point2::new(12.0, 77.0);
        assert_eq!(l.corrected_to_scan(q), q);
        assert_eq!(l.scan_to_corrected(q), q);
    }

    #[test]
    fn barrel_correction_round_trips() {
        let mut p = LensWarpCorrectionParameters {
            kr: [1.0, 0.02, -0.005, 0.001],
            center: Point2::new(0.5, 0.5),
        };
        assert!(p.normalize());
        assert!((p.ratio(1.0) - 1.0).abs() < 1e-12);
        assert!(p.is_monotone());

        let l = LensWarpCorrection::new(p, Point2::new(400.0, 300.0), &corners(800.0, 600.0));
        for q in [
            Point2::new(0.0, 0.0),
            Point2::new(401.0, 299.0),
            Point2::new(790.0, 20.0),
            Point2::new(1000.0, 900.0),
        ] {
            let back = l.corrected_to_scan(l.scan_to_corrected(q));
            assert!((back - q).norm() < 1e-6, "{q:?} -> {back:?}");
        }
    }

    #[test]
    fn strongly_negative_coefficient_is_not_monotone() {
        let p = LensWarpCorrectionParameters {
            kr: [1.0, -1.5, 0.0, 0.0],
            center: Point2::new(0.5, 0.5),
        };
        assert!(!p.is_monotone());
    }

    #[test]
    fn inverse_table_agrees_with_bisection() {
        let mut p = LensWarpCorrectionParameters {
            kr: [1.0, 0.03, -0.01, 0.002],
            center: Point2::new(0.5, 0.5),
        };
        assert!(p.normalize());
        let l = LensWarpCorrection::new(p, Point2::new(600.0, 450.0), &corners(1200.0, 900.0));
        assert_eq!(l.inverse_table.len(), INVERSE_TABLE_STEPS + 1);
        for k in 1..200 {
            let dist = k as f64 * 3.7;
            let table = l.invert_by_table(dist).expect("inside the table");
            let bisect = l.invert_by_bisection(dist);
            assert!((table - bisect).abs() < 1e-6, "{dist}: {table} vs {bisect}");
            assert!((l.forward_radius(table) - dist).abs() < 1e-8);
        }
    }

    #[test]
    fn non_monotone_correction_has_no_table() {
        let p = LensWarpCorrectionParameters {
            kr: [1.0, -1.5, 0.0, 0.0],
            center: Point2::new(0.5, 0.5),
        };
        let l = LensWarpCorrection::new(p, Point2::new(50.0, 50.0), &corners(100.0, 100.0));
        assert!(l.inverse_table.is_empty());
        assert!(l.invert_by_table(10.0).is_none());
        assert!(LensWarpCorrection::identity().inverse_table.is_empty());
    }
}
