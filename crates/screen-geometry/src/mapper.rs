//! Bidirectional mapping between screen and image coordinates.
//!
//! Image to screen runs through these stages:
//!
//! 1. motor correction along the transport axis
//! 2. lens warp correction about the lens center
//! 3. inverse tilt perspective about the lens center
//! 4. translation of the corrected center to the origin
//! 5. change of basis to the screen axes
//!
//! Steps 3-5 form one [`TransMatrix`] (screen to corrected image). Screen to
//! image runs the same chain backwards. A mesh, when present, replaces the
//! whole chain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nalgebra::{Matrix2, Matrix3, Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::lens::LensWarpCorrection;
use crate::matrix::{apply_homography, TransMatrix};
use crate::mesh::Mesh;
use crate::params::{ScannerType, ScreenToImageParameters};

/// Tolerance (image px) of the `to_img(to_scr(p)) == p` invariant.
pub const ROUND_TRIP_TOLERANCE: f64 = 1e-3;

/// Number of samples per rectangle edge used when computing ranges.
const RANGE_EDGE_SAMPLES: usize = 16;

/// Rectangle in screen (or final) coordinates starting at
/// `(-xshift, -yshift)` of size `width x height`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenRange {
    pub xshift: i64,
    pub yshift: i64,
    pub width: i64,
    pub height: i64,
}

impl ScreenRange {
    fn from_bounds(min: Point2<f64>, max: Point2<f64>) -> Self {
        // One unit of margin on every side.
        let xshift = (-min.x).ceil() as i64 + 1;
        let yshift = (-min.y).ceil() as i64 + 1;
        Self {
            xshift,
            yshift,
            width: max.x.ceil() as i64 + xshift + 1,
            height: max.y.ceil() as i64 + yshift + 1,
        }
    }

    pub fn min(&self) -> Point2<f64> {
        Point2::new(-self.xshift as f64, -self.yshift as f64)
    }

    pub fn max(&self) -> Point2<f64> {
        Point2::new(
            (self.width - self.xshift) as f64,
            (self.height - self.yshift) as f64,
        )
    }

    pub fn contains(&self, p: Point2<f64>) -> bool {
        let lo = self.min();
        let hi = self.max();
        p.x >= lo.x && p.y >= lo.y && p.x <= hi.x && p.y <= hi.y
    }
}

#[derive(Clone, Debug)]
enum InverseMap {
    /// Fixed optics: corrected image to screen is a plain homography.
    Homography(Matrix3<f64>),
    /// Translating optics: the x and y denominators differ, so invert the
    /// perspective about the lens center and the affine part separately.
    Decomposed {
        perspective: TransMatrix,
        center: Point2<f64>,
        basis_inv: Matrix2<f64>,
    },
}

/// Stateful screen/image mapper built from [`ScreenToImageParameters`].
#[derive(Debug)]
pub struct CoordinateMapper {
    params: ScreenToImageParameters,
    image_width: f64,
    image_height: f64,
    lens: LensWarpCorrection,
    lens_center: Point2<f64>,
    perspective: TransMatrix,
    corrected_center: Point2<f64>,
    corrected_basis: Matrix2<f64>,
    matrix: TransMatrix,
    inverse: InverseMap,
    mesh: Option<Arc<Mesh>>,
    final_matrix: Matrix2<f64>,
    final_inverse: Matrix2<f64>,
    round_trip_violations: AtomicUsize,
}

impl Clone for CoordinateMapper {
    fn clone(&self) -> Self {
        Self {
            params: self.params.clone(),
            image_width: self.image_width,
            image_height: self.image_height,
            lens: self.lens.clone(),
            lens_center: self.lens_center,
            perspective: self.perspective,
            corrected_center: self.corrected_center,
            corrected_basis: self.corrected_basis,
            matrix: self.matrix,
            inverse: self.inverse.clone(),
            mesh: self.mesh.clone(),
            final_matrix: self.final_matrix,
            final_inverse: self.final_inverse,
            round_trip_violations: AtomicUsize::new(0),
        }
    }
}

impl CoordinateMapper {
    pub fn new(params: &ScreenToImageParameters, image_width: usize, image_height: usize) -> Self {
        let mut mapper = Self {
            params: ScreenToImageParameters::default(),
            image_width: 0.0,
            image_height: 0.0,
            lens: LensWarpCorrection::identity(),
            lens_center: Point2::origin(),
            perspective: TransMatrix::identity(),
            corrected_center: Point2::origin(),
            corrected_basis: Matrix2::identity(),
            matrix: TransMatrix::identity(),
            inverse: InverseMap::Homography(Matrix3::identity()),
            mesh: None,
            final_matrix: Matrix2::identity(),
            final_inverse: Matrix2::identity(),
            round_trip_violations: AtomicUsize::new(0),
        };
        mapper.set_parameters(params, image_width, image_height, 0.0);
        mapper
    }

    /// Recompute every derived matrix from `params`.
    ///
    /// Degenerate basis vectors fall back to an identity basis (with a
    /// warning) rather than failing.
    pub fn set_parameters(
        &mut self,
        params: &ScreenToImageParameters,
        image_width: usize,
        image_height: usize,
        rotation_adjustment: f64,
    ) {
        self.params = params.clone();
        self.image_width = image_width as f64;
        self.image_height = image_height as f64;
        self.round_trip_violations.store(0, Ordering::Relaxed);

        let scanner = params.scanner_type;
        let rel = params.lens_correction.center;
        self.lens_center = Point2::new(rel.x * self.image_width, rel.y * self.image_height);
        let (w, h, lc) = (self.image_width, self.image_height, self.lens_center);
        let corners: Vec<Point2<f64>> = match scanner {
            ScannerType::LensMoveHorizontally => vec![Point2::new(lc.x, 0.0), Point2::new(lc.x, h)],
            ScannerType::LensMoveVertically => vec![Point2::new(0.0, lc.y), Point2::new(w, lc.y)],
            _ => vec![
                Point2::new(0.0, 0.0),
                Point2::new(w, 0.0),
                Point2::new(0.0, h),
                Point2::new(w, h),
            ],
        };
        self.lens = LensWarpCorrection::new(params.lens_correction, lc, &corners);

        self.perspective = Self::tilt_perspective(params, lc);
        self.update_linear_parameters(params);

        self.mesh = params.mesh.as_ref().map(|mesh| {
            if mesh.has_inverse() {
                Arc::clone(mesh)
            } else {
                log::debug!("mesh attached without inverse index; building a private copy");
                let mut own = Mesh::clone(mesh);
                own.precompute_inverse();
                Arc::new(own)
            }
        });

        let rot = (params.final_rotation + rotation_adjustment).to_radians();
        let axis2 = rot + params.final_angle.to_radians();
        self.final_matrix = Matrix2::new(
            rot.cos(),
            axis2.cos() * params.final_ratio,
            rot.sin(),
            axis2.sin() * params.final_ratio,
        );
        self.final_inverse = self.final_matrix.try_inverse().unwrap_or_else(|| {
            log::warn!(
                "degenerate final transform (angle {}, ratio {}); using identity",
                params.final_angle,
                params.final_ratio
            );
            Matrix2::identity()
        });
    }

    /// Recompute only center, basis and tilt, keeping the nonlinear
    /// corrections. Used by the tilt search of the solver.
    pub fn update_linear_parameters(&mut self, params: &ScreenToImageParameters) {
        self.params.center = params.center;
        self.params.coordinate1 = params.coordinate1;
        self.params.coordinate2 = params.coordinate2;
        self.params.tilt_x = params.tilt_x;
        self.params.tilt_y = params.tilt_y;
        self.params.projection_distance = params.projection_distance;
        self.perspective = Self::tilt_perspective(params, self.lens_center);

        let unproject = |img: Point2<f64>| -> Point2<f64> {
            let q = self.apply_early_correction(img);
            self.perspective.inverse_perspective_transform(q).unwrap_or(q)
        };
        let cc = unproject(params.center);
        let c1 = unproject(params.center + params.coordinate1) - cc;
        let c2 = unproject(params.center + params.coordinate2) - cc;

        let mut basis = Matrix2::new(c1.x, c2.x, c1.y, c2.y);
        let degenerate = c1.norm() < 1e-9
            || c2.norm() < 1e-9
            || basis.determinant().abs() < 1e-12 * c1.norm() * c2.norm();
        if degenerate {
            log::warn!(
                "degenerate screen basis ({:?}, {:?}); falling back to identity",
                params.coordinate1,
                params.coordinate2
            );
            basis = Matrix2::identity();
        }
        self.corrected_center = cc;
        self.corrected_basis = basis;

        let affine = TransMatrix::translation(cc.x, cc.y).then_after(&TransMatrix::basis(
            Vector2::new(basis[(0, 0)], basis[(1, 0)]),
            Vector2::new(basis[(0, 1)], basis[(1, 1)]),
        ));
        self.matrix = self.perspective.then_after(&affine);

        let basis_inv = basis.try_inverse().unwrap_or_else(Matrix2::identity);
        self.inverse = if self.params.scanner_type.is_fixed_lens() {
            match self.matrix.to_homography().try_inverse() {
                Some(h) => InverseMap::Homography(h),
                None => InverseMap::Decomposed {
                    perspective: self.perspective,
                    center: cc,
                    basis_inv,
                },
            }
        } else {
            InverseMap::Decomposed {
                perspective: self.perspective,
                center: cc,
                basis_inv,
            }
        };
    }

    /// `T(lc) · P · T(-lc)`: the tilt acts relative to the lens center. A
    /// translating lens sits over every point along its axis, so that axis
    /// is neither divided nor contributes to the denominator.
    fn tilt_perspective(params: &ScreenToImageParameters, lc: Point2<f64>) -> TransMatrix {
        let d = params.projection_distance;
        if (params.tilt_x == 0.0 && params.tilt_y == 0.0) || d.abs() < 1e-12 {
            if d.abs() < 1e-12 && (params.tilt_x != 0.0 || params.tilt_y != 0.0) {
                log::warn!("projection distance {} ignores the tilt", d);
            }
            return TransMatrix::identity();
        }
        let (kx, ky) = (params.tilt_x / d, params.tilt_y / d);
        let p = match params.scanner_type {
            ScannerType::LensMoveHorizontally => TransMatrix::perspective(0.0, ky, false, true),
            ScannerType::LensMoveVertically => TransMatrix::perspective(kx, 0.0, true, false),
            _ => TransMatrix::perspective(kx, ky, true, true),
        };
        TransMatrix::translation(lc.x, lc.y)
            .then_after(&p)
            .then_after(&TransMatrix::translation(-lc.x, -lc.y))
    }

    pub fn params(&self) -> &ScreenToImageParameters {
        &self.params
    }

    pub fn scanner_type(&self) -> ScannerType {
        self.params.scanner_type
    }

    pub fn image_size(&self) -> (f64, f64) {
        (self.image_width, self.image_height)
    }

    pub fn mesh(&self) -> Option<&Arc<Mesh>> {
        self.mesh.as_ref()
    }

    /// Screen to corrected-image transform (without the nonlinear stages).
    pub fn matrix(&self) -> &TransMatrix {
        &self.matrix
    }

    pub fn lens_center(&self) -> Point2<f64> {
        self.lens_center
    }

    fn lens_center_for(&self, p: Point2<f64>) -> Point2<f64> {
        match self.params.scanner_type {
            ScannerType::LensMoveHorizontally => Point2::new(p.x, self.lens_center.y),
            ScannerType::LensMoveVertically => Point2::new(self.lens_center.x, p.y),
            _ => self.lens_center,
        }
    }

    /// Motor and lens correction: scan position to corrected position.
    #[inline]
    pub fn apply_early_correction(&self, p: Point2<f64>) -> Point2<f64> {
        let mut q = p;
        let motor = &self.params.motor_correction;
        if !motor.is_empty() {
            if self.params.scanner_type.moves_horizontally() {
                q.x = motor.apply(q.x);
            } else {
                q.y = motor.apply(q.y);
            }
        }
        self.lens.scan_to_corrected_about(q, self.lens_center_for(q))
    }

    #[inline]
    pub fn inverse_early_correction(&self, p: Point2<f64>) -> Point2<f64> {
        let mut q = self.lens.corrected_to_scan_about(p, self.lens_center_for(p));
        let motor = &self.params.motor_correction;
        if !motor.is_empty() {
            if self.params.scanner_type.moves_horizontally() {
                q.x = motor.invert(q.x);
            } else {
                q.y = motor.invert(q.y);
            }
        }
        q
    }

    /// Screen coordinates to image coordinates.
    #[inline]
    pub fn to_img(&self, scr: Point2<f64>) -> Point2<f64> {
        if let Some(mesh) = &self.mesh {
            return mesh.apply(scr);
        }
        self.inverse_early_correction(self.matrix.perspective_transform(scr))
    }

    /// Image coordinates to screen coordinates.
    ///
    /// Returns non-finite coordinates at a projective singularity.
    #[inline]
    pub fn to_scr(&self, img: Point2<f64>) -> Point2<f64> {
        if let Some(mesh) = &self.mesh {
            return mesh.invert(img);
        }
        let q = self.apply_early_correction(img);
        let scr = self.linear_to_scr(q);
        #[cfg(feature = "checked")]
        self.check_round_trip_of(img, scr);
        scr
    }

    fn linear_to_scr(&self, q: Point2<f64>) -> Point2<f64> {
        match &self.inverse {
            InverseMap::Homography(h) => apply_homography(h, q),
            InverseMap::Decomposed {
                perspective,
                center,
                basis_inv,
            } => match perspective.inverse_perspective_transform(q) {
                Some(u) => Point2::from(basis_inv * (u - center)),
                None => Point2::new(f64::NAN, f64::NAN),
            },
        }
    }

    /// Verify `to_img(to_scr(img)) == img` within [`ROUND_TRIP_TOLERANCE`];
    /// violations are counted and logged.
    pub fn check_round_trip(&self, img: Point2<f64>) -> bool {
        if self.mesh.is_some() {
            return true;
        }
        let q = self.apply_early_correction(img);
        let scr = self.linear_to_scr(q);
        self.check_round_trip_of(img, scr)
    }

    fn check_round_trip_of(&self, img: Point2<f64>, scr: Point2<f64>) -> bool {
        if !scr.x.is_finite() || !scr.y.is_finite() {
            return true;
        }
        let back = self.to_img(scr);
        let ok = (back - img).amax() <= ROUND_TRIP_TOLERANCE;
        if !ok {
            let n = self.round_trip_violations.fetch_add(1, Ordering::Relaxed) + 1;
            // First few, then every power of two.
            if n <= 8 || n.is_power_of_two() {
                log::warn!(
                    "mapper round trip violated ({} so far): {:?} -> {:?} -> {:?}",
                    n,
                    img,
                    scr,
                    back
                );
            }
        }
        ok
    }

    pub fn round_trip_violations(&self) -> usize {
        self.round_trip_violations.load(Ordering::Relaxed)
    }

    /// Screen coordinates to final (oriented) coordinates.
    pub fn to_final(&self, scr: Point2<f64>) -> Point2<f64> {
        Point2::from(self.final_matrix * scr.coords)
    }

    pub fn final_to_scr(&self, fin: Point2<f64>) -> Point2<f64> {
        Point2::from(self.final_inverse * fin.coords)
    }

    /// Screen rectangle covering the image rectangle `(x1, y1)-(x2, y2)`.
    ///
    /// Lens warping is not monotone near its singularities, so besides the
    /// corners the edges are sampled densely.
    /// With a mesh the range comes from the mesh cells covering the
    /// rectangle instead.
    pub fn get_range(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> ScreenRange {
        self.mesh_range(&Matrix2::identity(), x1, y1, x2, y2)
            .unwrap_or_else(|| self.range_of(x1, y1, x2, y2, |p| self.to_scr(p)))
    }

    pub fn get_range_for_image(&self, image_width: usize, image_height: usize) -> ScreenRange {
        self.get_range(0.0, 0.0, image_width as f64, image_height as f64)
    }

    /// As [`get_range_for_image`](Self::get_range_for_image) in final
    /// coordinates.
    pub fn get_final_range(&self, image_width: usize, image_height: usize) -> ScreenRange {
        let (w, h) = (image_width as f64, image_height as f64);
        self.mesh_range(&self.final_matrix, 0.0, 0.0, w, h)
            .unwrap_or_else(|| self.range_of(0.0, 0.0, w, h, |p| self.to_final(self.to_scr(p))))
    }

    fn mesh_range(
        &self,
        trans: &Matrix2<f64>,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Option<ScreenRange> {
        let mesh = self.mesh.as_ref()?;
        match mesh.get_range(trans, x1, y1, x2, y2) {
            Some((min, max)) => Some(ScreenRange::from_bounds(min, max)),
            None => {
                log::debug!("no mesh cell meets the range query; sampling the edges");
                None
            }
        }
    }

    fn range_of<F>(&self, x1: f64, y1: f64, x2: f64, y2: f64, map: F) -> ScreenRange
    where
        F: Fn(Point2<f64>) -> Point2<f64>,
    {
        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        let mut account = |p: Point2<f64>| {
            let q = map(p);
            if q.x.is_finite() && q.y.is_finite() {
                min.x = min.x.min(q.x);
                min.y = min.y.min(q.y);
                max.x = max.x.max(q.x);
                max.y = max.y.max(q.y);
            }
        };
        for i in 0..=RANGE_EDGE_SAMPLES {
            let t = i as f64 / RANGE_EDGE_SAMPLES as f64;
            let x = x1 + (x2 - x1) * t;
            let y = y1 + (y2 - y1) * t;
            account(Point2::new(x, y1));
            account(Point2::new(x, y2));
            account(Point2::new(x1, y));
            account(Point2::new(x2, y));
        }
        if !min.x.is_finite() {
            log::warn!("no finite screen coordinates in range query");
            return ScreenRange {
                xshift: 0,
                yshift: 0,
                width: 0,
                height: 0,
            };
        }
        ScreenRange::from_bounds(min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lens::LensWarpCorrectionParameters;

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        assert!(
            (a - b).amax() < tol,
            "expected ({:.6},{:.6}) ~ ({:.6},{:.6}) within {}",
            a.x,
            a.y,
            b.x,
            b.y,
            tol
        );
    }

    fn base_params(scanner: ScannerType) -> ScreenToImageParameters {
        let mut p = ScreenToImageParameters {
            center: Point2::new(512.0, 384.0),
            coordinate1: Vector2::new(7.9, 0.6),
            coordinate2: Vector2::new(-0.5, 8.1),
            tilt_x: 0.0002,
            tilt_y: -0.0001,
            scanner_type: scanner,
            lens_correction: LensWarpCorrectionParameters {
                kr: [1.0, 0.01, -0.002, 0.0],
                center: Point2::new(0.45, 0.55),
            },
            ..Default::default()
        };
        p.lens_correction.normalize();
        p.add_motor_correction_point(0.0, 0.0);
        p.add_motor_correction_point(500.0, 503.0);
        p.add_motor_correction_point(1024.0, 1024.0);
        p
    }

    fn samples() -> Vec<Point2<f64>> {
        let mut v = Vec::new();
        for y in (0..=768).step_by(96) {
            for x in (0..=1024).step_by(128) {
                v.push(Point2::new(x as f64, y as f64));
            }
        }
        v
    }

    #[test]
    fn round_trips_for_every_scanner_type() {
        for scanner in ScannerType::ALL {
            let params = base_params(scanner);
            let map = CoordinateMapper::new(&params, 1024, 768);
            for p in samples() {
                let s = map.to_scr(p);
                assert_close(map.to_img(s), p, ROUND_TRIP_TOLERANCE);
                let q = Point2::new(p.x / 8.0 - 60.0, p.y / 8.0 - 45.0);
                assert_close(map.to_scr(map.to_img(q)), q, ROUND_TRIP_TOLERANCE);
            }
            assert_eq!(map.round_trip_violations(), 0, "{scanner:?}");
        }
    }

    #[test]
    fn center_and_basis_are_exact_images() {
        let params = base_params(ScannerType::FixedLens);
        let map = CoordinateMapper::new(&params, 1024, 768);
        assert_close(map.to_img(Point2::origin()), params.center, 1e-6);
        assert_close(
            map.to_img(Point2::new(1.0, 0.0)),
            params.center + params.coordinate1,
            1e-6,
        );
        assert_close(
            map.to_img(Point2::new(0.0, 1.0)),
            params.center + params.coordinate2,
            1e-6,
        );
    }

    #[test]
    fn degenerate_basis_falls_back_to_identity() {
        let params = ScreenToImageParameters {
            center: Point2::new(10.0, 20.0),
            coordinate1: Vector2::zeros(),
            ..Default::default()
        };
        let map = CoordinateMapper::new(&params, 100, 100);
        assert_close(map.to_img(Point2::new(3.0, 4.0)), Point2::new(13.0, 24.0), 1e-9);
    }

    #[test]
    fn range_covers_the_image() {
        let params = base_params(ScannerType::FixedLens);
        let map = CoordinateMapper::new(&params, 1024, 768);
        let range = map.get_range_for_image(1024, 768);
        for p in samples() {
            assert!(range.contains(map.to_scr(p)), "{p:?} outside {range:?}");
        }
    }

    #[test]
    fn final_coordinates_invert() {
        let params = ScreenToImageParameters {
            final_rotation: 12.0,
            final_angle: 85.0,
            final_ratio: 1.1,
            ..base_params(ScannerType::FixedLens)
        };
        let map = CoordinateMapper::new(&params, 1024, 768);
        let p = Point2::new(13.0, -7.5);
        assert_close(map.final_to_scr(map.to_final(p)), p, 1e-12);
        let r = map.get_final_range(1024, 768);
        assert!(r.width > 0 && r.height > 0);
    }

    #[test]
    fn mesh_range_comes_from_the_covering_cells() {
        let params = ScreenToImageParameters {
            center: Point2::new(512.0, 384.0),
            coordinate1: Vector2::new(8.0, 0.0),
            coordinate2: Vector2::new(0.0, 8.0),
            ..Default::default()
        };
        // Image [0, 1024] x [0, 768] is screen [-64, 64] x [-48, 48].
        let plain = CoordinateMapper::new(&params, 1024, 768);

        // Twice the needed extent at 4 screen units per node.
        let step = 4.0;
        let mut mesh = Mesh::new(Vector2::new(130.0, 98.0), Vector2::new(step, step), 67, 51);
        for y in 0..mesh.height() {
            for x in 0..mesh.width() {
                let s = mesh.screen_point(x, y);
                mesh.set(x, y, plain.to_img(s));
            }
        }
        mesh.precompute_inverse();
        let meshed = CoordinateMapper::new(&params.clone().with_mesh(Arc::new(mesh)), 1024, 768);

        // Covering cells span [-66, 66] x [-50, 50]; one more cell each side.
        let range = meshed.get_range_for_image(1024, 768);
        assert_eq!(
            range,
            ScreenRange {
                xshift: 71,
                yshift: 55,
                width: 142,
                height: 110
            }
        );
        for p in samples() {
            assert!(range.contains(meshed.to_scr(p)), "{p:?} outside {range:?}");
        }
        let outside = meshed.get_range(5000.0, 5000.0, 5001.0, 5001.0);
        assert!(outside.width > 0);
    }
}
