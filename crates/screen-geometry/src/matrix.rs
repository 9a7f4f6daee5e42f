use nalgebra::{Matrix2, Matrix3, Matrix4, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Planar projective transform with independent x and y denominators.
///
/// The matrix acts on the homogeneous vector `(x, y, 1, 1)`:
///
/// ```text
/// x' = (m00 x + m01 y + m02 + m03) / (m20 x + m21 y + m22 + m23)
/// y' = (m10 x + m11 y + m12 + m13) / (m30 x + m31 y + m32 + m33)
/// ```
///
/// Row 2 is the x denominator and row 3 the y denominator. When they agree
/// the map is an ordinary homography (see [`TransMatrix::to_homography`]);
/// scanners with a translating lens need them to differ.
///
/// Composition rule: left-multiplying by a translation is exact as long as
/// the x offset lives in column 2 and the y offset in column 3 (which is how
/// [`TransMatrix::translation`] builds it). Right-multiplying by any affine
/// map whose rows 2 and 3 are the unit rows is always exact.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransMatrix {
    pub m: Matrix4<f64>,
}

impl Default for TransMatrix {
    fn default() -> Self {
        Self::identity()
    }
}

impl TransMatrix {
    pub fn new(m: Matrix4<f64>) -> Self {
        Self { m }
    }

    pub fn identity() -> Self {
        Self {
            m: Matrix4::identity(),
        }
    }

    pub fn from_rows(rows: [[f64; 4]; 4]) -> Self {
        let mut m = Matrix4::zeros();
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                m[(r, c)] = *v;
            }
        }
        Self { m }
    }

    pub fn to_rows(&self) -> [[f64; 4]; 4] {
        let mut rows = [[0.0; 4]; 4];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.m[(r, c)];
            }
        }
        rows
    }

    /// `p -> p + (tx, ty)`.
    pub fn translation(tx: f64, ty: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 2)] = tx;
        m[(1, 3)] = ty;
        Self { m }
    }

    /// `p -> s * (p + (tx, ty))`, the conditioning transform used before
    /// linear solves.
    pub fn scale_translation(s: f64, tx: f64, ty: f64) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 0)] = s;
        m[(1, 1)] = s;
        m[(0, 2)] = s * tx;
        m[(1, 3)] = s * ty;
        Self { m }
    }

    /// Change of basis mapping `(1, 0)` to `c1` and `(0, 1)` to `c2`.
    pub fn basis(c1: Vector2<f64>, c2: Vector2<f64>) -> Self {
        let mut m = Matrix4::identity();
        m[(0, 0)] = c1.x;
        m[(1, 0)] = c1.y;
        m[(0, 1)] = c2.x;
        m[(1, 1)] = c2.y;
        Self { m }
    }

    /// Perspective divide by `1 + (x * kx + y * ky)` on the axes selected
    /// by `divide_x` / `divide_y`.
    pub fn perspective(kx: f64, ky: f64, divide_x: bool, divide_y: bool) -> Self {
        let mut m = Matrix4::identity();
        if divide_x {
            m[(2, 0)] = kx;
            m[(2, 1)] = ky;
        }
        if divide_y {
            m[(3, 0)] = kx;
            m[(3, 1)] = ky;
        }
        Self { m }
    }

    #[inline]
    pub fn perspective_transform(&self, p: Point2<f64>) -> Point2<f64> {
        let m = &self.m;
        let x = (p.x * m[(0, 0)] + p.y * m[(0, 1)] + m[(0, 2)] + m[(0, 3)])
            / (p.x * m[(2, 0)] + p.y * m[(2, 1)] + m[(2, 2)] + m[(2, 3)]);
        let y = (p.x * m[(1, 0)] + p.y * m[(1, 1)] + m[(1, 2)] + m[(1, 3)])
            / (p.x * m[(3, 0)] + p.y * m[(3, 1)] + m[(3, 2)] + m[(3, 3)]);
        Point2::new(x, y)
    }

    /// Exact inverse of [`TransMatrix::perspective_transform`], solving the
    /// 2x2 linear system obtained by multiplying out both denominators.
    ///
    /// Returns `None` at a projective singularity.
    #[inline]
    pub fn inverse_perspective_transform(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let m = &self.m;
        let a = Matrix2::new(
            m[(0, 0)] - m[(2, 0)] * p.x,
            m[(0, 1)] - m[(2, 1)] * p.x,
            m[(1, 0)] - m[(3, 0)] * p.y,
            m[(1, 1)] - m[(3, 1)] * p.y,
        );
        let b = Vector2::new(
            (m[(2, 2)] + m[(2, 3)]) * p.x - m[(0, 2)] - m[(0, 3)],
            (m[(3, 2)] + m[(3, 3)]) * p.y - m[(1, 2)] - m[(1, 3)],
        );
        let inv = a.try_inverse()?;
        let r = inv * b;
        if r.x.is_finite() && r.y.is_finite() {
            Some(Point2::new(r.x, r.y))
        } else {
            None
        }
    }

    pub fn invert(&self) -> Option<Self> {
        self.m.try_inverse().map(Self::new)
    }

    /// `self` applied after `rhs`.
    pub fn then_after(&self, rhs: &TransMatrix) -> Self {
        Self::new(self.m * rhs.m)
    }

    /// True when the x and y denominators coincide, i.e. the transform is a
    /// plain 3x3 homography.
    pub fn has_shared_denominator(&self, tol: f64) -> bool {
        let m = &self.m;
        let scale = m.amax().max(1.0);
        (m[(2, 0)] - m[(3, 0)]).abs() <= tol * scale
            && (m[(2, 1)] - m[(3, 1)]).abs() <= tol * scale
            && ((m[(2, 2)] + m[(2, 3)]) - (m[(3, 2)] + m[(3, 3)])).abs() <= tol * scale
    }

    /// Collapse to a 3x3 homography acting on `(x, y, 1)`.
    ///
    /// Only meaningful when [`TransMatrix::has_shared_denominator`] holds.
    pub fn to_homography(&self) -> Matrix3<f64> {
        let m = &self.m;
        Matrix3::new(
            m[(0, 0)],
            m[(0, 1)],
            m[(0, 2)] + m[(0, 3)],
            m[(1, 0)],
            m[(1, 1)],
            m[(1, 2)] + m[(1, 3)],
            m[(2, 0)],
            m[(2, 1)],
            m[(2, 2)] + m[(2, 3)],
        )
    }

    /// Embed a 3x3 homography; both denominators take its last row.
    pub fn from_homography(h: &Matrix3<f64>) -> Self {
        Self::from_rows([
            [h[(0, 0)], h[(0, 1)], h[(0, 2)], 0.0],
            [h[(1, 0)], h[(1, 1)], 0.0, h[(1, 2)]],
            [h[(2, 0)], h[(2, 1)], h[(2, 2)], 0.0],
            [h[(2, 0)], h[(2, 1)], 0.0, h[(2, 2)]],
        ])
    }

    pub fn is_finite(&self) -> bool {
        self.m.iter().all(|v| v.is_finite())
    }
}

/// Apply a 3x3 homography to a point.
#[inline]
pub(crate) fn apply_homography(h: &Matrix3<f64>, p: Point2<f64>) -> Point2<f64> {
    let w = h[(2, 0)] * p.x + h[(2, 1)] * p.y + h[(2, 2)];
    Point2::new(
        (h[(0, 0)] * p.x + h[(0, 1)] * p.y + h[(0, 2)]) / w,
        (h[(1, 0)] * p.x + h[(1, 1)] * p.y + h[(1, 2)]) / w,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        assert!(
            (a.x - b.x).abs() < tol && (a.y - b.y).abs() < tol,
            "expected ({:.6},{:.6}) ~ ({:.6},{:.6}) within {}",
            a.x,
            a.y,
            b.x,
            b.y,
            tol
        );
    }

    fn split_denominator_matrix() -> TransMatrix {
        TransMatrix::from_rows([
            [3.1, 0.2, 14.0, 0.0],
            [-0.3, 2.9, 0.0, 7.0],
            [0.0004, 0.0, 1.0, 0.0],
            [0.0002, -0.0003, 0.0, 1.0],
        ])
    }

    #[test]
    fn inverse_perspective_round_trips_split_denominators() {
        let t = split_denominator_matrix();
        assert!(!t.has_shared_denominator(1e-12));
        for p in [
            Point2::new(0.0, 0.0),
            Point2::new(120.0, -40.0),
            Point2::new(-300.0, 250.0),
        ] {
            let q = t.perspective_transform(p);
            let back = t.inverse_perspective_transform(q).expect("regular point");
            assert_close(back, p, 1e-9);
        }
    }

    #[test]
    fn translation_composes_on_the_left_with_split_denominators() {
        let t = split_denominator_matrix();
        let shifted = TransMatrix::translation(5.0, -2.0).then_after(&t);
        let p = Point2::new(33.0, 71.0);
        let q = t.perspective_transform(p);
        assert_close(shifted.perspective_transform(p), Point2::new(q.x + 5.0, q.y - 2.0), 1e-9);
    }

    #[test]
    fn scale_translation_matches_its_definition() {
        let t = TransMatrix::scale_translation(0.5, -10.0, 4.0);
        let q = t.perspective_transform(Point2::new(12.0, 6.0));
        assert_close(q, Point2::new(1.0, 5.0), 1e-12);
        let inv = t.invert().expect("invertible");
        assert_close(inv.perspective_transform(q), Point2::new(12.0, 6.0), 1e-12);
    }

    #[test]
    fn homography_embedding_round_trips() {
        let h = Matrix3::new(1.2, 0.1, 5.0, -0.05, 0.9, 3.0, 0.001, 0.0005, 1.0);
        let t = TransMatrix::from_homography(&h);
        assert!(t.has_shared_denominator(1e-12));
        let p = Point2::new(50.0, -20.0);
        assert_close(t.perspective_transform(p), apply_homography(&h, p), 1e-12);
        assert_close(
            apply_homography(&t.to_homography(), p),
            apply_homography(&h, p),
            1e-12,
        );
    }
}
