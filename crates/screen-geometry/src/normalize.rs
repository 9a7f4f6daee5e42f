//! Conditioning of point sets before the linear solves.

use nalgebra::Point2;

use crate::matrix::TransMatrix;
use crate::params::ScannerType;

/// Two-pass accumulator producing a translate-and-scale transform that puts
/// the centroid at the origin and the mean distance from it at `sqrt(2)`.
///
/// Call [`account1`](Self::account1) for every point, then
/// [`finish1`](Self::finish1), then [`account2`](Self::account2) for every
/// point again, then [`matrix`](Self::matrix).
///
/// For scanners with a translating lens the translation is skipped: the
/// equations of those models zero some columns, which a shifted origin
/// would make inconsistent. Only the scale is applied then.
#[derive(Clone, Debug)]
pub struct PointNormalizer {
    translate: bool,
    sum: Point2<f64>,
    count: usize,
    dist_sum: f64,
    finished: bool,
}

impl PointNormalizer {
    pub fn new(scanner: ScannerType) -> Self {
        Self {
            translate: scanner.is_fixed_lens(),
            sum: Point2::origin(),
            count: 0,
            dist_sum: 0.0,
            finished: false,
        }
    }

    #[inline]
    pub fn account1(&mut self, p: Point2<f64>) {
        if self.translate {
            self.sum.x += p.x;
            self.sum.y += p.y;
        }
        self.count += 1;
    }

    /// Vertical-strip screens carry only an x coordinate.
    #[inline]
    pub fn account1_x_only(&mut self, p: Point2<f64>) {
        if self.translate {
            self.sum.x += p.x;
        }
        self.count += 1;
    }

    pub fn finish1(&mut self) {
        if self.count > 0 {
            self.sum.x /= self.count as f64;
            self.sum.y /= self.count as f64;
        }
        self.finished = true;
    }

    #[inline]
    pub fn account2(&mut self, p: Point2<f64>) {
        debug_assert!(self.finished, "account2 before finish1");
        let dx = p.x - self.sum.x;
        let dy = p.y - self.sum.y;
        self.dist_sum += (dx * dx + dy * dy).sqrt();
    }

    #[inline]
    pub fn account2_x_only(&mut self, p: Point2<f64>) {
        debug_assert!(self.finished, "account2 before finish1");
        self.dist_sum += (p.x - self.sum.x).abs();
    }

    pub fn centroid(&self) -> Point2<f64> {
        self.sum
    }

    pub fn scale(&self) -> f64 {
        if self.dist_sum > 1e-12 && self.count > 0 {
            std::f64::consts::SQRT_2 * self.count as f64 / self.dist_sum
        } else {
            1.0
        }
    }

    pub fn matrix(&self) -> TransMatrix {
        TransMatrix::scale_translation(self.scale(), -self.sum.x, -self.sum.y)
    }

    /// Run both passes over `pts`.
    pub fn from_points<I>(scanner: ScannerType, pts: I) -> Self
    where
        I: IntoIterator<Item = Point2<f64>>,
        I::IntoIter: Clone,
    {
        let it = pts.into_iter();
        let mut n = Self::new(scanner);
        for p in it.clone() {
            n.account1(p);
        }
        n.finish1();
        for p in it {
            n.account2(p);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn centers_and_scales_to_sqrt2() {
        let pts = [
            Point2::new(100.0, 200.0),
            Point2::new(400.0, 260.0),
            Point2::new(130.0, 900.0),
            Point2::new(720.0, 610.0),
        ];
        let n = PointNormalizer::from_points(ScannerType::FixedLens, pts.iter().copied());
        let t = n.matrix();
        let mapped: Vec<_> = pts.iter().map(|&p| t.perspective_transform(p)).collect();

        let cx: f64 = mapped.iter().map(|p| p.x).sum::<f64>() / 4.0;
        let cy: f64 = mapped.iter().map(|p| p.y).sum::<f64>() / 4.0;
        assert_relative_eq!(cx, 0.0, epsilon = 1e-12);
        assert_relative_eq!(cy, 0.0, epsilon = 1e-12);

        let mean_dist: f64 = mapped.iter().map(|p| p.coords.norm()).sum::<f64>() / 4.0;
        assert_relative_eq!(mean_dist, std::f64::consts::SQRT_2, epsilon = 1e-12);
    }

    #[test]
    fn translating_lens_only_scales() {
        let pts = [Point2::new(10.0, 0.0), Point2::new(30.0, 0.0)];
        let n = PointNormalizer::from_points(ScannerType::LensMoveHorizontally, pts.iter().copied());
        assert_eq!(n.centroid(), Point2::origin());
        let q = n.matrix().perspective_transform(Point2::new(20.0, 0.0));
        assert_relative_eq!(q.x, 20.0 * n.scale(), epsilon = 1e-12);
    }

    #[test]
    fn degenerate_set_keeps_unit_scale() {
        let pts = [Point2::new(5.0, 5.0); 3];
        let n = PointNormalizer::from_points(ScannerType::FixedLens, pts.iter().copied());
        assert_eq!(n.scale(), 1.0);
    }
}
