use serde::{Deserialize, Serialize};

/// Correction of nonlinear scanner transport along one axis.
///
/// Control points map a scan position to the position an ideal, uniformly
/// moving transport would have produced. Between control points the map is
/// linear; outside it continues with the slope of the nearest segment. A
/// single point acts as a constant offset, and an empty list is the
/// identity.
///
/// The corrected positions must increase with the scan positions for
/// [`MotorCorrection::invert`] to be meaningful.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotorCorrection {
    points: Vec<[f64; 2]>,
}

impl MotorCorrection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[[f64; 2]] {
        &self.points
    }

    /// Insert keeping the list sorted by scan position; equal positions keep
    /// insertion order. Returns the index of the new point.
    pub fn add_point(&mut self, scan: f64, corrected: f64) -> usize {
        let idx = self.points.partition_point(|p| p[0] <= scan);
        self.points.insert(idx, [scan, corrected]);
        idx
    }

    pub fn remove_point(&mut self, index: usize) {
        if index < self.points.len() {
            self.points.remove(index);
        } else {
            log::warn!(
                "motor correction index {} out of range ({} points)",
                index,
                self.points.len()
            );
        }
    }

    /// Scan position to corrected position.
    pub fn apply(&self, v: f64) -> f64 {
        piecewise_linear(&self.points, v, 0, 1)
    }

    /// Corrected position to scan position.
    pub fn invert(&self, v: f64) -> f64 {
        piecewise_linear(&self.points, v, 1, 0)
    }
}

fn piecewise_linear(points: &[[f64; 2]], v: f64, from: usize, to: usize) -> f64 {
    match points {
        [] => v,
        [p] => v + (p[to] - p[from]),
        _ => {
            let seg = points
                .partition_point(|p| p[from] <= v)
                .clamp(1, points.len() - 1);
            let a = points[seg - 1];
            let b = points[seg];
            let span = b[from] - a[from];
            if span.abs() < 1e-12 {
                return v + (a[to] - a[from]);
            }
            let t = (v - a[from]) / span;
            a[to] + t * (b[to] - a[to])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn insertion_keeps_order() {
        let mut m = MotorCorrection::new();
        assert_eq!(m.add_point(100.0, 101.0), 0);
        assert_eq!(m.add_point(10.0, 10.5), 0);
        assert_eq!(m.add_point(50.0, 52.0), 1);
        let xs: Vec<f64> = m.points().iter().map(|p| p[0]).collect();
        assert_eq!(xs, [10.0, 50.0, 100.0]);
        m.remove_point(1);
        assert_eq!(m.len(), 2);
        m.remove_point(7);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn interpolates_and_extrapolates() {
        let mut m = MotorCorrection::new();
        m.add_point(0.0, 0.0);
        m.add_point(100.0, 110.0);
        m.add_point(200.0, 200.0);
        assert_relative_eq!(m.apply(50.0), 55.0);
        assert_relative_eq!(m.apply(150.0), 155.0);
        assert_relative_eq!(m.apply(-10.0), -11.0);
        assert_relative_eq!(m.apply(300.0), 290.0);
    }

    #[test]
    fn inverse_round_trips() {
        let mut m = MotorCorrection::new();
        m.add_point(0.0, 2.0);
        m.add_point(400.0, 405.0);
        m.add_point(900.0, 899.0);
        for v in [-50.0, 0.0, 123.0, 640.0, 1200.0] {
            assert_relative_eq!(m.invert(m.apply(v)), v, epsilon = 1e-9);
        }
    }

    #[test]
    fn empty_and_single_point() {
        let mut m = MotorCorrection::new();
        assert_eq!(m.apply(3.0), 3.0);
        m.add_point(10.0, 12.0);
        assert_relative_eq!(m.apply(3.0), 5.0);
        assert_relative_eq!(m.invert(5.0), 3.0);
    }
}
