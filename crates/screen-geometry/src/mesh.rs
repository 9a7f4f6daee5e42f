//! Piecewise-linear screen-to-image map sampled on a regular grid.

use std::fmt;

use nalgebra::{Matrix2, Point2, Vector2};

/// Tolerance (in cell units) of the triangle containment test.
const INSIDE_EPS: f64 = 1e-6;

/// Regular grid of image positions over screen coordinates.
///
/// Node `(x, y)` sits at screen `(x * step.x - shift.x, y * step.y - shift.y)`.
/// Each cell is split along its top-left/bottom-right diagonal into two
/// triangles and interpolated linearly, so the map is continuous.
///
/// Image positions are stored as `f32`; meshes get large and sub-pixel
/// precision is all that matters here.
#[derive(Clone, Debug, PartialEq)]
pub struct Mesh {
    shift: Vector2<f64>,
    step: Vector2<f64>,
    width: usize,
    height: usize,
    data: Vec<Point2<f32>>,
    inverse: Option<InverseIndex>,
}

/// Bucket grid over image space listing the cells that may cover a bucket.
#[derive(Clone, Debug, PartialEq)]
struct InverseIndex {
    shift: Vector2<f64>,
    step: Vector2<f64>,
    width: usize,
    height: usize,
    buckets: Vec<CellRange>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct CellRange {
    minx: u32,
    maxx: u32,
    miny: u32,
    maxy: u32,
}

impl CellRange {
    fn empty(width: usize, height: usize) -> Self {
        Self {
            minx: width as u32,
            maxx: 0,
            miny: height as u32,
            maxy: 0,
        }
    }

    fn include(&mut self, x: usize, y: usize) {
        self.minx = self.minx.min(x as u32);
        self.maxx = self.maxx.max(x as u32);
        self.miny = self.miny.min(y as u32);
        self.maxy = self.maxy.max(y as u32);
    }
}

impl Mesh {
    /// New mesh with every node at the image origin. `width` and `height`
    /// count nodes; smaller values are raised to 2.
    pub fn new(shift: Vector2<f64>, step: Vector2<f64>, width: usize, height: usize) -> Self {
        if width < 2 || height < 2 {
            log::warn!("mesh of {}x{} nodes raised to the 2x2 minimum", width, height);
        }
        let width = width.max(2);
        let height = height.max(2);
        Self {
            shift,
            step,
            width,
            height,
            data: vec![Point2::origin(); width * height],
            inverse: None,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn shift(&self) -> Vector2<f64> {
        self.shift
    }

    pub fn step(&self) -> Vector2<f64> {
        self.step
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> Point2<f64> {
        #[cfg(feature = "checked")]
        assert!(x < self.width && y < self.height, "mesh node ({x}, {y}) out of range");
        let p = self.data[y * self.width + x];
        Point2::new(p.x as f64, p.y as f64)
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, img: Point2<f64>) {
        #[cfg(feature = "checked")]
        assert!(x < self.width && y < self.height, "mesh node ({x}, {y}) out of range");
        self.data[y * self.width + x] = Point2::new(img.x as f32, img.y as f32);
    }

    /// Raw node storage, row-major. Drops the inverse index.
    pub(crate) fn nodes_mut(&mut self) -> &mut [Point2<f32>] {
        self.inverse = None;
        &mut self.data
    }

    /// Screen position of node `(x, y)`.
    #[inline]
    pub fn screen_point(&self, x: usize, y: usize) -> Point2<f64> {
        Point2::new(
            x as f64 * self.step.x - self.shift.x,
            y as f64 * self.step.y - self.shift.y,
        )
    }

    /// Screen point lies within the node grid.
    pub fn in_range(&self, scr: Point2<f64>) -> bool {
        let lo = self.screen_point(0, 0);
        let hi = self.screen_point(self.width - 1, self.height - 1);
        scr.x >= lo.x && scr.y >= lo.y && scr.x <= hi.x && scr.y <= hi.y
    }

    /// Screen to image. Points outside the grid are clamped to its border.
    #[inline]
    pub fn apply(&self, scr: Point2<f64>) -> Point2<f64> {
        let (ix, px) = split_coordinate((scr.x + self.shift.x) / self.step.x, self.width);
        let (iy, py) = split_coordinate((scr.y + self.shift.y) / self.step.y, self.height);
        let tl = self.get(ix, iy);
        let tr = self.get(ix + 1, iy);
        let bl = self.get(ix, iy + 1);
        let br = self.get(ix + 1, iy + 1);
        if px >= py {
            Point2::from(tl.coords * (1.0 - px) + tr.coords * (px - py) + br.coords * py)
        } else {
            Point2::from(tl.coords * (1.0 - py) + bl.coords * (py - px) + br.coords * px)
        }
    }

    pub fn has_inverse(&self) -> bool {
        self.inverse.is_some()
    }

    pub fn drop_inverse(&mut self) {
        self.inverse = None;
    }

    /// Bounding box of all node image positions.
    pub fn image_bounds(&self) -> (Point2<f64>, Point2<f64>) {
        let mut min = Point2::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point2::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for p in &self.data {
            min.x = min.x.min(p.x as f64);
            min.y = min.y.min(p.y as f64);
            max.x = max.x.max(p.x as f64);
            max.y = max.y.max(p.y as f64);
        }
        (min, max)
    }

    /// Screen bounds, transformed by `trans`, of the cells whose image
    /// bounding box meets the rectangle `[x1, x2] x [y1, y2]`. Every such
    /// cell contributes itself and its ring of neighbors. `None` when no
    /// cell meets the rectangle.
    pub fn get_range(
        &self,
        trans: &Matrix2<f64>,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> Option<(Point2<f64>, Point2<f64>)> {
        let mut bounds: Option<(Point2<f64>, Point2<f64>)> = None;
        for y in 0..self.height - 1 {
            for x in 0..self.width - 1 {
                let corners = [
                    self.get(x, y),
                    self.get(x + 1, y),
                    self.get(x, y + 1),
                    self.get(x + 1, y + 1),
                ];
                if corners.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
                    continue;
                }
                let fold = |f: fn(f64, f64) -> f64, axis: usize| {
                    corners[1..].iter().fold(corners[0][axis], |acc, c| f(acc, c[axis]))
                };
                if fold(f64::max, 0) < x1
                    || fold(f64::min, 0) > x2
                    || fold(f64::max, 1) < y1
                    || fold(f64::min, 1) > y2
                {
                    continue;
                }
                for (dx, dy) in [(-1.0, -1.0), (2.0, -1.0), (-1.0, 2.0), (2.0, 2.0)] {
                    let s = Point2::new(
                        (x as f64 + dx) * self.step.x - self.shift.x,
                        (y as f64 + dy) * self.step.y - self.shift.y,
                    );
                    let t = Point2::from(trans * s.coords);
                    bounds = Some(match bounds {
                        None => (t, t),
                        Some((lo, hi)) => (
                            Point2::new(lo.x.min(t.x), lo.y.min(t.y)),
                            Point2::new(hi.x.max(t.x), hi.y.max(t.y)),
                        ),
                    });
                }
            }
        }
        bounds
    }

    /// Build the bucket index used by [`invert`](Self::invert). The index
    /// has twice the node resolution on each axis.
    pub fn precompute_inverse(&mut self) {
        let (min, max) = self.image_bounds();
        let width = self.width * 2;
        let height = self.height * 2;
        let bucket_step = |lo: f64, hi: f64, n: usize| {
            let s = (hi - lo) / (n - 1) as f64;
            if s > 0.0 && s.is_finite() {
                s
            } else {
                1.0
            }
        };
        let step = Vector2::new(
            bucket_step(min.x, max.x, width),
            bucket_step(min.y, max.y, height),
        );
        let shift = -min.coords;
        let mut buckets = vec![CellRange::empty(self.width, self.height); width * height];

        let bucket = |v: f64, shift: f64, step: f64, n: usize| -> usize {
            let b = ((v + shift) / step).floor();
            if b <= 0.0 {
                0
            } else {
                (b as usize).min(n - 1)
            }
        };
        for y in 0..self.height - 1 {
            for x in 0..self.width - 1 {
                let corners = [
                    self.get(x, y),
                    self.get(x + 1, y),
                    self.get(x, y + 1),
                    self.get(x + 1, y + 1),
                ];
                let (mut lo, mut hi) = (corners[0], corners[0]);
                for c in &corners[1..] {
                    lo.x = lo.x.min(c.x);
                    lo.y = lo.y.min(c.y);
                    hi.x = hi.x.max(c.x);
                    hi.y = hi.y.max(c.y);
                }
                let bx0 = bucket(lo.x, shift.x, step.x, width);
                let bx1 = bucket(hi.x, shift.x, step.x, width);
                let by0 = bucket(lo.y, shift.y, step.y, height);
                let by1 = bucket(hi.y, shift.y, step.y, height);
                for by in by0..=by1 {
                    for bx in bx0..=bx1 {
                        buckets[by * width + bx].include(x, y);
                    }
                }
            }
        }
        self.inverse = Some(InverseIndex {
            shift,
            step,
            width,
            height,
            buckets,
        });
    }

    /// Image to screen.
    ///
    /// Uses the bucket index when present and scans every cell otherwise.
    /// Image points no cell covers map to the nearest border of the screen
    /// range, chosen per axis.
    pub fn invert(&self, img: Point2<f64>) -> Point2<f64> {
        match &self.inverse {
            Some(inv) => {
                let bx = ((img.x + inv.shift.x) / inv.step.x).floor();
                let by = ((img.y + inv.shift.y) / inv.step.y).floor();
                if bx >= 0.0 && by >= 0.0 && (bx as usize) < inv.width && (by as usize) < inv.height
                {
                    let range = inv.buckets[by as usize * inv.width + bx as usize];
                    for y in range.miny..=range.maxy {
                        for x in range.minx..=range.maxx {
                            if let Some(s) = self.locate_in_cell(x as usize, y as usize, img) {
                                return s;
                            }
                        }
                    }
                }
                let lo = self.screen_point(0, 0);
                let hi = self.screen_point(self.width - 1, self.height - 1);
                Point2::new(
                    if bx < (inv.width / 2) as f64 { lo.x } else { hi.x },
                    if by < (inv.height / 2) as f64 { lo.y } else { hi.y },
                )
            }
            None => {
                for y in 0..self.height - 1 {
                    for x in 0..self.width - 1 {
                        if let Some(s) = self.locate_in_cell(x, y, img) {
                            return s;
                        }
                    }
                }
                let (min, max) = self.image_bounds();
                let mid = Point2::from((min.coords + max.coords) * 0.5);
                let lo = self.screen_point(0, 0);
                let hi = self.screen_point(self.width - 1, self.height - 1);
                Point2::new(
                    if img.x < mid.x { lo.x } else { hi.x },
                    if img.y < mid.y { lo.y } else { hi.y },
                )
            }
        }
    }

    /// Screen point of `img` if it lies in cell `(x, y)`.
    fn locate_in_cell(&self, x: usize, y: usize, img: Point2<f64>) -> Option<Point2<f64>> {
        if x + 1 >= self.width || y + 1 >= self.height {
            return None;
        }
        let tl = self.get(x, y);
        let tr = self.get(x + 1, y);
        let bl = self.get(x, y + 1);
        let br = self.get(x + 1, y + 1);
        let d = img - tl;

        // Upper triangle: tl + (tr - tl) px + (br - tr) py with px >= py.
        if let Some(t) = Matrix2::from_columns(&[tr - tl, br - tr]).try_inverse() {
            let f = t * d;
            if f.y >= -INSIDE_EPS && f.x - f.y >= -INSIDE_EPS && f.x <= 1.0 + INSIDE_EPS {
                return Some(self.cell_to_screen(x, y, f.x, f.y));
            }
        }
        // Lower triangle: tl + (br - bl) px + (bl - tl) py with py >= px.
        if let Some(t) = Matrix2::from_columns(&[br - bl, bl - tl]).try_inverse() {
            let f = t * d;
            if f.x >= -INSIDE_EPS && f.y - f.x >= -INSIDE_EPS && f.y <= 1.0 + INSIDE_EPS {
                return Some(self.cell_to_screen(x, y, f.x, f.y));
            }
        }
        None
    }

    fn cell_to_screen(&self, x: usize, y: usize, px: f64, py: f64) -> Point2<f64> {
        Point2::new(
            (x as f64 + px) * self.step.x - self.shift.x,
            (y as f64 + py) * self.step.y - self.shift.y,
        )
    }

    /// Add node columns and rows on each side keeping existing nodes at their
    /// screen positions. New nodes are NaN until set.
    ///
    /// Growing invalidates the inverse index; build it again afterwards.
    pub fn grow(&mut self, left: usize, right: usize, top: usize, bottom: usize) {
        if self.inverse.is_some() {
            assert!(!cfg!(feature = "checked"), "growing a mesh with an inverse index");
            log::warn!("growing mesh with an inverse index; dropping the index");
            self.inverse = None;
        }
        let width = self.width + left + right;
        let height = self.height + top + bottom;
        let mut data = vec![Point2::new(f32::NAN, f32::NAN); width * height];
        for y in 0..self.height {
            let src = &self.data[y * self.width..(y + 1) * self.width];
            let start = (y + top) * width + left;
            data[start..start + self.width].copy_from_slice(src);
        }
        self.shift.x += left as f64 * self.step.x;
        self.shift.y += top as f64 * self.step.y;
        self.width = width;
        self.height = height;
        self.data = data;
    }

    /// Cells to add per grown side: an eighth of the extent, at least one.
    pub fn grow_amount(&self) -> (usize, usize) {
        ((self.width / 8).max(1), (self.height / 8).max(1))
    }

    fn inside_image(p: Point2<f64>, image_width: f64, image_height: f64) -> bool {
        p.x >= 0.0 && p.y >= 0.0 && p.x < image_width && p.y < image_height
    }

    /// Some node of the left column still maps into the image.
    pub fn need_to_grow_left(&self, image_width: f64, image_height: f64) -> bool {
        (0..self.height).any(|y| Self::inside_image(self.get(0, y), image_width, image_height))
    }

    pub fn need_to_grow_right(&self, image_width: f64, image_height: f64) -> bool {
        let x = self.width - 1;
        (0..self.height).any(|y| Self::inside_image(self.get(x, y), image_width, image_height))
    }

    pub fn need_to_grow_top(&self, image_width: f64, image_height: f64) -> bool {
        (0..self.width).any(|x| Self::inside_image(self.get(x, 0), image_width, image_height))
    }

    pub fn need_to_grow_bottom(&self, image_width: f64, image_height: f64) -> bool {
        let y = self.height - 1;
        (0..self.width).any(|x| Self::inside_image(self.get(x, y), image_width, image_height))
    }
}

/// Cell index and fractional offset of grid coordinate `v` on an axis with
/// `n` nodes, clamped to the border cells.
#[inline]
fn split_coordinate(v: f64, n: usize) -> (usize, f64) {
    let i = v.floor();
    if i.is_nan() || i < 0.0 {
        (0, 0.0)
    } else if i as usize >= n - 1 {
        (n - 2, 1.0)
    } else {
        (i as usize, v - i)
    }
}

impl fmt::Display for Mesh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lo = self.screen_point(0, 0);
        let hi = self.screen_point(self.width - 1, self.height - 1);
        write!(
            f,
            "mesh {}x{} step ({}, {}) screen ({:.1}, {:.1})-({:.1}, {:.1})",
            self.width, self.height, self.step.x, self.step.y, lo.x, lo.y, hi.x, hi.y
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        assert!(
            (a - b).amax() < tol,
            "expected ({:.5},{:.5}) ~ ({:.5},{:.5}) within {}",
            a.x,
            a.y,
            b.x,
            b.y,
            tol
        );
    }

    fn warp(s: Point2<f64>) -> Point2<f64> {
        Point2::new(
            300.0 + 4.0 * s.x + 0.3 * s.y + 0.002 * s.x * s.y,
            200.0 - 0.2 * s.x + 3.8 * s.y + 0.001 * s.x * s.x,
        )
    }

    fn sampled(f: fn(Point2<f64>) -> Point2<f64>) -> Mesh {
        let mut m = Mesh::new(Vector2::new(50.0, 40.0), Vector2::new(10.0, 10.0), 11, 9);
        for y in 0..m.height() {
            for x in 0..m.width() {
                let s = m.screen_point(x, y);
                m.set(x, y, f(s));
            }
        }
        m
    }

    #[test]
    fn affine_maps_are_reproduced() {
        let affine = |s: Point2<f64>| Point2::new(10.0 + 2.0 * s.x - 0.5 * s.y, -3.0 + s.x + 1.5 * s.y);
        let m = sampled(affine);
        for s in [
            Point2::new(-50.0, -40.0),
            Point2::new(-12.3, 7.7),
            Point2::new(33.3, 21.9),
            Point2::new(49.99, 39.99),
        ] {
            assert_close(m.apply(s), affine(s), 1e-3);
        }
    }

    #[test]
    fn interpolation_is_continuous_across_edges() {
        let m = sampled(warp);
        let eps = 1e-7;
        for s in [
            Point2::new(-20.0, 3.0),
            Point2::new(4.0, 10.0),
            Point2::new(15.0, 15.0),
        ] {
            let a = m.apply(s - Vector2::new(eps, eps * 0.5));
            let b = m.apply(s + Vector2::new(eps, eps * 0.5));
            assert_close(a, b, 1e-4);
        }
    }

    #[test]
    fn nodes_are_exact() {
        let m = sampled(warp);
        let s = m.screen_point(3, 4);
        assert_close(m.apply(s), warp(s), 1e-3);
    }

    #[test]
    fn invert_round_trips_with_and_without_index() {
        let mut m = sampled(warp);
        let pts = [
            Point2::new(-47.5, -38.0),
            Point2::new(0.0, 0.0),
            Point2::new(12.25, -3.75),
            Point2::new(44.0, 37.0),
        ];
        for s in pts {
            assert_close(m.invert(m.apply(s)), s, 1e-3);
        }
        m.precompute_inverse();
        assert!(m.has_inverse());
        for s in pts {
            assert_close(m.invert(m.apply(s)), s, 1e-3);
        }
    }

    #[test]
    fn points_outside_fall_back_to_borders() {
        let mut m = sampled(warp);
        m.precompute_inverse();
        let s = m.invert(Point2::new(-1.0e4, -1.0e4));
        assert_eq!(s, m.screen_point(0, 0));
    }

    #[test]
    fn grow_keeps_screen_positions() {
        let mut m = sampled(warp);
        let before = m.get(2, 3);
        let s = m.screen_point(2, 3);
        m.grow(2, 1, 3, 0);
        assert_eq!((m.width(), m.height()), (14, 12));
        assert_eq!(m.get(4, 6), before);
        assert_close(m.screen_point(4, 6), s, 1e-12);
        assert!(m.get(0, 0).x.is_nan());
    }

    #[test]
    fn growth_needs_follow_the_image_rectangle() {
        let m = sampled(warp);
        // Left column maps to x ~ 100 and top row to y ~ 50.
        assert!(m.need_to_grow_left(2000.0, 2000.0));
        assert!(m.need_to_grow_top(2000.0, 2000.0));
        assert!(!m.need_to_grow_left(50.0, 2000.0));
    }

    #[test]
    fn range_covers_hit_cells_and_their_neighbors() {
        let affine =
            |s: Point2<f64>| Point2::new(10.0 + 2.0 * s.x - 0.5 * s.y, -3.0 + s.x + 1.5 * s.y);
        let m = sampled(affine);
        // Only the four cells around screen (0, 0) meet this rectangle.
        let (lo, hi) = m
            .get_range(&Matrix2::identity(), 9.0, -4.0, 11.0, -2.0)
            .expect("cells meet the rectangle");
        assert_close(lo, Point2::new(-20.0, -20.0), 1e-9);
        assert_close(hi, Point2::new(20.0, 20.0), 1e-9);

        let scaled = Matrix2::new(2.0, 0.0, 0.0, 0.5);
        let (lo, hi) = m
            .get_range(&scaled, 9.0, -4.0, 11.0, -2.0)
            .expect("cells meet the rectangle");
        assert_close(lo, Point2::new(-40.0, -10.0), 1e-9);
        assert_close(hi, Point2::new(40.0, 10.0), 1e-9);

        assert!(m
            .get_range(&Matrix2::identity(), 1e5, 1e5, 1e5 + 1.0, 1e5 + 1.0)
            .is_none());
    }

    #[test]
    fn undersized_mesh_is_raised_to_two_by_two() {
        let mut m = Mesh::new(Vector2::new(0.0, 0.0), Vector2::new(1.0, 1.0), 1, 0);
        assert_eq!((m.width(), m.height()), (2, 2));
        m.set(1, 1, Point2::new(5.0, 5.0));
        assert_close(m.apply(Point2::new(7.0, -3.0)), m.get(1, 0), 1e-12);
        assert!(m.get_range(&Matrix2::identity(), 0.0, 0.0, 1.0, 1.0).is_some());
    }
}
