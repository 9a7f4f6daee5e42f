//! Construction of a [`Mesh`] from local fits around every node.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Point2, Vector2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::error::CalibrationError;
use crate::homography::{solve, SolverModel, Weighting};
use crate::mapper::CoordinateMapper;
use crate::mesh::Mesh;
use crate::params::{ScannerType, ScreenToImageParameters, SolverPoint};

/// Fewest correspondences a mesh is built from.
pub const MIN_MESH_POINTS: usize = 10;

/// Neighbors always taken around a node in dense mode.
const MIN_NEIGHBORS: usize = 16;

/// Parameters of [`MeshBuilder`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshBuilderParams {
    /// Node spacing in screen units.
    pub step: f64,
    /// Screen radius of the neighborhood fitted around a node in dense mode.
    pub neighborhood_radius: f64,
    /// Above this many points neighborhoods come from a k-d tree instead of
    /// fitting every point at every node.
    pub dense_threshold: usize,
    /// Image-weighted refinement rounds for translating optics.
    pub max_refine_iters: usize,
    /// Refinement stops once a node moves less than this (image px).
    pub refine_tolerance: f64,
}

impl Default for MeshBuilderParams {
    fn default() -> Self {
        Self {
            step: 10.0,
            neighborhood_radius: 100.0,
            dense_threshold: 2000,
            max_refine_iters: 100,
            refine_tolerance: 0.5,
        }
    }
}

/// Diagnostics of a mesh build.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshBuildReport {
    pub width: usize,
    pub height: usize,
    pub growth_iterations: usize,
    /// The growth cap was hit while some border still mapped into the image.
    pub growth_exhausted: bool,
    /// Nodes whose refinement did not settle or whose local fit failed.
    pub unstable_nodes: usize,
}

/// Builds a mesh over the screen range of an image.
///
/// Every node takes the image position predicted by an affine fit of the
/// correspondences, weighted towards the node in screen space. Translating
/// optics refine that estimate with fits weighted in image space.
pub struct MeshBuilder<'a> {
    params: ScreenToImageParameters,
    points: &'a [SolverPoint],
    image_width: usize,
    image_height: usize,
    config: &'a MeshBuilderParams,
    tree: Option<KdTree<f64, 2>>,
}

impl<'a> MeshBuilder<'a> {
    pub fn new(
        params: &ScreenToImageParameters,
        points: &'a [SolverPoint],
        image_width: usize,
        image_height: usize,
        config: &'a MeshBuilderParams,
    ) -> Self {
        let tree = (points.len() > config.dense_threshold).then(|| {
            let coords: Vec<[f64; 2]> = points.iter().map(|p| [p.scr.x, p.scr.y]).collect();
            let tree: KdTree<f64, 2> = (&coords).into();
            tree
        });
        let mut params = params.clone();
        params.mesh = None;
        Self {
            params,
            points,
            image_width,
            image_height,
            config,
            tree,
        }
    }

    fn scanner(&self) -> ScannerType {
        self.params.scanner_type
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self, cancel), fields(points = self.points.len()))
    )]
    pub fn build(
        &self,
        cancel: Option<&AtomicBool>,
    ) -> Result<(Mesh, MeshBuildReport), CalibrationError> {
        if self.points.len() < MIN_MESH_POINTS {
            return Err(CalibrationError::NotEnoughPoints {
                needed: MIN_MESH_POINTS,
                got: self.points.len(),
            });
        }
        let step = self.config.step;
        let mapper = CoordinateMapper::new(&self.params, self.image_width, self.image_height);
        let range = mapper.get_range_for_image(self.image_width, self.image_height);
        let width = ((range.width as f64 / step).ceil() as usize + 1).max(2);
        let height = ((range.height as f64 / step).ceil() as usize + 1).max(2);
        log::debug!(
            "mesh range {:?}, {}x{} nodes, {} points{}",
            range,
            width,
            height,
            self.points.len(),
            if self.tree.is_some() { " (dense)" } else { "" }
        );

        let mut mesh = Mesh::new(
            Vector2::new(range.xshift as f64, range.yshift as f64),
            Vector2::new(step, step),
            width,
            height,
        );
        let mut report = MeshBuildReport::default();
        report.unstable_nodes += self.fill(&mut mesh, &mapper, false, cancel)?;

        let (w, h) = (self.image_width as f64, self.image_height as f64);
        let max_iters = width + height;
        loop {
            let left = mesh.need_to_grow_left(w, h);
            let right = mesh.need_to_grow_right(w, h);
            let top = mesh.need_to_grow_top(w, h);
            let bottom = mesh.need_to_grow_bottom(w, h);
            if !(left || right || top || bottom) {
                break;
            }
            if report.growth_iterations >= max_iters {
                log::warn!(
                    "mesh growth: maximum number of iterations reached ({}); {}",
                    max_iters,
                    mesh
                );
                report.growth_exhausted = true;
                break;
            }
            report.growth_iterations += 1;
            let (gx, gy) = mesh.grow_amount();
            let side = |needed: bool, amount: usize| if needed { amount } else { 0 };
            mesh.grow(side(left, gx), side(right, gx), side(top, gy), side(bottom, gy));
            report.unstable_nodes += self.fill(&mut mesh, &mapper, true, cancel)?;
        }

        mesh.precompute_inverse();
        report.width = mesh.width();
        report.height = mesh.height();
        if report.unstable_nodes > 0 {
            log::warn!("{} mesh nodes did not settle", report.unstable_nodes);
        }
        log::info!("built {}", mesh);
        Ok((mesh, report))
    }

    /// Compute node positions row by row in parallel; `only_missing` skips
    /// nodes that already hold a position. Returns the unstable node count.
    fn fill(
        &self,
        mesh: &mut Mesh,
        mapper: &CoordinateMapper,
        only_missing: bool,
        cancel: Option<&AtomicBool>,
    ) -> Result<usize, CalibrationError> {
        let width = mesh.width();
        let shift = mesh.shift();
        let step = mesh.step();
        let unstable = AtomicUsize::new(0);
        mesh.nodes_mut()
            .par_chunks_mut(width)
            .enumerate()
            .try_for_each(|(y, row)| {
                if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                    return Err(CalibrationError::Cancelled);
                }
                for (x, node) in row.iter_mut().enumerate() {
                    if only_missing && !node.x.is_nan() {
                        continue;
                    }
                    let scr = Point2::new(
                        x as f64 * step.x - shift.x,
                        y as f64 * step.y - shift.y,
                    );
                    let (img, settled) = self.node_image(scr, mapper);
                    if !settled {
                        unstable.fetch_add(1, Ordering::Relaxed);
                    }
                    *node = Point2::new(img.x as f32, img.y as f32);
                }
                Ok(())
            })?;
        Ok(unstable.into_inner())
    }

    /// Correspondences fitted around screen point `scr`.
    fn neighborhood(&self, scr: Point2<f64>) -> Vec<SolverPoint> {
        let Some(tree) = &self.tree else {
            return self.points.to_vec();
        };
        let q = [scr.x, scr.y];
        let r = self.config.neighborhood_radius;
        let mut found = tree.within_unsorted::<SquaredEuclidean>(&q, r * r);
        if found.len() < MIN_NEIGHBORS {
            found = tree.nearest_n::<SquaredEuclidean>(&q, MIN_NEIGHBORS);
        }
        found
            .into_iter()
            .map(|nn| self.points[nn.item as usize])
            .collect()
    }

    /// Image position of node `scr` and whether it is trusted. Nodes whose
    /// neighborhood cannot be fitted take the global mapping instead.
    fn node_image(&self, scr: Point2<f64>, mapper: &CoordinateMapper) -> (Point2<f64>, bool) {
        match self.fit_node(scr) {
            Ok(found) => found,
            Err(err) => {
                log::debug!(
                    "node at screen ({:.1}, {:.1}) falls back to the global mapping: {}",
                    scr.x,
                    scr.y,
                    err
                );
                (mapper.to_img(scr), false)
            }
        }
    }

    /// Local fit of node `scr` and whether refinement settled.
    fn fit_node(&self, scr: Point2<f64>) -> Result<(Point2<f64>, bool), CalibrationError> {
        let local = self.neighborhood(scr);
        if let Some(p) = local.iter().find(|p| p.scr == scr) {
            return Ok((p.img, true));
        }
        let model = SolverModel::default();
        let scanner = self.scanner();
        let fit = solve(&local, model, scanner, Weighting::Screen(scr))?;
        let mut img = fit.perspective_transform(scr);
        if scanner == ScannerType::FixedLens {
            return Ok((img, true));
        }
        for _ in 0..self.config.max_refine_iters {
            let fit = solve(&local, model, scanner, Weighting::Image(img))?;
            let next = fit.perspective_transform(scr);
            let moved = (next - img).norm();
            img = next;
            if moved < self.config.refine_tolerance {
                return Ok((img, true));
            }
        }
        log::debug!("oscillation instability at screen ({:.1}, {:.1})", scr.x, scr.y);
        Ok((img, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = 400;
    const H: usize = 300;

    fn truth(s: Point2<f64>) -> Point2<f64> {
        Point2::new(100.0 + 4.0 * s.x - 0.3 * s.y, 80.0 + 0.2 * s.x + 4.0 * s.y)
    }

    fn correspondences(spacing: f64) -> Vec<SolverPoint> {
        let mut pts = Vec::new();
        let mut y = -30.0;
        while y <= 70.0 {
            let mut x = -40.0;
            while x <= 90.0 {
                let s = Point2::new(x + 0.37, y + 0.61);
                pts.push(SolverPoint::new(truth(s), s));
                x += spacing;
            }
            y += spacing;
        }
        pts
    }

    fn params(scale: f64, scanner: ScannerType) -> ScreenToImageParameters {
        ScreenToImageParameters {
            center: Point2::new(100.0, 80.0),
            coordinate1: Vector2::new(4.0 * scale, 0.2 * scale),
            coordinate2: Vector2::new(-0.3 * scale, 4.0 * scale),
            scanner_type: scanner,
            ..Default::default()
        }
    }

    fn assert_reproduces_truth(mesh: &Mesh) {
        for s in [
            Point2::new(-20.0, -15.0),
            Point2::new(0.0, 0.0),
            Point2::new(33.3, 12.8),
            Point2::new(70.0, 50.0),
        ] {
            let d = (mesh.apply(s) - truth(s)).norm();
            assert!(d < 1e-3, "node error {d} at {s:?}");
            let back = mesh.invert(mesh.apply(s));
            assert!((back - s).norm() < 1e-3, "{back:?} != {s:?}");
        }
    }

    #[test]
    fn affine_data_gives_exact_mesh() {
        let pts = correspondences(5.0);
        let config = MeshBuilderParams::default();
        let (mesh, report) = MeshBuilder::new(&params(1.0, ScannerType::FixedLens), &pts, W, H, &config)
            .build(None)
            .expect("mesh");
        assert!(!report.growth_exhausted);
        assert!(mesh.has_inverse());
        assert_reproduces_truth(&mesh);
    }

    #[test]
    fn undersized_range_grows_until_the_image_is_covered() {
        let pts = correspondences(5.0);
        let config = MeshBuilderParams::default();
        let (mesh, report) = MeshBuilder::new(&params(2.0, ScannerType::FixedLens), &pts, W, H, &config)
            .build(None)
            .expect("mesh");
        assert!(report.growth_iterations > 0);
        assert!(!report.growth_exhausted);
        assert!(!mesh.need_to_grow_left(W as f64, H as f64));
        assert!(!mesh.need_to_grow_bottom(W as f64, H as f64));
        assert_reproduces_truth(&mesh);
    }

    #[test]
    fn dense_input_uses_local_neighborhoods() {
        let pts = correspondences(2.5);
        let config = MeshBuilderParams {
            dense_threshold: 100,
            neighborhood_radius: 12.0,
            ..Default::default()
        };
        let builder = MeshBuilder::new(&params(1.0, ScannerType::FixedLens), &pts, W, H, &config);
        assert!(builder.tree.is_some());
        let (mesh, _) = builder.build(None).expect("mesh");
        assert_reproduces_truth(&mesh);
    }

    #[test]
    fn translating_lens_refinement_settles() {
        let pts = correspondences(5.0);
        let config = MeshBuilderParams::default();
        let (mesh, report) =
            MeshBuilder::new(&params(1.0, ScannerType::LensMoveHorizontally), &pts, W, H, &config)
                .build(None)
                .expect("mesh");
        assert_eq!(report.unstable_nodes, 0);
        assert_reproduces_truth(&mesh);
    }

    #[test]
    fn colinear_cluster_falls_back_to_the_global_mapping() {
        let mut pts = correspondences(10.0);
        for k in 0..81 {
            let s = Point2::new(0.25 + 0.5 * k as f64, 6.0);
            pts.push(SolverPoint::new(truth(s), s));
        }
        let config = MeshBuilderParams {
            step: 1.0,
            dense_threshold: 100,
            neighborhood_radius: 3.0,
            ..Default::default()
        };
        let (mesh, report) = MeshBuilder::new(&params(1.0, ScannerType::FixedLens), &pts, W, H, &config)
            .build(None)
            .expect("degenerate nodes must not abort the build");
        assert!(report.unstable_nodes > 0);
        assert_reproduces_truth(&mesh);
        let on_row = Point2::new(20.0, 6.0);
        assert!((mesh.apply(on_row) - truth(on_row)).norm() < 1e-3);
    }

    #[test]
    fn too_few_points_and_cancellation() {
        let pts = correspondences(5.0);
        let config = MeshBuilderParams::default();
        let few = MeshBuilder::new(&params(1.0, ScannerType::FixedLens), &pts[..5], W, H, &config)
            .build(None)
            .expect_err("five points");
        assert_eq!(few, CalibrationError::NotEnoughPoints { needed: 10, got: 5 });

        let cancel = AtomicBool::new(true);
        let err = MeshBuilder::new(&params(1.0, ScannerType::FixedLens), &pts, W, H, &config)
            .build(Some(&cancel))
            .expect_err("cancelled");
        assert_eq!(err, CalibrationError::Cancelled);
    }
}
