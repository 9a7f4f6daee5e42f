//! Geometric calibration of scans taken through regular additive color
//! screens.
//!
//! The crate maps between *screen* coordinates (one unit per screen period)
//! and *image* coordinates (scan pixels). A [`CoordinateMapper`] realizes
//! the projective model described by [`ScreenToImageParameters`], including
//! motor and lens corrections. [`solve_geometry`] fits that model to
//! correspondences with RANSAC, and [`build_mesh`] fits a piecewise-linear
//! [`Mesh`] when the projective model is not good enough.
//!
//! ```no_run
//! use nalgebra::Point2;
//! use screen_geometry::{solve_geometry, ScreenToImageParameters, SolverParams, SolverPoint};
//!
//! let points: Vec<SolverPoint> = (0..9)
//!     .map(|k| {
//!         let s = Point2::new((k % 3) as f64, (k / 3) as f64);
//!         SolverPoint::new(Point2::new(10.0 + 8.0 * s.x, 20.0 + 8.0 * s.y), s)
//!     })
//!     .collect();
//! let out = solve_geometry(
//!     &ScreenToImageParameters::default(),
//!     &points,
//!     640,
//!     480,
//!     &SolverParams::default(),
//! )?;
//! println!("screen origin at {:?}", out.params.center);
//! # Ok::<(), screen_geometry::CalibrationError>(())
//! ```

mod error;
mod homography;
mod lens;
mod logger;
mod mapper;
mod matrix;
mod mesh;
mod mesh_builder;
mod motor;
mod normalize;
mod params;
mod ransac;
mod solver;

pub use error::CalibrationError;
pub use homography::{
    as_homography, five_point_matrix, screen_chisq, solve, RotationModel, SolverModel, Weighting,
    CHISQ_CAP, FIVE_POINT_SCREEN,
};
pub use lens::{LensWarpCorrection, LensWarpCorrectionParameters};
pub use mapper::{CoordinateMapper, ScreenRange, ROUND_TRIP_TOLERANCE};
pub use matrix::TransMatrix;
pub use mesh::Mesh;
pub use mesh_builder::{MeshBuildReport, MeshBuilder, MeshBuilderParams, MIN_MESH_POINTS};
pub use motor::MotorCorrection;
pub use normalize::PointNormalizer;
pub use params::{PointColor, ScannerType, ScreenToImageParameters, ScreenType, SolverPoint};
pub use ransac::{ransac, residual, RansacParams, RansacResult};
pub use solver::{build_mesh, solve_geometry, SolveOutcome, SolverParams};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
