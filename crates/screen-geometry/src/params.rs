use std::sync::Arc;

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::lens::LensWarpCorrectionParameters;
use crate::mesh::Mesh;
use crate::motor::MotorCorrection;

/// Kind of color screen the photograph was taken through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScreenType {
    #[default]
    Random,
    Paget,
    Thames,
    Finlay,
    Dufay,
    DioptichromeB,
    ImprovedDioptichromeB,
    WarnerPowrie,
    Joly,
    Omnicolore,
}

impl ScreenType {
    pub const ALL: [ScreenType; 10] = [
        ScreenType::Random,
        ScreenType::Paget,
        ScreenType::Thames,
        ScreenType::Finlay,
        ScreenType::Dufay,
        ScreenType::DioptichromeB,
        ScreenType::ImprovedDioptichromeB,
        ScreenType::WarnerPowrie,
        ScreenType::Joly,
        ScreenType::Omnicolore,
    ];

    pub fn is_paget_like(self) -> bool {
        matches!(self, ScreenType::Paget | ScreenType::Thames | ScreenType::Finlay)
    }

    pub fn is_dufay_like(self) -> bool {
        matches!(
            self,
            ScreenType::Dufay
                | ScreenType::DioptichromeB
                | ScreenType::ImprovedDioptichromeB
                | ScreenType::Omnicolore
        )
    }

    /// Strip screens vary along screen x only; their geometry has one degree
    /// of freedom per point instead of two.
    pub fn has_vertical_strips(self) -> bool {
        matches!(self, ScreenType::WarnerPowrie | ScreenType::Joly)
    }
}

/// Which part of the scanner moves during acquisition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScannerType {
    #[default]
    FixedLens,
    FixedLensSensorMoveHorizontally,
    FixedLensSensorMoveVertically,
    LensMoveHorizontally,
    LensMoveVertically,
}

impl ScannerType {
    pub const ALL: [ScannerType; 5] = [
        ScannerType::FixedLens,
        ScannerType::FixedLensSensorMoveHorizontally,
        ScannerType::FixedLensSensorMoveVertically,
        ScannerType::LensMoveHorizontally,
        ScannerType::LensMoveVertically,
    ];

    pub fn is_fixed_lens(self) -> bool {
        matches!(
            self,
            ScannerType::FixedLens
                | ScannerType::FixedLensSensorMoveHorizontally
                | ScannerType::FixedLensSensorMoveVertically
        )
    }

    /// The transport moves along image x.
    pub fn moves_horizontally(self) -> bool {
        matches!(
            self,
            ScannerType::FixedLensSensorMoveHorizontally | ScannerType::LensMoveHorizontally
        )
    }
}

/// Diagnostic tag of a correspondence; never used by the math.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PointColor {
    Red,
    #[default]
    Green,
    Blue,
}

impl PointColor {
    pub fn name(self) -> &'static str {
        match self {
            PointColor::Red => "red",
            PointColor::Green => "green",
            PointColor::Blue => "blue",
        }
    }
}

/// One image/screen correspondence.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverPoint {
    pub img: Point2<f64>,
    pub scr: Point2<f64>,
    pub color: PointColor,
}

impl SolverPoint {
    pub fn new(img: Point2<f64>, scr: Point2<f64>) -> Self {
        Self {
            img,
            scr,
            color: PointColor::default(),
        }
    }

    pub fn with_color(mut self, color: PointColor) -> Self {
        self.color = color;
        self
    }
}

/// Calibration state of one scan.
///
/// The screen origin maps to `center`; screen `(1, 0)` and `(0, 1)` map to
/// `center + coordinate1` and `center + coordinate2`, before tilt and the
/// nonlinear corrections bend the picture.
///
/// Cloning deep-copies the motor correction and shares the mesh. A mesh is
/// never mutated once attached, so snapshots stay consistent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScreenToImageParameters {
    pub center: Point2<f64>,
    pub coordinate1: Vector2<f64>,
    pub coordinate2: Vector2<f64>,
    /// Distance of the projection plane; scales the effect of the tilts.
    pub projection_distance: f64,
    pub tilt_x: f64,
    pub tilt_y: f64,
    /// Rotation (degrees) from screen to final coordinates.
    pub final_rotation: f64,
    /// Angle (degrees) between the screen axes in final coordinates.
    pub final_angle: f64,
    /// Ratio of the y axis to the x axis in final coordinates.
    pub final_ratio: f64,
    pub motor_correction: MotorCorrection,
    pub screen_type: ScreenType,
    pub scanner_type: ScannerType,
    pub lens_correction: LensWarpCorrectionParameters,
    /// Takes precedence over the projective model when present.
    #[serde(skip)]
    pub mesh: Option<Arc<Mesh>>,
}

impl Default for ScreenToImageParameters {
    fn default() -> Self {
        Self {
            center: Point2::origin(),
            coordinate1: Vector2::new(1.0, 0.0),
            coordinate2: Vector2::new(0.0, 1.0),
            projection_distance: 1.0,
            tilt_x: 0.0,
            tilt_y: 0.0,
            final_rotation: 0.0,
            final_angle: 90.0,
            final_ratio: 1.0,
            motor_correction: MotorCorrection::default(),
            screen_type: ScreenType::default(),
            scanner_type: ScannerType::default(),
            lens_correction: LensWarpCorrectionParameters::default(),
            mesh: None,
        }
    }
}

impl PartialEq for ScreenToImageParameters {
    fn eq(&self, other: &Self) -> bool {
        let same_mesh = match (&self.mesh, &other.mesh) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        same_mesh
            && self.center == other.center
            && self.coordinate1 == other.coordinate1
            && self.coordinate2 == other.coordinate2
            && self.projection_distance == other.projection_distance
            && self.tilt_x == other.tilt_x
            && self.tilt_y == other.tilt_y
            && self.final_rotation == other.final_rotation
            && self.final_angle == other.final_angle
            && self.final_ratio == other.final_ratio
            && self.motor_correction == other.motor_correction
            && self.screen_type == other.screen_type
            && self.scanner_type == other.scanner_type
            && self.lens_correction == other.lens_correction
    }
}

impl ScreenToImageParameters {
    /// Take over the fields a solver run determines.
    pub fn merge_solver_solution(&mut self, other: &ScreenToImageParameters) {
        self.center = other.center;
        self.coordinate1 = other.coordinate1;
        self.coordinate2 = other.coordinate2;
        self.tilt_x = other.tilt_x;
        self.tilt_y = other.tilt_y;
        self.lens_correction = other.lens_correction;
        self.projection_distance = other.projection_distance;
        self.mesh = other.mesh.clone();
    }

    /// Insert a motor-correction control point keeping the list sorted by
    /// scan position; returns its index.
    pub fn add_motor_correction_point(&mut self, scan: f64, corrected: f64) -> usize {
        self.motor_correction.add_point(scan, corrected)
    }

    pub fn remove_motor_correction_point(&mut self, index: usize) {
        self.motor_correction.remove_point(index);
    }

    pub fn xlen(&self) -> f64 {
        self.coordinate1.norm()
    }

    pub fn ylen(&self) -> f64 {
        self.coordinate2.norm()
    }

    /// Angle between the screen axes in the image, in degrees.
    pub fn angle(&self) -> f64 {
        let dot = self.coordinate1.dot(&self.coordinate2);
        let cos = (dot / (self.xlen() * self.ylen())).clamp(-1.0, 1.0);
        cos.acos().to_degrees()
    }

    pub fn with_mesh(mut self, mesh: Arc<Mesh>) -> Self {
        self.mesh = Some(mesh);
        self
    }
}
