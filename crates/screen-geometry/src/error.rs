use thiserror::Error;

/// Failures of a calibration solve.
///
/// Only [`CalibrationError::ColinearPoints`] means the input itself is
/// unusable; the remaining variants are recoverable by supplying more points
/// or retrying.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("not enough points: need {needed}, got {got}")]
    NotEnoughPoints { needed: usize, got: usize },
    #[error("points are always colinear")]
    ColinearPoints,
    #[error("solution diverged (non-finite matrix or vanishing homogeneous scale)")]
    NumericalDivergence,
    #[error("operation cancelled")]
    Cancelled,
}
