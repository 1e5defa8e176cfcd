//! The `optimization` module links camera projection to the pose solver.
//!
//! It provides the batch forward model ([`transform_all`]), the residual
//! function driven to zero by the solver ([`residuals`]) and reprojection
//! statistics ([`ProjectionError`]). The Levenberg-Marquardt pose estimator
//! itself lives in [`pose`].

use std::fmt;

use nalgebra::{DVector, Matrix2xX, Matrix3x4, Matrix4xX, RealField, Vector2, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::camera::{projective_transform, Camera, CameraError};
use crate::geometry::{GroundControlPoint, Pose};

pub mod pose;

pub use pose::{
    check_gcps, initial_guess, EstimatorOptions, InitialGuess, PoseEstimate, PoseEstimator,
    MIN_GCPS,
};

/// Summary of per-point reprojection error norms, in pixels.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl ProjectionError {
    /// Computes the statistics of a non-empty set of error norms.
    pub fn from_errors(errors: &[f64]) -> Result<Self, CameraError> {
        if errors.is_empty() {
            return Err(CameraError::InvalidParams(
                "cannot summarise an empty set of errors".to_string(),
            ));
        }
        if errors.iter().any(|e| !e.is_finite()) {
            return Err(CameraError::DegenerateProjection(
                "reprojection errors are not finite".to_string(),
            ));
        }

        let n = errors.len() as f64;
        let mean = errors.iter().sum::<f64>() / n;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let stddev = (errors.iter().map(|e| (e - mean).powi(2)).sum::<f64>() / n).sqrt();

        let mut sorted = errors.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Ok(ProjectionError {
            rmse,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev,
            median,
        })
    }
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Splits GCPs into homogeneous world points (4×N) and observed pixels (2×N).
pub fn gcps_to_matrices(gcps: &[GroundControlPoint]) -> (Matrix4xX<f64>, Matrix2xX<f64>) {
    let points_world = Matrix4xX::from_fn(gcps.len(), |r, c| gcps[c].homogeneous()[r]);
    let points_2d = Matrix2xX::from_fn(gcps.len(), |r, c| gcps[c].pixel()[r]);
    (points_world, points_2d)
}

/// Camera-local coordinates and pixel of one homogeneous world point.
///
/// Shared by [`transform_all`] and the solver's cost. The pixel is unguarded.
pub fn project_world_point<T: RealField>(
    world_to_camera: &Matrix3x4<T>,
    point: &Vector4<T>,
    focal: T,
    center: &Vector2<T>,
) -> (Vector3<T>, Vector2<T>) {
    let local = world_to_camera * point;
    let pixel = projective_transform(&local, focal, center);
    (local, pixel)
}

/// Projects every homogeneous world point (one per column) through `pose` and
/// the camera intrinsics.
///
/// Rotational transform followed by the unguarded [`projective_transform`];
/// points at or behind the camera plane give non-finite or mirrored pixels.
pub fn transform_all(camera: &Camera, pose: &Pose, points_world: &Matrix4xX<f64>) -> Matrix2xX<f64> {
    let world_to_camera = pose.world_to_camera();
    let center = camera.center();

    let mut projected = Matrix2xX::zeros(points_world.ncols());
    for (i, point) in points_world.column_iter().enumerate() {
        let (_, pixel) =
            project_world_point(&world_to_camera, &point.into_owned(), camera.focal, &center);
        projected.set_column(i, &pixel);
    }
    projected
}

/// Residual vector of `pose`: `[u0' - u0, v0' - v0, u1' - u1, ...]` where
/// `(ui', vi')` is the projection of world point `i`.
///
/// The output has `2 * N` entries in point order. Non-finite entries are
/// returned as is. The pose solver evaluates the same per-point model through
/// [`project_world_point`] but replaces both entries of a point at or behind the
/// camera plane with a constant penalty; everywhere else the two agree.
///
/// # Errors
///
/// * [`CameraError::InvalidParams`] if the point counts differ.
pub fn residuals(
    camera: &Camera,
    pose: &Pose,
    points_world: &Matrix4xX<f64>,
    points_2d: &Matrix2xX<f64>,
) -> Result<DVector<f64>, CameraError> {
    if points_world.ncols() != points_2d.ncols() {
        return Err(CameraError::InvalidParams(
            "Number of 2D and 3D points must match".to_string(),
        ));
    }

    let difference = transform_all(camera, pose, points_world) - points_2d;
    // Column-major storage of a 2×N matrix is the row-major flattening of N×2.
    Ok(DVector::from_column_slice(difference.as_slice()))
}

/// Reprojection error statistics of `pose` over `gcps`.
///
/// # Errors
///
/// * [`CameraError::InvalidParams`] if `gcps` is empty.
/// * [`CameraError::DegenerateProjection`] if any projection is not finite.
pub fn compute_reprojection_error(
    camera: &Camera,
    pose: &Pose,
    gcps: &[GroundControlPoint],
) -> Result<ProjectionError, CameraError> {
    let (points_world, points_2d) = gcps_to_matrices(gcps);
    let difference = transform_all(camera, pose, &points_world) - points_2d;
    let errors: Vec<f64> = difference.column_iter().map(|c| c.norm()).collect();
    ProjectionError::from_errors(&errors)
}
