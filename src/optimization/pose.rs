//! Camera pose estimation from ground control points.
//!
//! The six pose parameters `[x, y, z, roll, pitch, yaw]` are refined with the
//! Levenberg-Marquardt optimizer from the `tiny_solver` crate, which
//! differentiates the reprojection cost automatically. Inputs are validated before the
//! solver runs and the returned pose is checked afterwards, so a caller gets
//! either a converged pose or a typed [`CameraError`].

use std::collections::HashMap;

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, RealField, SVector, Vector2, Vector3, Vector4};
use num_dual::{jacobian, DualSVec64};
use serde::{Deserialize, Serialize};
use tiny_solver::factors::Factor;
use tiny_solver::optimizer::{Optimizer as TinySolverOptimizer, OptimizerOptions};
use tiny_solver::LevenbergMarquardtOptimizer;

use crate::camera::{Camera, CameraError, CameraModel};
use crate::geometry::{world_to_camera_matrix, GroundControlPoint, Pose};
use crate::optimization::{
    compute_reprojection_error, project_world_point, ProjectionError,
};

/// Fewest ground control points that determine the six pose parameters.
pub const MIN_GCPS: usize = 3;

const POSE_PARAMS: &str = "pose";

/// Residual assigned to each coordinate of a point at or behind the camera.
const BEHIND_CAMERA_RESIDUAL: f64 = 1e6;

/// Relative size of the second principal spread below which the world points
/// count as collinear.
const COLLINEAR_TOLERANCE: f64 = 1e-9;

/// How the solver is seeded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InitialGuess {
    /// Position at the centroid of the GCP world coordinates, fixed angles in
    /// radians.
    Centroid { roll: f64, pitch: f64, yaw: f64 },
    /// An explicit starting pose.
    Pose(Pose),
}

impl Default for InitialGuess {
    /// Centroid position with roll 90°, pitch 45° and yaw 45°.
    fn default() -> Self {
        InitialGuess::Centroid {
            roll: 90f64.to_radians(),
            pitch: 45f64.to_radians(),
            yaw: 45f64.to_radians(),
        }
    }
}

/// Settings for [`PoseEstimator`].
///
/// Solver limits default to tiny-solver's own [`OptimizerOptions`]; the
/// remaining fields control how the returned pose is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct EstimatorOptions {
    pub initial_guess: InitialGuess,
    pub max_iterations: usize,
    pub min_abs_decrease: f64,
    pub min_rel_decrease: f64,
    pub min_error: f64,
    pub verbosity: usize,
    /// Smallest camera-local depth treated as in front of the camera.
    pub min_depth: f64,
    /// Largest Gauss-Newton step, relative to `|pose| + 1`, still accepted as
    /// converged.
    pub step_tolerance: f64,
    /// Smallest ratio of extreme Jacobian singular values accepted as full rank.
    pub rank_tolerance: f64,
    /// Optional upper bound on the final RMS reprojection error in pixels.
    pub max_rmse: Option<f64>,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        let defaults = OptimizerOptions::default();
        Self {
            initial_guess: InitialGuess::default(),
            max_iterations: defaults.max_iteration,
            min_abs_decrease: defaults.min_abs_error_decrease_threshold,
            min_rel_decrease: defaults.min_rel_error_decrease_threshold,
            min_error: defaults.min_error_threshold,
            verbosity: defaults.verbosity_level,
            min_depth: f64::EPSILON.sqrt(),
            step_tolerance: 1e-3,
            rank_tolerance: 1e-12,
            max_rmse: None,
        }
    }
}

impl EstimatorOptions {
    /// Seeds the solver with `pose` instead of the centroid default.
    pub fn with_initial_pose(mut self, pose: Pose) -> Self {
        self.initial_guess = InitialGuess::Pose(pose);
        self
    }

    fn to_optimizer_options(&self) -> OptimizerOptions {
        OptimizerOptions {
            max_iteration: self.max_iterations,
            verbosity_level: self.verbosity,
            min_abs_error_decrease_threshold: self.min_abs_decrease,
            min_rel_error_decrease_threshold: self.min_rel_decrease,
            min_error_threshold: self.min_error,
            ..OptimizerOptions::default()
        }
    }
}

/// Result of a successful pose estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    /// The optimized pose.
    pub pose: Pose,
    /// The pose the solver started from.
    pub initial_pose: Pose,
    /// Half the squared norm of the residual vector at `pose`.
    pub final_cost: f64,
    /// Per-point reprojection error statistics at `pose`.
    pub reprojection_error: ProjectionError,
}

/// Reprojection cost of all GCPs as a function of the pose parameters.
#[derive(Debug, Clone)]
struct PoseCost {
    points3d: Vec<Vector3<f64>>,
    points2d: Vec<Vector2<f64>>,
    focal: f64,
    center: Vector2<f64>,
    min_depth: f64,
}

impl PoseCost {
    fn new(camera: &Camera, gcps: &[GroundControlPoint], min_depth: f64) -> Self {
        Self {
            points3d: gcps.iter().map(GroundControlPoint::world).collect(),
            points2d: gcps.iter().map(GroundControlPoint::pixel).collect(),
            focal: camera.focal,
            center: camera.center(),
            min_depth,
        }
    }

    /// Residuals at `pose` and their Jacobian with respect to the six pose
    /// parameters, by forward-mode differentiation of the same residual
    /// function the solver minimises.
    fn linearize(&self, pose: &Pose) -> (DVector<f64>, DMatrix<f64>) {
        let p0 = SVector::<f64, { Pose::DIM }>::from(pose.to_array());
        let (r, j) = jacobian(
            |p: SVector<DualSVec64<{ Pose::DIM }>, { Pose::DIM }>| {
                let params = [DVector::from_column_slice(p.as_slice())];
                <Self as Factor<DualSVec64<{ Pose::DIM }>>>::residual_func(self, &params)
            },
            p0,
        );
        let j = DMatrix::from_column_slice(j.nrows(), j.ncols(), j.as_slice());
        (r, j)
    }
}

impl<T: RealField> Factor<T> for PoseCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let pose = &params[0];
        let position = Vector3::new(pose[0].clone(), pose[1].clone(), pose[2].clone());
        let world_to_camera = world_to_camera_matrix(
            &position,
            pose[3].clone(),
            pose[4].clone(),
            pose[5].clone(),
        );

        let focal = T::from_f64(self.focal).unwrap();
        let center = Vector2::new(
            T::from_f64(self.center.x).unwrap(),
            T::from_f64(self.center.y).unwrap(),
        );
        let min_depth = T::from_f64(self.min_depth).unwrap();

        let mut residuals = DVector::zeros(self.points2d.len() * 2);

        for (i, (p3d, p2d)) in self.points3d.iter().zip(&self.points2d).enumerate() {
            let point = Vector4::new(
                T::from_f64(p3d.x).unwrap(),
                T::from_f64(p3d.y).unwrap(),
                T::from_f64(p3d.z).unwrap(),
                T::one(),
            );
            let (local, projected) =
                project_world_point(&world_to_camera, &point, focal.clone(), &center);

            // Constant penalty: no gradient pulls a point through the camera plane.
            if local.z <= min_depth {
                let penalty = T::from_f64(BEHIND_CAMERA_RESIDUAL).unwrap();
                residuals[i * 2] = penalty.clone();
                residuals[i * 2 + 1] = penalty;
                continue;
            }

            residuals[i * 2] = projected.x.clone() - T::from_f64(p2d.x).unwrap();
            residuals[i * 2 + 1] = projected.y.clone() - T::from_f64(p2d.y).unwrap();
        }
        residuals
    }
}

/// Checks that `gcps` can determine a pose: at least [`MIN_GCPS`] finite
/// points whose world coordinates are neither coincident nor collinear.
///
/// # Errors
///
/// * [`CameraError::InsufficientGcps`] for too few or degenerate points.
/// * [`CameraError::InvalidParams`] for non-finite coordinates.
pub fn check_gcps(gcps: &[GroundControlPoint]) -> Result<(), CameraError> {
    if gcps.len() < MIN_GCPS {
        return Err(CameraError::InsufficientGcps(format!(
            "at least {MIN_GCPS} points are required, got {}",
            gcps.len()
        )));
    }
    if let Some(i) = gcps.iter().position(|g| !g.is_finite()) {
        return Err(CameraError::InvalidParams(format!(
            "ground control point {i} has non-finite coordinates"
        )));
    }

    let centroid = gcps.iter().map(GroundControlPoint::world).sum::<Vector3<f64>>()
        / gcps.len() as f64;
    let centered = DMatrix::from_fn(3, gcps.len(), |r, c| gcps[c].world()[r] - centroid[r]);

    let mut spread: Vec<f64> = centered
        .svd(false, false)
        .singular_values
        .iter()
        .copied()
        .collect();
    spread.sort_by(|a, b| b.total_cmp(a));

    let scale = centroid.norm() + 1.0;
    if spread[0] <= 1e-12 * scale || spread[1] <= COLLINEAR_TOLERANCE * spread[0] {
        return Err(CameraError::InsufficientGcps(
            "world points are coincident or collinear".to_string(),
        ));
    }
    Ok(())
}

/// The pose the solver starts from.
///
/// For [`InitialGuess::Centroid`] the position is the arithmetic mean of the
/// GCP world coordinates.
///
/// # Errors
///
/// * [`CameraError::InsufficientGcps`] if a centroid is requested from no points.
/// * [`CameraError::InvalidParams`] if an explicit seed is not finite.
pub fn initial_guess(
    gcps: &[GroundControlPoint],
    strategy: &InitialGuess,
) -> Result<Pose, CameraError> {
    let pose = match *strategy {
        InitialGuess::Pose(pose) => pose,
        InitialGuess::Centroid { roll, pitch, yaw } => {
            if gcps.is_empty() {
                return Err(CameraError::InsufficientGcps(
                    "cannot seed from the centroid of zero points".to_string(),
                ));
            }
            let n = gcps.len() as f64;
            let ave_easting = gcps.iter().map(|g| g.x).sum::<f64>() / n;
            let ave_northing = gcps.iter().map(|g| g.y).sum::<f64>() / n;
            let ave_elevation = gcps.iter().map(|g| g.z).sum::<f64>() / n;
            Pose::new(ave_easting, ave_northing, ave_elevation, roll, pitch, yaw)
        }
    };
    if !pose.is_finite() {
        return Err(CameraError::InvalidParams(format!(
            "initial pose must be finite, got {pose:?}"
        )));
    }
    Ok(pose)
}

/// Levenberg-Marquardt camera pose estimator.
///
/// # Examples
///
/// ```rust
/// use gcp_pose::camera::{Camera, Resolution};
/// use gcp_pose::geometry::{GroundControlPoint, Pose};
/// use gcp_pose::optimization::{EstimatorOptions, PoseEstimator};
///
/// let camera = Camera::new(1000.0, Resolution { width: 1920, height: 1080 }).unwrap();
/// let gcps = vec![
///     GroundControlPoint::new(560.0, 340.0, -20.0, 50.0, -40.0),
///     GroundControlPoint::new(1360.0, 740.0, 20.0, 50.0, -60.0),
///     GroundControlPoint::new(960.0, 540.0, 0.0, 80.0, -50.0),
/// ];
///
/// let options = EstimatorOptions::default()
///     .with_initial_pose(Pose::new(2.0, -3.0, -47.0, 0.05, -0.05, 0.05));
/// let estimate = PoseEstimator::new(options).estimate(&camera, &gcps).unwrap();
/// assert!((estimate.pose.z + 50.0).abs() < 1e-2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct PoseEstimator {
    pub options: EstimatorOptions,
}

impl PoseEstimator {
    pub fn new(options: EstimatorOptions) -> Self {
        Self { options }
    }

    /// Estimates the pose of `camera` that minimises the squared reprojection
    /// error of `gcps`.
    ///
    /// Neither argument is modified.
    ///
    /// # Errors
    ///
    /// * [`CameraError::InvalidIntrinsics`] for an invalid camera.
    /// * [`CameraError::InsufficientGcps`] for fewer than [`MIN_GCPS`] points,
    ///   collinear points, or a rank-deficient Jacobian at the solution.
    /// * [`CameraError::InvalidParams`] for non-finite inputs.
    /// * [`CameraError::NonConvergence`] if the solver fails, stops away from a
    ///   stationary point, or exceeds `max_rmse`.
    /// * [`CameraError::DegenerateProjection`] if the final pose leaves points at
    ///   or behind the camera plane.
    pub fn estimate(
        &self,
        camera: &Camera,
        gcps: &[GroundControlPoint],
    ) -> Result<PoseEstimate, CameraError> {
        camera.validate_params()?;
        check_gcps(gcps)?;
        let initial_pose = initial_guess(gcps, &self.options.initial_guess)?;

        info!(
            "Estimating pose from {} ground control points, initial guess {:?}",
            gcps.len(),
            initial_pose
        );

        let mut problem = tiny_solver::Problem::new();
        let cost_function = PoseCost::new(camera, gcps, self.options.min_depth);
        problem.add_residual_block(
            gcps.len() * 2,
            &[POSE_PARAMS],
            Box::new(cost_function),
            None,
        );

        let mut initial_values = HashMap::new();
        initial_values.insert(POSE_PARAMS.to_string(), initial_pose.to_dvector());

        info!("Starting optimization with tiny-solver Levenberg-Marquardt...");

        let optimizer = LevenbergMarquardtOptimizer::default();
        let result = optimizer
            .optimize(
                &problem,
                &initial_values,
                Some(self.options.to_optimizer_options()),
            )
            .ok_or_else(|| {
                CameraError::NonConvergence("Levenberg-Marquardt solver failed".to_string())
            })?;

        let optimized_params = result.get(POSE_PARAMS).ok_or_else(|| {
            CameraError::NonConvergence("solver returned no pose parameters".to_string())
        })?;
        let pose = Pose::from_slice(optimized_params.as_slice())?;
        debug!("Solver returned {:?}", pose);

        let (final_cost, reprojection_error) = self.accept(camera, gcps, &pose)?;

        info!(
            "Optimization finished: pose {:?}, rmse {:.6} px",
            pose, reprojection_error.rmse
        );

        Ok(PoseEstimate {
            pose,
            initial_pose,
            final_cost,
            reprojection_error,
        })
    }

    /// Verifies that `pose` is a usable solution and returns its cost and
    /// reprojection statistics.
    fn accept(
        &self,
        camera: &Camera,
        gcps: &[GroundControlPoint],
        pose: &Pose,
    ) -> Result<(f64, ProjectionError), CameraError> {
        if !pose.is_finite() {
            return Err(CameraError::NonConvergence(format!(
                "solver returned a non-finite pose {pose:?}"
            )));
        }

        let behind = gcps
            .iter()
            .filter(|g| pose.transform_point(&g.world()).z <= self.options.min_depth)
            .count();
        if behind > 0 {
            warn!("{behind} points are at or behind the camera plane at the final pose");
            return Err(CameraError::DegenerateProjection(format!(
                "{behind} of {} points are at or behind the camera plane",
                gcps.len()
            )));
        }

        let (r, jacobian) =
            PoseCost::new(camera, gcps, self.options.min_depth).linearize(pose);
        if r.iter().chain(jacobian.iter()).any(|v| !v.is_finite()) {
            return Err(CameraError::DegenerateProjection(
                "non-finite residuals at the final pose".to_string(),
            ));
        }

        let svd = jacobian.svd(true, true);
        let (s_min, s_max) = svd
            .singular_values
            .iter()
            .fold((f64::INFINITY, 0.0f64), |(lo, hi), &s| (lo.min(s), hi.max(s)));
        if s_max <= 0.0 || s_min <= self.options.rank_tolerance * s_max {
            warn!("Jacobian singular values span [{s_min:e}, {s_max:e}]");
            return Err(CameraError::InsufficientGcps(
                "the points do not constrain all six pose parameters".to_string(),
            ));
        }

        let step = svd
            .solve(&(-&r), f64::EPSILON)
            .map_err(|e| CameraError::NonConvergence(e.to_string()))?;
        let tolerance = self.options.step_tolerance * (pose.to_dvector().norm() + 1.0);
        if step.norm() > tolerance {
            warn!(
                "Remaining Gauss-Newton step {:e} exceeds {:e}",
                step.norm(),
                tolerance
            );
            return Err(CameraError::NonConvergence(format!(
                "solver stopped {:.3e} away from a stationary point",
                step.norm()
            )));
        }

        let reprojection_error = compute_reprojection_error(camera, pose, gcps)?;
        if let Some(max_rmse) = self.options.max_rmse {
            if reprojection_error.rmse > max_rmse {
                return Err(CameraError::NonConvergence(format!(
                    "final rmse {:.4} px exceeds {max_rmse} px",
                    reprojection_error.rmse
                )));
            }
        }

        Ok((0.5 * r.norm_squared(), reprojection_error))
    }
}
