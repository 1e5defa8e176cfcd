//! Implements the ideal pinhole camera used for pose estimation.
//!
//! This module provides the [`Camera`] struct and the [`projective_transform`]
//! that maps camera-local points to pixels. The camera has a single focal length
//! expressed in pixels and its optical axis passes through the sensor center, so
//! the only intrinsics are the focal length and the sensor [`Resolution`].

use crate::camera::{validation, CameraError, CameraModel, Resolution};
use crate::geometry::{self, GroundControlPoint, Pose};
use crate::optimization::{self, EstimatorOptions, PoseEstimate, PoseEstimator};
use nalgebra::{Matrix2xX, Matrix3xX, RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use yaml_rust::{Yaml, YamlLoader};

/// Projects a point in camera-local coordinates to pixel coordinates.
///
/// `u = x / z * focal + center.x`, `v = y / z * focal + center.y`.
///
/// Only the first three components are used. Depth is not checked: a point at
/// `z == 0` yields infinite or NaN pixels and a point behind the camera is
/// mirrored through the center. Use [`CameraModel::project`] for a guarded
/// projection.
///
/// The function is generic over [`RealField`] so that the solver can evaluate
/// it with dual numbers.
pub fn projective_transform<T: RealField>(
    point: &Vector3<T>,
    focal: T,
    center: &Vector2<T>,
) -> Vector2<T> {
    // General coordinates
    let gcx = point.x.clone() / point.z.clone();
    let gcy = point.y.clone() / point.z.clone();

    Vector2::new(
        gcx * focal.clone() + center.x.clone(),
        gcy * focal + center.y.clone(),
    )
}

/// Represents a pinhole camera with known intrinsics and an optional pose.
///
/// # Examples
///
/// ```rust
/// use gcp_pose::camera::{Camera, Resolution};
/// use gcp_pose::geometry::Pose;
/// use nalgebra::Matrix3xX;
///
/// let camera = Camera::new(1000.0, Resolution { width: 1920, height: 1080 })
///     .unwrap()
///     .with_pose(Pose::new(0.0, 0.0, -50.0, 0.0, 0.0, 0.0));
///
/// // With all angles zero the camera looks along world +Y.
/// let points = Matrix3xX::from_column_slice(&[0.0, 60.0, -50.0]);
/// let pixels = camera.project_points(&points, None).unwrap();
/// assert!((pixels[(0, 0)] - 960.0).abs() < 1e-9);
/// assert!((pixels[(1, 0)] - 540.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    /// Focal length in pixels.
    pub focal: f64,
    /// Sensor size in pixels, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// Pose in world coordinates, set once estimated.
    pub pose: Option<Pose>,
}

impl Camera {
    /// Creates a new [`Camera`] with no pose.
    ///
    /// # Errors
    ///
    /// * [`CameraError::InvalidIntrinsics`] if the focal length is not positive
    ///   and finite or a sensor dimension is zero.
    pub fn new(focal: f64, resolution: Resolution) -> Result<Self, CameraError> {
        let camera = Camera {
            focal,
            resolution,
            pose: None,
        };
        camera.validate_params()?;
        Ok(camera)
    }

    /// Returns a copy of this camera carrying `pose`.
    pub fn with_pose(mut self, pose: Pose) -> Self {
        self.pose = Some(pose);
        self
    }

    /// The stored pose.
    ///
    /// # Errors
    ///
    /// * [`CameraError::PoseNotSet`] if no pose has been estimated or set.
    pub fn pose(&self) -> Result<&Pose, CameraError> {
        self.pose.as_ref().ok_or(CameraError::PoseNotSet)
    }

    /// Pixel coordinates of the optical axis.
    pub fn center(&self) -> Vector2<f64> {
        self.resolution.center()
    }

    /// Projects world points (one per column) to pixel coordinates.
    ///
    /// Uses `pose` when given, otherwise the stored pose. Points at or behind
    /// the camera plane are not rejected; see [`projective_transform`].
    ///
    /// # Errors
    ///
    /// * [`CameraError::PoseNotSet`] if `pose` is `None` and no pose is stored.
    pub fn project_points(
        &self,
        points_world: &Matrix3xX<f64>,
        pose: Option<&Pose>,
    ) -> Result<Matrix2xX<f64>, CameraError> {
        let pose = match pose {
            Some(pose) => pose,
            None => self.pose()?,
        };
        let homogeneous = geometry::to_homogeneous(points_world);
        Ok(optimization::transform_all(self, pose, &homogeneous))
    }

    /// Estimates the pose from `gcps` with default [`EstimatorOptions`] and
    /// returns a new camera carrying it, together with the solver report.
    ///
    /// The default seed puts the camera at the centroid of the points. That only
    /// converges when the centroid already sees every point in front of it; for
    /// a camera outside the point cloud it fails with
    /// [`CameraError::DegenerateProjection`] or [`CameraError::NonConvergence`].
    /// Use [`Camera::estimate_pose_with`] to supply a seed.
    pub fn estimate_pose(
        &self,
        gcps: &[GroundControlPoint],
    ) -> Result<(Camera, PoseEstimate), CameraError> {
        self.estimate_pose_with(gcps, &EstimatorOptions::default())
    }

    /// Estimates the pose from `gcps` with `options` and returns a new camera
    /// carrying it, together with the solver report.
    ///
    /// `self` is left untouched; on failure no pose is produced.
    ///
    /// # Errors
    ///
    /// See [`PoseEstimator::estimate`].
    pub fn estimate_pose_with(
        &self,
        gcps: &[GroundControlPoint],
        options: &EstimatorOptions,
    ) -> Result<(Camera, PoseEstimate), CameraError> {
        let estimate = PoseEstimator::new(options.clone()).estimate(self, gcps)?;
        Ok((self.clone().with_pose(estimate.pose), estimate))
    }
}

fn yaml_f64(node: &Yaml) -> Option<f64> {
    node.as_f64().or_else(|| node.as_i64().map(|v| v as f64))
}

impl CameraModel for Camera {
    /// Projects a 3D point from camera coordinates to pixel coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraError::PointAtCameraCenter`]: If the Z-coordinate is too close
    ///   to zero or negative.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraError::PointAtCameraCenter);
        }
        Ok(projective_transform(point_3d, self.focal, &self.center()))
    }

    /// Unprojects pixel coordinates to a unit ray in camera coordinates.
    ///
    /// `mx = (u - width / 2) / focal`, `my = (v - height / 2) / focal`, and
    /// `(mx, my, 1)` is normalized.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraError> {
        if !point_2d.x.is_finite() || !point_2d.y.is_finite() {
            return Err(CameraError::InvalidParams(format!(
                "pixel coordinates must be finite, got ({}, {})",
                point_2d.x, point_2d.y
            )));
        }
        let center = self.center();
        let mx = (point_2d.x - center.x) / self.focal;
        let my = (point_2d.y - center.y) / self.focal;

        Ok(Vector3::new(mx, my, 1.0).normalize())
    }

    /// Loads camera parameters from a YAML file.
    ///
    /// Expected layout:
    ///
    /// ```yaml
    /// cam0:
    ///   camera_model: pinhole
    ///   focal: 1000.0
    ///   resolution: [1920, 1080]
    ///   pose: [0.0, 0.0, -50.0, 0.0, 0.0, 0.0] # optional
    /// ```
    ///
    /// # Errors
    ///
    /// * [`CameraError::IOError`] / [`CameraError::YamlError`] for unreadable or
    ///   malformed files.
    /// * [`CameraError::InvalidParams`] when a field is missing or mistyped.
    /// * [`CameraError::InvalidIntrinsics`] when the loaded values are invalid.
    fn load_from_yaml(path: &str) -> Result<Self, CameraError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraError::YamlError(format!("{path} is empty")))?;
        let cam = &doc["cam0"];

        let focal = yaml_f64(&cam["focal"]).ok_or_else(|| {
            CameraError::InvalidParams("YAML missing 'focal' or not a number".to_string())
        })?;

        let resolution_yaml = cam["resolution"].as_vec().ok_or_else(|| {
            CameraError::InvalidParams("YAML missing 'resolution' or not an array".to_string())
        })?;
        if resolution_yaml.len() != 2 {
            return Err(CameraError::InvalidParams(
                "'resolution' must hold [width, height]".to_string(),
            ));
        }
        let dimension = |i: usize, name: &str| -> Result<u32, CameraError> {
            resolution_yaml[i]
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| {
                    CameraError::InvalidParams(format!("Invalid {name}: not a non-negative integer"))
                })
        };
        let resolution = Resolution {
            width: dimension(0, "width")?,
            height: dimension(1, "height")?,
        };

        let pose = match &cam["pose"] {
            Yaml::BadValue | Yaml::Null => None,
            node => {
                let values = node
                    .as_vec()
                    .ok_or_else(|| {
                        CameraError::InvalidParams("'pose' must be an array".to_string())
                    })?
                    .iter()
                    .map(yaml_f64)
                    .collect::<Option<Vec<f64>>>()
                    .ok_or_else(|| {
                        CameraError::InvalidParams("Invalid pose: not a float".to_string())
                    })?;
                Some(Pose::from_slice(&values)?)
            }
        };

        let model = Camera {
            focal,
            resolution,
            pose,
        };

        model.validate_params()?;

        Ok(model)
    }

    /// Saves the camera to a YAML file in the layout read by
    /// [`Camera::load_from_yaml`]. The pose is written only when set.
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraError> {
        let yaml_err = |e: serde_yaml::Error| CameraError::YamlError(e.to_string());

        let mut cam0 = serde_yaml::Mapping::new();
        cam0.insert(
            serde_yaml::Value::String("camera_model".to_string()),
            serde_yaml::Value::String("pinhole".to_string()),
        );
        cam0.insert(
            serde_yaml::Value::String("focal".to_string()),
            serde_yaml::to_value(self.focal).map_err(yaml_err)?,
        );
        cam0.insert(
            serde_yaml::Value::String("resolution".to_string()),
            serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                .map_err(yaml_err)?,
        );
        if let Some(pose) = &self.pose {
            cam0.insert(
                serde_yaml::Value::String("pose".to_string()),
                serde_yaml::to_value(pose.to_array().to_vec()).map_err(yaml_err)?,
            );
        }

        let yaml = serde_yaml::Mapping::from_iter([(
            serde_yaml::Value::String("cam0".to_string()),
            serde_yaml::Value::Mapping(cam0),
        )]);

        let yaml_string = serde_yaml::to_string(&yaml).map_err(yaml_err)?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;

        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraError> {
        validation::validate_focal(self.focal)?;
        validation::validate_resolution(&self.resolution)?;
        if let Some(pose) = &self.pose {
            if !pose.is_finite() {
                return Err(CameraError::InvalidParams(format!(
                    "pose must be finite, got {pose:?}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn hd_camera() -> Camera {
        Camera::new(
            1000.0,
            Resolution {
                width: 1920,
                height: 1080,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_intrinsics() {
        let res = Resolution {
            width: 1920,
            height: 1080,
        };
        assert!(matches!(
            Camera::new(0.0, res),
            Err(CameraError::InvalidIntrinsics(_))
        ));
        assert!(matches!(
            Camera::new(
                500.0,
                Resolution {
                    width: 0,
                    height: 1080
                }
            ),
            Err(CameraError::InvalidIntrinsics(_))
        ));
        let camera = Camera::new(500.0, res).unwrap();
        assert!(camera.pose.is_none());
    }

    #[test]
    fn test_projective_transform() {
        let camera = hd_camera();
        let center = camera.center();

        let on_axis = projective_transform(&Vector3::new(0.0, 0.0, 10.0), 1000.0, &center);
        assert_relative_eq!(on_axis, Vector2::new(960.0, 540.0));

        // u = 2 / 10 * 1000 + 960, v = -1 / 10 * 1000 + 540
        let off_axis = projective_transform(&Vector3::new(2.0, -1.0, 10.0), 1000.0, &center);
        assert_relative_eq!(off_axis, Vector2::new(1160.0, 440.0));
    }

    #[test]
    fn test_projective_transform_is_unguarded() {
        let center = hd_camera().center();
        let at_plane = projective_transform(&Vector3::new(1.0, 0.0, 0.0), 1000.0, &center);
        assert!(at_plane.x.is_infinite());
        assert!(at_plane.y.is_nan());

        let behind = projective_transform(&Vector3::new(2.0, 1.0, -10.0), 1000.0, &center);
        let in_front = projective_transform(&Vector3::new(2.0, 1.0, 10.0), 1000.0, &center);
        assert_relative_eq!(behind.x - 960.0, -(in_front.x - 960.0));
        assert_relative_eq!(behind.y - 540.0, -(in_front.y - 540.0));
    }

    #[test]
    fn test_projection_scale_invariance() {
        let center = hd_camera().center();
        let point = Vector3::new(3.0, -2.0, 40.0);
        let reference = projective_transform(&point, 1000.0, &center);

        // Uniformly scaling the camera-local point leaves the pixel unchanged.
        let halved = projective_transform(&(point * 0.5), 1000.0, &center);
        assert_relative_eq!(reference, halved, epsilon = 1e-9);

        // Doubling the focal length while doubling depth at fixed lateral offset
        // also leaves the pixel unchanged.
        let dolly = projective_transform(
            &Vector3::new(point.x, point.y, 2.0 * point.z),
            2000.0,
            &center,
        );
        assert_relative_eq!(reference, dolly, epsilon = 1e-9);
    }

    #[test]
    fn test_guarded_project_and_unproject() {
        let camera = hd_camera();
        assert!(matches!(
            camera.project(&Vector3::new(1.0, 1.0, -3.0)),
            Err(CameraError::PointAtCameraCenter)
        ));

        let point_3d = Vector3::new(1.0, 1.0, 5.0);
        let pixel = camera.project(&point_3d).unwrap();
        let ray = camera.unproject(&pixel).unwrap();
        assert_relative_eq!(ray, point_3d.normalize(), epsilon = 1e-9);
    }

    #[test]
    fn test_project_points_requires_pose() {
        let camera = hd_camera();
        let points = Matrix3xX::from_column_slice(&[0.0, 60.0, -50.0]);
        assert!(matches!(
            camera.project_points(&points, None),
            Err(CameraError::PoseNotSet)
        ));

        let pose = Pose::new(0.0, 0.0, -50.0, 0.0, 0.0, 0.0);
        let explicit = camera.project_points(&points, Some(&pose)).unwrap();
        let stored = camera
            .clone()
            .with_pose(pose)
            .project_points(&points, None)
            .unwrap();
        assert_eq!(explicit, stored);
        assert_relative_eq!(explicit[(0, 0)], 960.0);
        assert_relative_eq!(explicit[(1, 0)], 540.0);
    }

    #[test]
    fn test_camera_load_from_yaml() {
        let camera = Camera::load_from_yaml("samples/camera.yaml").unwrap();
        assert_eq!(camera.focal, 1000.0);
        assert_eq!(camera.resolution.width, 1920);
        assert_eq!(camera.resolution.height, 1080);
        assert!(camera.pose.is_none());
    }

    #[test]
    fn test_camera_yaml_roundtrip_with_pose() {
        let path = std::env::temp_dir().join("gcp_pose_camera_roundtrip.yaml");
        let path = path.to_str().unwrap();

        let camera = hd_camera().with_pose(Pose::new(10.0, -4.5, 120.0, 0.1, -0.2, 1.3));
        camera.save_to_yaml(path).unwrap();
        let loaded = Camera::load_from_yaml(path).unwrap();
        std::fs::remove_file(path).ok();

        assert_eq!(loaded, camera);
    }

    #[test]
    fn test_camera_load_rejects_bad_focal() {
        let path = std::env::temp_dir().join("gcp_pose_camera_bad_focal.yaml");
        let path = path.to_str().unwrap();
        std::fs::write(path, "cam0:\n  focal: -1.0\n  resolution: [640, 480]\n").unwrap();
        let result = Camera::load_from_yaml(path);
        std::fs::remove_file(path).ok();

        assert!(matches!(result, Err(CameraError::InvalidIntrinsics(_))));
    }

    fn triangle_gcps() -> Vec<GroundControlPoint> {
        vec![
            GroundControlPoint::new(560.0, 340.0, -20.0, 50.0, -40.0),
            GroundControlPoint::new(1360.0, 740.0, 20.0, 50.0, -60.0),
            GroundControlPoint::new(960.0, 540.0, 0.0, 80.0, -50.0),
        ]
    }

    #[test]
    fn test_estimate_pose_with_seed() {
        let camera = hd_camera();
        let options = EstimatorOptions {
            min_abs_decrease: 1e-14,
            min_rel_decrease: 1e-14,
            min_error: 1e-20,
            ..EstimatorOptions::default()
        }
        .with_initial_pose(Pose::new(2.0, -3.0, -47.0, 0.05, -0.05, 0.05));

        let (posed, estimate) = camera
            .estimate_pose_with(&triangle_gcps(), &options)
            .unwrap();

        let expected = [0.0, 0.0, -50.0, 0.0, 0.0, 0.0];
        let pose = posed.pose().unwrap();
        for (actual, expected) in pose.to_array().iter().zip(expected.iter()) {
            assert!((actual - expected).abs() < 1e-3, "Unexpected pose {:?}", pose);
        }
        assert_eq!(*pose, estimate.pose);
        assert_eq!(posed.focal, camera.focal);
        assert!(camera.pose.is_none());
    }

    #[test]
    fn test_estimate_pose_default_seed_inside_points() {
        // The centroid seed sits among the points, so some start behind the camera.
        let camera = hd_camera();
        let result = camera.estimate_pose(&triangle_gcps());
        assert!(
            matches!(
                result,
                Err(CameraError::DegenerateProjection(_)) | Err(CameraError::NonConvergence(_))
            ),
            "Expected a typed failure, got {:?}",
            result
        );
        assert!(camera.pose.is_none());
    }
}
