//! World-side geometry: camera [`Pose`], [`GroundControlPoint`] records and the
//! rigid world-to-camera transform that links them.

use crate::camera::{Camera, CameraError, CameraModel};
use nalgebra::{
    DVector, Matrix3, Matrix3x4, Matrix3xX, Matrix4, Matrix4xX, Point2, RealField, Vector2,
    Vector3, Vector4,
};
use serde::{Deserialize, Serialize};

/// Camera pose in world coordinates.
///
/// `x, y, z` is the camera position; `roll, pitch, yaw` are in radians and are
/// composed by [`world_to_camera_matrix`]. Angles are not wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl Pose {
    /// Number of pose parameters.
    pub const DIM: usize = 6;

    pub fn new(x: f64, y: f64, z: f64, roll: f64, pitch: f64, yaw: f64) -> Self {
        Pose {
            x,
            y,
            z,
            roll,
            pitch,
            yaw,
        }
    }

    /// Builds a pose from `[x, y, z, roll, pitch, yaw]`.
    pub fn from_slice(values: &[f64]) -> Result<Self, CameraError> {
        match *values {
            [x, y, z, roll, pitch, yaw] => Ok(Pose::new(x, y, z, roll, pitch, yaw)),
            _ => Err(CameraError::InvalidParams(format!(
                "pose requires {} values, got {}",
                Self::DIM,
                values.len()
            ))),
        }
    }

    pub fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.roll, self.pitch, self.yaw]
    }

    pub fn to_dvector(&self) -> DVector<f64> {
        DVector::from_row_slice(&self.to_array())
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// The 3×4 world-to-camera operator `C` for this pose.
    pub fn world_to_camera(&self) -> Matrix3x4<f64> {
        world_to_camera_matrix(&self.position(), self.roll, self.pitch, self.yaw)
    }

    /// The rotation block of [`Pose::world_to_camera`].
    pub fn rotation(&self) -> Matrix3<f64> {
        self.world_to_camera().fixed_view::<3, 3>(0, 0).into_owned()
    }

    /// Maps a world point into the camera-local frame.
    pub fn transform_point(&self, point_world: &Vector3<f64>) -> Vector3<f64> {
        rotational_transform(self, &homogeneous(point_world))
    }

    /// Maps a camera-local point back into world coordinates.
    pub fn camera_to_world(&self, point_camera: &Vector3<f64>) -> Vector3<f64> {
        self.rotation().transpose() * point_camera + self.position()
    }
}

/// A ground control point: observed pixel `(u, v)` of the known world point
/// `(x, y, z)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroundControlPoint {
    pub u: f64,
    pub v: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl GroundControlPoint {
    pub fn new(u: f64, v: f64, x: f64, y: f64, z: f64) -> Self {
        GroundControlPoint { u, v, x, y, z }
    }

    pub fn pixel(&self) -> Vector2<f64> {
        Vector2::new(self.u, self.v)
    }

    pub fn world(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// World coordinates as `(x, y, z, 1)`.
    pub fn homogeneous(&self) -> Vector4<f64> {
        homogeneous(&self.world())
    }

    pub fn is_finite(&self) -> bool {
        [self.u, self.v, self.x, self.y, self.z]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// Builds the world-to-camera operator
/// `C = Raxis · Rroll · Rpitch · Ryaw · T`.
///
/// `T` translates the world so the camera sits at the origin. `Ryaw` is 3×4 and
/// drops the homogeneous coordinate. `Rpitch` and `Rroll` rotate about the x and
/// y axes of the yawed frame, and `Raxis` swaps the world up axis into the
/// camera's image-down axis so that depth ends up in the third component.
///
/// The products are evaluated strictly left to right; reordering them changes
/// the result. Generic over [`RealField`] so the solver can differentiate it.
pub fn world_to_camera_matrix<T: RealField>(
    position: &Vector3<T>,
    roll: T,
    pitch: T,
    yaw: T,
) -> Matrix3x4<T> {
    let zero = T::zero();
    let one = T::one();
    let (sin_roll, cos_roll) = roll.sin_cos();
    let (sin_pitch, cos_pitch) = pitch.sin_cos();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();

    #[rustfmt::skip]
    let r_axis = Matrix3::new(
        one.clone(),  zero.clone(), zero.clone(),
        zero.clone(), zero.clone(), -one.clone(),
        zero.clone(), one.clone(),  zero.clone(),
    );
    #[rustfmt::skip]
    let r_roll = Matrix3::new(
        cos_roll.clone(), zero.clone(), -sin_roll.clone(),
        zero.clone(),     one.clone(),  zero.clone(),
        sin_roll,         zero.clone(), cos_roll,
    );
    #[rustfmt::skip]
    let r_pitch = Matrix3::new(
        one.clone(),  zero.clone(),      zero.clone(),
        zero.clone(), cos_pitch.clone(), sin_pitch.clone(),
        zero.clone(), -sin_pitch,        cos_pitch,
    );
    #[rustfmt::skip]
    let r_yaw = Matrix3x4::new(
        cos_yaw.clone(), -sin_yaw.clone(), zero.clone(), zero.clone(),
        sin_yaw,         cos_yaw,          zero.clone(), zero.clone(),
        zero.clone(),    zero.clone(),     one.clone(),  zero.clone(),
    );
    #[rustfmt::skip]
    let translation = Matrix4::new(
        one.clone(),  zero.clone(), zero.clone(), -position.x.clone(),
        zero.clone(), one.clone(),  zero.clone(), -position.y.clone(),
        zero.clone(), zero.clone(), one.clone(),  -position.z.clone(),
        zero.clone(), zero.clone(), zero,         one,
    );

    r_axis * r_roll * r_pitch * r_yaw * translation
}

/// Maps a homogeneous world point `(x, y, z, 1)` into the camera-local frame of
/// `pose`.
pub fn rotational_transform(pose: &Pose, point: &Vector4<f64>) -> Vector3<f64> {
    pose.world_to_camera() * point
}

/// `(x, y, z)` to `(x, y, z, 1)`.
pub fn homogeneous(point: &Vector3<f64>) -> Vector4<f64> {
    Vector4::new(point.x, point.y, point.z, 1.0)
}

/// Appends a row of ones to a 3×N matrix of points.
pub fn to_homogeneous(points: &Matrix3xX<f64>) -> Matrix4xX<f64> {
    Matrix4xX::from_fn(points.ncols(), |r, c| if r < 3 { points[(r, c)] } else { 1.0 })
}

/// Generate a grid of sample points that are evenly distributed across the image
fn pixel_grid(width: f64, height: f64, n: usize) -> Vec<Point2<f64>> {
    let mut points = Vec::new();

    // Calculate the number of cells in each dimension
    let num_cells_x = ((n as f64 * (width / height)).sqrt().round() as usize).max(1);
    let num_cells_y = ((n as f64 * (height / width)).sqrt().round() as usize).max(1);

    let cell_width = width / num_cells_x as f64;
    let cell_height = height / num_cells_y as f64;

    // Generate a point at the center of each cell
    for i in 0..num_cells_y {
        for j in 0..num_cells_x {
            let x = (j as f64 + 0.5) * cell_width;
            let y = (i as f64 + 0.5) * cell_height;
            points.push(Point2::new(x, y));
        }
    }

    points
}

/// Generates synthetic ground control points seen by `camera` from `pose`.
///
/// Roughly `n` pixels are laid out on a regular grid over the sensor and pushed
/// out along their rays to depths spread over `[min_depth, max_depth]`, so the
/// resulting world points are not coplanar. The pixel stored in each point is
/// the forward projection of its world coordinates under `pose`.
///
/// # Errors
///
/// * [`CameraError::InvalidParams`] if the depth range is empty, non-positive
///   or non-finite.
pub fn sample_points(
    camera: &Camera,
    pose: &Pose,
    n: usize,
    min_depth: f64,
    max_depth: f64,
) -> Result<Vec<GroundControlPoint>, CameraError> {
    if !(min_depth.is_finite() && max_depth.is_finite() && min_depth > 0.0)
        || max_depth < min_depth
    {
        return Err(CameraError::InvalidParams(format!(
            "invalid depth range [{min_depth}, {max_depth}]"
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let grid = pixel_grid(
        camera.resolution.width as f64,
        camera.resolution.height as f64,
        n,
    );

    let mut gcps = Vec::with_capacity(grid.len());
    for (i, pixel) in grid.iter().enumerate() {
        // Scatter depths so neighbouring grid cells land at different distances.
        let t = ((i * 7) % 11) as f64 / 10.0;
        let depth = min_depth + (max_depth - min_depth) * t;

        let ray = camera.unproject(&pixel.coords)?;
        let point_camera = ray * (depth / ray.z);
        let world = pose.camera_to_world(&point_camera);

        let projected = camera.project(&pose.transform_point(&world))?;
        gcps.push(GroundControlPoint::new(
            projected.x,
            projected.y,
            world.x,
            world.y,
            world.z,
        ));
    }

    Ok(gcps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Resolution;
    use approx::assert_relative_eq;
    use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

    fn sample_poses() -> Vec<Pose> {
        vec![
            Pose::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0),
            Pose::new(1.0, -2.0, 30.0, 0.3, -0.7, 2.1),
            Pose::new(-15.0, 4.0, 100.0, FRAC_PI_2, FRAC_PI_4, FRAC_PI_4),
            Pose::new(0.0, 0.0, -50.0, -3.0, 2.5, -1.2),
        ]
    }

    #[test]
    fn test_rotation_is_proper() {
        for pose in sample_poses() {
            let r = pose.rotation();
            assert_relative_eq!(r * r.transpose(), Matrix3::identity(), epsilon = 1e-12);
            assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_zero_angles_look_along_world_y() {
        let pose = Pose::new(0.0, 0.0, -50.0, 0.0, 0.0, 0.0);
        // Axis remap only: (dx, dy, dz) -> (dx, -dz, dy)
        let local = pose.transform_point(&Vector3::new(3.0, 60.0, -48.0));
        assert_relative_eq!(local, Vector3::new(3.0, -2.0, 60.0), epsilon = 1e-12);
    }

    #[test]
    fn test_yaw_turns_forward_axis() {
        // A quarter turn of yaw makes world +X the viewing direction.
        let pose = Pose::new(0.0, 0.0, 0.0, 0.0, 0.0, FRAC_PI_2);
        let local = pose.transform_point(&Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(local, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
    }

    #[test]
    fn test_pitch_tilts_towards_up() {
        // A quarter turn of pitch makes world +Z the viewing direction.
        let pose = Pose::new(0.0, 0.0, 0.0, 0.0, FRAC_PI_2, 0.0);
        let local = pose.transform_point(&Vector3::new(0.0, 0.0, 1.0));
        assert_relative_eq!(local, Vector3::new(0.0, 0.0, 1.0), epsilon = 1e-12);
        let ahead = pose.transform_point(&Vector3::new(0.0, 1.0, 0.0));
        assert_relative_eq!(ahead, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_roll_rotates_about_optical_axis() {
        let pose = Pose::new(0.0, 0.0, 0.0, FRAC_PI_2, 0.0, 0.0);
        // Depth is unaffected by roll.
        let local = pose.transform_point(&Vector3::new(0.0, 5.0, 0.0));
        assert_relative_eq!(local, Vector3::new(0.0, 0.0, 5.0), epsilon = 1e-12);
        // World up lands on the negative image x axis.
        let up = pose.transform_point(&Vector3::new(0.0, 0.0, 1.0));
        assert_relative_eq!(up, Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_translation_is_applied_before_rotation() {
        for pose in sample_poses() {
            let origin = pose.transform_point(&pose.position());
            assert_relative_eq!(origin, Vector3::zeros(), epsilon = 1e-12);

            let c = pose.world_to_camera();
            let t = c.column(3).into_owned();
            assert_relative_eq!(t, -(pose.rotation() * pose.position()), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_camera_to_world_inverts_transform() {
        let world = Vector3::new(12.0, -7.5, 3.25);
        for pose in sample_poses() {
            let back = pose.camera_to_world(&pose.transform_point(&world));
            assert_relative_eq!(back, world, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_pose_from_slice() {
        let pose = Pose::from_slice(&[1.0, 2.0, 3.0, 0.1, 0.2, 0.3]).unwrap();
        assert_eq!(pose.to_array(), [1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
        assert!(matches!(
            Pose::from_slice(&[1.0, 2.0]),
            Err(CameraError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_to_homogeneous() {
        let points = Matrix3xX::from_column_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let h = to_homogeneous(&points);
        assert_eq!(h.ncols(), 2);
        assert_eq!(h.column(1).into_owned(), Vector4::new(4.0, 5.0, 6.0, 1.0));
        assert_eq!(
            GroundControlPoint::new(0.0, 0.0, 1.0, 2.0, 3.0).homogeneous(),
            Vector4::new(1.0, 2.0, 3.0, 1.0)
        );
    }

    #[test]
    fn test_sample_points() {
        let camera = Camera::new(
            800.0,
            Resolution {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        let pose = Pose::new(5.0, -3.0, 120.0, 0.05, -1.1, 0.4);
        let n = 100;

        let gcps = sample_points(&camera, &pose, n, 80.0, 200.0).unwrap();

        let expected_count = (n as f64 * 0.8) as usize..=(n as f64 * 1.2) as usize;
        assert!(
            expected_count.contains(&gcps.len()),
            "Expected around {} points, got {}",
            n,
            gcps.len()
        );

        for gcp in &gcps {
            let local = pose.transform_point(&gcp.world());
            assert!(local.z >= 80.0 - 1e-6 && local.z <= 200.0 + 1e-6);
            assert!(gcp.u >= 0.0 && gcp.u < 800.0);
            assert!(gcp.v >= 0.0 && gcp.v < 600.0);
        }
    }

    #[test]
    fn test_sample_points_rejects_bad_depths() {
        let camera = Camera::new(
            800.0,
            Resolution {
                width: 800,
                height: 600,
            },
        )
        .unwrap();
        let pose = Pose::new(0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert!(sample_points(&camera, &pose, 10, 0.0, 10.0).is_err());
        assert!(sample_points(&camera, &pose, 10, 20.0, 10.0).is_err());
        assert!(sample_points(&camera, &pose, 0, 1.0, 10.0)
            .unwrap()
            .is_empty());
    }
}
