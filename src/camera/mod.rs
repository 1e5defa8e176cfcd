//! Camera types shared across the crate.
//!
//! The [`Camera`] itself lives in [`pinhole`]; this module holds the sensor
//! [`Resolution`], the crate-wide [`CameraError`], the [`CameraModel`] trait and
//! the parameter validation helpers.

use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};

pub mod pinhole;

pub use pinhole::{projective_transform, Camera};

/// Sensor size in pixels. The optical axis passes through its center.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Pixel coordinates of the sensor center, `(width / 2, height / 2)`.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.width as f64 / 2.0, self.height as f64 / 2.0)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("Invalid camera intrinsics: {0}")]
    InvalidIntrinsics(String),
    #[error("Insufficient ground control points: {0}")]
    InsufficientGcps(String),
    #[error("Pose estimation did not converge: {0}")]
    NonConvergence(String),
    #[error("Degenerate projection: {0}")]
    DegenerateProjection(String),
    #[error("z is close to zero or negative, point is not in front of the camera")]
    PointAtCameraCenter,
    #[error("Camera pose has not been estimated or set")]
    PoseNotSet,
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
    #[error("Failed to load YAML: {0}")]
    YamlError(String),
    #[error("IO Error: {0}")]
    IOError(String),
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        CameraError::IOError(err.to_string())
    }
}

impl From<yaml_rust::ScanError> for CameraError {
    fn from(err: yaml_rust::ScanError) -> Self {
        CameraError::YamlError(err.to_string())
    }
}

/// Trait defining the core functionality for camera models
pub trait CameraModel {
    /// Project a 3D point given in camera coordinates to pixel coordinates.
    ///
    /// Unlike [`projective_transform`], implementations reject points that are
    /// not in front of the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraError>;

    /// Unproject pixel coordinates to a unit ray in camera coordinates
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraError>;

    /// Load camera parameters from a YAML file
    fn load_from_yaml(path: &str) -> Result<Self, CameraError>
    where
        Self: Sized;

    /// Save camera parameters to a YAML file
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraError>;

    /// Validate camera parameters
    fn validate_params(&self) -> Result<(), CameraError>;
}

/// Common validation functions for camera parameters
pub mod validation {
    use super::*;

    pub fn validate_focal(focal: f64) -> Result<(), CameraError> {
        if !focal.is_finite() || focal <= 0.0 {
            return Err(CameraError::InvalidIntrinsics(format!(
                "focal length must be positive and finite, got {focal}"
            )));
        }
        Ok(())
    }

    pub fn validate_resolution(resolution: &Resolution) -> Result<(), CameraError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(CameraError::InvalidIntrinsics(format!(
                "sensor dimensions must be positive, got {}x{}",
                resolution.width, resolution.height
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::validation::*;
    use super::*;

    #[test]
    fn test_validate_focal() {
        assert!(validate_focal(1000.0).is_ok());
        assert!(matches!(
            validate_focal(0.0),
            Err(CameraError::InvalidIntrinsics(_))
        ));
        assert!(matches!(
            validate_focal(-5.0),
            Err(CameraError::InvalidIntrinsics(_))
        ));
        assert!(matches!(
            validate_focal(f64::NAN),
            Err(CameraError::InvalidIntrinsics(_))
        ));
    }

    #[test]
    fn test_validate_resolution() {
        let ok = Resolution {
            width: 1920,
            height: 1080,
        };
        assert!(validate_resolution(&ok).is_ok());
        assert_eq!(ok.center(), Vector2::new(960.0, 540.0));

        let zero_height = Resolution {
            width: 640,
            height: 0,
        };
        assert!(matches!(
            validate_resolution(&zero_height),
            Err(CameraError::InvalidIntrinsics(_))
        ));
    }
}
