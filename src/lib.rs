//! GCP Pose Library
//!
//! Estimates the position and orientation of an ideal pinhole camera from
//! Ground Control Points (GCPs): world points with known coordinates whose
//! pixel locations have been observed in the image.
//!
//! The crate is organised as:
//! - [`camera`]: the pinhole [`Camera`], its projection and YAML configuration
//! - [`geometry`]: the camera [`Pose`], GCP records and the world-to-camera transform
//! - [`optimization`]: residuals, reprojection statistics and the
//!   Levenberg-Marquardt [`PoseEstimator`] built on tiny-solver
//! - [`util`]: CSV and JSON input/output

pub mod camera;
pub mod geometry;
pub mod optimization;
pub mod util;

// Re-export commonly used types
pub use camera::{Camera, CameraError, CameraModel, Resolution};
pub use geometry::{GroundControlPoint, Pose};
pub use optimization::{
    EstimatorOptions, InitialGuess, PoseEstimate, PoseEstimator, ProjectionError,
};
pub use util::UtilError;
