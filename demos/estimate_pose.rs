//! Camera Pose Estimation Example
//!
//! Estimates the pose of a pinhole camera from a set of ground control points
//! and writes the camera, now carrying its pose, back to YAML.
//!
//! Usage:
//! ```bash
//! RUST_LOG=info cargo run --example estimate_pose -- \
//!   --camera-path samples/camera.yaml \
//!   --gcps-path samples/gcps.csv \
//!   --seed 2,-3,-47,0.05,-0.05,0.05 \
//!   --output-path output/camera_pose.yaml \
//!   --report-path output/camera_pose.json
//! ```

use clap::Parser;
use gcp_pose::camera::{Camera, CameraModel};
use gcp_pose::geometry::Pose;
use gcp_pose::optimization::EstimatorOptions;
use gcp_pose::util;
use log::{error, info};
use std::path::PathBuf;

/// Camera pose estimation tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the camera YAML file
    #[arg(short = 'c', long)]
    camera_path: PathBuf,

    /// Path to the CSV file of ground control points (u,v,x,y,z)
    #[arg(short = 'g', long)]
    gcps_path: PathBuf,

    /// Initial pose as x,y,z,roll,pitch,yaw (angles in radians).
    /// Defaults to the centroid of the points.
    #[arg(short = 's', long, value_delimiter = ',', num_args = 6, allow_negative_numbers = true)]
    seed: Option<Vec<f64>>,

    /// Maximum number of solver iterations
    #[arg(long, default_value_t = 100)]
    max_iterations: usize,

    /// Reject the estimate if its RMS reprojection error exceeds this many pixels
    #[arg(long)]
    max_rmse: Option<f64>,

    /// Where to write the camera with its estimated pose
    #[arg(short = 'o', long)]
    output_path: PathBuf,

    /// Optional JSON report of the estimation
    #[arg(short = 'r', long)]
    report_path: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    info!("Camera Path: {:?}", cli.camera_path);
    info!("GCPs Path: {:?}", cli.gcps_path);

    let camera_path = cli.camera_path.to_str().ok_or("Invalid camera path string")?;
    let camera = Camera::load_from_yaml(camera_path)?;
    info!("Camera: {:?}", camera);

    let gcps = util::load_gcps_from_csv(&cli.gcps_path)?;

    let mut options = EstimatorOptions {
        max_iterations: cli.max_iterations,
        max_rmse: cli.max_rmse,
        ..EstimatorOptions::default()
    };
    if let Some(seed) = &cli.seed {
        options = options.with_initial_pose(Pose::from_slice(seed)?);
    }

    let (posed, estimate) = match camera.estimate_pose_with(&gcps, &options) {
        Ok(result) => result,
        Err(e) => {
            error!("Pose estimation failed: {}", e);
            return Err(e.into());
        }
    };

    info!("Estimated pose: {:?}", estimate.pose);
    info!("Final cost: {:e}", estimate.final_cost);
    info!("{:?}", estimate.reprojection_error);

    let output_path = cli.output_path.to_str().ok_or("Invalid output path string")?;
    if let Some(parent) = cli.output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    posed.save_to_yaml(output_path)?;
    info!("Saved camera to {}", output_path);

    if let Some(report_path) = &cli.report_path {
        util::save_estimate_json(report_path, &estimate)?;
        info!("Saved report to {:?}", report_path);
    }

    Ok(())
}
