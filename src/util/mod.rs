//! Reading and writing ground control points and estimation reports.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use log::info;

use crate::geometry::GroundControlPoint;
use crate::optimization::PoseEstimate;

#[derive(thiserror::Error, Debug)]
pub enum UtilError {
    #[error("IO Error: {0}")]
    IOError(String),
    #[error("CSV error: {0}")]
    CsvError(String),
    #[error("JSON error: {0}")]
    JsonError(String),
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),
}

/// Loads ground control points from a CSV file with the header `u,v,x,y,z`.
///
/// Fields may be padded with whitespace and lines starting with `#` are
/// skipped.
///
/// # Errors
///
/// * [`UtilError::IOError`] / [`UtilError::CsvError`] for unreadable or
///   malformed files.
/// * [`UtilError::InvalidParams`] if the file holds no points or a row is not
///   finite.
pub fn load_gcps_from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<GroundControlPoint>, UtilError> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .comment(Some(b'#'))
        .from_path(path)?;

    let mut gcps = Vec::new();
    for (row, record) in reader.deserialize::<GroundControlPoint>().enumerate() {
        let gcp = record?;
        if !gcp.is_finite() {
            return Err(UtilError::InvalidParams(format!(
                "row {} of {} is not finite",
                row + 1,
                path.display()
            )));
        }
        gcps.push(gcp);
    }

    if gcps.is_empty() {
        return Err(UtilError::InvalidParams(format!(
            "{} holds no ground control points",
            path.display()
        )));
    }

    info!("Loaded {} ground control points from {}", gcps.len(), path.display());
    Ok(gcps)
}

/// Writes ground control points as CSV with the header `u,v,x,y,z`.
pub fn save_gcps_to_csv<P: AsRef<Path>>(
    path: P,
    gcps: &[GroundControlPoint],
) -> Result<(), UtilError> {
    let mut writer = csv::Writer::from_path(path)?;
    for gcp in gcps {
        writer.serialize(gcp)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes an estimation report as pretty-printed JSON.
pub fn save_estimate_json<P: AsRef<Path>>(
    path: P,
    estimate: &PoseEstimate,
) -> Result<(), UtilError> {
    let json = serde_json::to_string_pretty(estimate)?;
    let mut file = File::create(path)?;
    file.write_all(json.as_bytes())?;
    writeln!(file)?;
    Ok(())
}

impl From<std::io::Error> for UtilError {
    fn from(err: std::io::Error) -> Self {
        UtilError::IOError(err.to_string())
    }
}

impl From<csv::Error> for UtilError {
    fn from(err: csv::Error) -> Self {
        UtilError::CsvError(err.to_string())
    }
}

impl From<serde_json::Error> for UtilError {
    fn from(err: serde_json::Error) -> Self {
        UtilError::JsonError(err.to_string())
    }
}
