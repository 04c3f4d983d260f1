//! Stereo calibration workflow and its persisted output.
//!
//! - [`calibration`]: chessboard pairs → camera models, extrinsics,
//!   rectification geometry and remap tables ([`StereoCalibrator`]).
//! - [`bundle`]: the versioned JSON file that carries a calibration to the
//!   depth session ([`CalibrationBundle`]).
//! - [`rig`]: a loaded bundle ready to rectify frames ([`StereoRig`]).
//! - [`quality`]: warnings, row-correlation and disparity-coverage checks.
//!
//! ```no_run
//! use stereo_pipeline::{CalibrationConfig, StereoCalibrator};
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let calib = StereoCalibrator::new(CalibrationConfig::default())?
//!     .calibrate_dir(std::path::Path::new("calib_images"))?;
//! calib.bundle().save(std::path::Path::new("stereo_calibration.json"))?;
//! # Ok(())
//! # }
//! ```

pub mod bundle;
pub mod calibration;
pub mod quality;
pub mod rig;

pub use bundle::{BundleError, CalibrationBundle, CameraPair, BUNDLE_VERSION};
pub use calibration::{
    discover_pairs, CalibrationConfig, CalibrationError, CameraSide, Detections, PairSide, SkippedPair,
    StereoCalibration, StereoCalibrator,
};
pub use quality::{verify_rectification, FitStage, Grade, QualityWarning, RectificationReport};
pub use rig::StereoRig;
