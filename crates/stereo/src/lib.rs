//! High-level entry crate for the stereo depth toolbox.
//!
//! The workflow has three stages, each usable on its own:
//!
//! 1. **Calibration**: detect a chessboard in paired left/right images, fit
//!    both cameras and their relative pose, and derive the rectification
//!    ([`calibration`]).
//! 2. **Depth**: rectify live frames through the saved maps and match them
//!    with semi-global block matching ([`depth`]).
//! 3. **Capture**: seal a frame's images and disparities into a signed
//!    record, persist it and upload it ([`capture`]).
//!
//! ```no_run
//! use std::path::Path;
//! use stereo::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let calibrator = StereoCalibrator::new(CalibrationConfig::default())?;
//! let result = calibrator.calibrate_dir(Path::new("calib_images"))?;
//! result.bundle().save(Path::new("stereo_calibration.json"))?;
//!
//! let rig = StereoRig::load(Path::new("stereo_calibration.json"))?;
//! let left = ImageSequenceSource::from_dir(Path::new("frames"), "left_")?;
//! let right = ImageSequenceSource::from_dir(Path::new("frames"), "right_")?;
//! let session = DepthSession::new(
//!     rig,
//!     Box::new(left),
//!     Box::new(right),
//!     SessionConfig::default(),
//!     &ProvenanceConfig::default(),
//! )?;
//! # let _ = session;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Organization
//!
//! - **[`calibration`]**: calibration workflow, bundles and quality checks
//! - **[`depth`]**: rectification maps, the matcher and visualisation
//! - **[`capture`]**: depth session loop, records, signing and transport
//! - **[`core`]**, **[`linear`]**, **[`optim`]**, **[`target`]**: building blocks
//! - **[`prelude`]**: common re-exports

/// Stereo calibration workflow, calibration bundles and quality checks.
pub mod calibration {
    pub use stereo_pipeline::*;
}

/// Rectification maps, semi-global matching, sparse depth encoding and views.
pub mod depth {
    pub use stereo_depth::*;
}

/// Live depth session and signed capture records.
pub mod capture {
    pub use stereo_capture::*;
}

/// Math types, camera models and observation containers.
pub mod core {
    pub use stereo_core::*;
}

/// Closed-form initialization and rectification geometry.
pub mod linear {
    pub use stereo_linear::*;
}

/// Non-linear refinement of intrinsics and stereo extrinsics.
pub mod optim {
    pub use stereo_optim::*;
}

/// Chessboard detection.
pub mod target {
    pub use stereo_target::*;
}

/// Convenient re-exports for common use cases.
pub mod prelude {
    pub use crate::core::{
        BrownConrady5, CameraModel, FxFyCxCySkew, ImageSize, Pt2, Pt3, Real, RectificationGeometry,
        StereoExtrinsics, TargetLayout,
    };

    pub use crate::calibration::{
        verify_rectification, CalibrationBundle, CalibrationConfig, CalibrationError, StereoCalibration,
        StereoCalibrator, StereoRig,
    };

    pub use crate::depth::{
        DisparityField, RectificationMaps, SgbmMatcher, SgbmMode, SgbmParams, SparseDepth, VisualStyle, Visualizer,
    };

    pub use crate::capture::{
        verify_record, CaptureRecord, DepthSession, FrameSource, HmacSigner, ImageSequenceSource, OperatorCommand,
        OperatorInput, Presenter, ProvenanceConfig, SessionConfig, Signer, Transport, Verifier,
    };

    pub use crate::target::{ChessboardDetector, ChessboardParams};
}
