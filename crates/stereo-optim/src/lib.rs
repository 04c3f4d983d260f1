//! Non-linear least-squares refinement for stereo calibration.
//!
//! Problems implement [`Objective`] with dense residual/Jacobian evaluation
//! and are solved by a [`Minimizer`]; the default backend wraps the
//! `levenberg-marquardt` crate.
//!
//! - [`planar_intrinsics`]: one camera, intrinsics + distortion + per-view poses.
//! - [`stereo_extrinsics`]: left → right transform + left-target poses with
//!   both cameras held fixed.

pub mod backend_lm;
pub mod params;
pub mod planar_intrinsics;
pub mod robust;
pub mod stereo_extrinsics;
mod residual;
mod traits;

pub use backend_lm::LmBackend;
pub use robust::RobustKernel;
pub use traits::{Objective, Minimizer, SolveOptions, SolveReport};

use thiserror::Error;

/// Errors raised while building or decoding an optimization problem.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptimError {
    #[error("problem needs at least one view")]
    NoViews,
    #[error("view {view} has {count} points (need >= {required})")]
    TooFewPoints {
        view: usize,
        count: usize,
        required: usize,
    },
    #[error("left/right view {view} disagree on point count ({left} vs {right})")]
    PairMismatch {
        view: usize,
        left: usize,
        right: usize,
    },
    #[error("expected {expected} initial poses, got {got}")]
    PoseCountMismatch { expected: usize, got: usize },
    #[error("parameter vector has length {got}, expected {expected}")]
    ParamDim { expected: usize, got: usize },
}
