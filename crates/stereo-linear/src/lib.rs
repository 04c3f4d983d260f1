//! Closed-form ("linear") solvers used to initialize stereo calibration.
//!
//! Everything here is deterministic and non-iterative (or iterates a fixed,
//! small number of linear solves). Results are meant as starting points for
//! the non-linear refinement in `stereo-optim`, except for [`rectify`], whose
//! output is final.
//!
//! - [`homography`]: normalized DLT for plane → image homographies.
//! - [`zhang_intrinsics`]: Zhang's closed-form intrinsics from homographies.
//! - [`distortion_fit`]: linear Brown-Conrady estimate from homography residuals.
//! - [`iterative_intrinsics`]: alternating intrinsics/distortion estimation.
//! - [`planar_pose`]: board pose from a homography and intrinsics.
//! - [`stereo_init`]: initial left→right transform from per-view board poses.
//! - [`rectify`]: Bouguet stereo rectification (rotations, projections, `Q`).

pub mod distortion_fit;
pub mod homography;
pub mod iterative_intrinsics;
pub mod math;
pub mod planar_pose;
pub mod rectify;
pub mod stereo_init;
pub mod zhang_intrinsics;

pub mod prelude {
    pub use crate::homography::HomographySolver;
    pub use crate::iterative_intrinsics::{IterativeIntrinsicsOptions, IterativeIntrinsicsSolver};
    pub use crate::planar_pose::PlanarPoseSolver;
    pub use crate::rectify::{stereo_rectify, RectifyOptions};
    pub use crate::stereo_init::estimate_stereo_extrinsics;
    pub use crate::zhang_intrinsics::ZhangSolver;
}
