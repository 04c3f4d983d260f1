//! Chessboard detection for planar-target calibration.
//!
//! 1. Blur the image and compute a Hessian saddle response.
//! 2. Keep local maxima whose surrounding ring shows four alternating sectors.
//! 3. Estimate the two grid axes, link each corner to its ±u/±v neighbours and
//!    BFS-label the largest consistent component with integer `(col, row)`.
//! 4. Accept the component if it matches the expected `cols × rows` (up to swap)
//!    and refine every corner with the gradient-orthogonality iteration.
//!
//! [`synthetic`] renders boards through a [`stereo_core::CameraModel`] for tests.

mod chessboard;
mod corners;
mod grid;
pub mod gray;
pub mod subpix;
pub mod synthetic;

pub use chessboard::{ChessboardDetection, ChessboardDetector, ChessboardError, ChessboardParams};
pub use corners::CornerParams;
pub use grid::GridParams;
pub use subpix::SubPixParams;
