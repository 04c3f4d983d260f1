//! Dense depth from a calibrated stereo pair.
//!
//! Frames are rectified through precomputed [`RectificationMaps`], matched
//! with [`SgbmMatcher`] into a [`DisparityField`], and encoded for storage
//! with [`SparseDepth`]. [`visualize`] turns disparities into colour views.

pub mod codec;
pub mod disparity;
pub mod rectify_map;
pub mod sgbm;
pub mod speckle;
pub mod visualize;

pub use codec::{CodecError, SparseDepth};
pub use disparity::DisparityField;
pub use rectify_map::{RectificationMaps, RemapError, RemapTable};
pub use sgbm::{default_penalties, SgbmError, SgbmMatcher, SgbmMode, SgbmParams};
pub use visualize::{ViewSet, VisualStyle, Visualizer};

/// Fixed-point scale of matcher disparities (4 fractional bits).
pub const DISP_SCALE: i32 = 16;
