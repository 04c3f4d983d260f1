//! Planar chessboard target description and stereo observations of it.

use crate::{CorrespondenceView, ImageSize, Pt2, Pt3, Real};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Inner-corner topology and physical spacing of a chessboard target.
///
/// Corners are ordered row-major: index `row * cols + col`, with target-frame
/// coordinates `(col * square_size, row * square_size, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetLayout {
    /// Inner corners per row.
    pub cols: usize,
    /// Inner corners per column.
    pub rows: usize,
    /// Square edge length in world units (millimetres by convention).
    pub square_size: Real,
}

impl Default for TargetLayout {
    fn default() -> Self {
        // 9x6 squares board.
        Self {
            cols: 8,
            rows: 5,
            square_size: 15.0,
        }
    }
}

impl TargetLayout {
    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Target-frame corner positions on the Z=0 plane.
    pub fn object_points(&self) -> Vec<Pt3> {
        let mut points = Vec::with_capacity(self.corner_count());
        for row in 0..self.rows {
            for col in 0..self.cols {
                points.push(Pt3::new(
                    col as Real * self.square_size,
                    row as Real * self.square_size,
                    0.0,
                ));
            }
        }
        points
    }
}

/// One calibration sample: the same target instant seen by both cameras.
///
/// `left[i]` and `right[i]` both correspond to `TargetLayout::object_points()[i]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanarTargetObservation {
    pub left: Vec<Pt2>,
    pub right: Vec<Pt2>,
}

/// Validated set of stereo observations of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoDataset {
    pub layout: TargetLayout,
    pub image_size: ImageSize,
    pub observations: Vec<PlanarTargetObservation>,
}

impl StereoDataset {
    /// # Errors
    ///
    /// Fails if any observation does not carry exactly one point per target corner
    /// in both cameras.
    pub fn new(
        layout: TargetLayout,
        image_size: ImageSize,
        observations: Vec<PlanarTargetObservation>,
    ) -> Result<Self> {
        let expected = layout.corner_count();
        ensure!(expected >= 4, "target must have at least 4 corners, got {expected}");
        for (idx, obs) in observations.iter().enumerate() {
            ensure!(
                obs.left.len() == expected && obs.right.len() == expected,
                "observation {idx}: expected {expected} corners per camera, got left={} right={}",
                obs.left.len(),
                obs.right.len()
            );
        }
        Ok(Self {
            layout,
            image_size,
            observations,
        })
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Per-view correspondences for the left camera.
    pub fn left_views(&self) -> Vec<CorrespondenceView> {
        self.views_with(|obs| &obs.left)
    }

    /// Per-view correspondences for the right camera.
    pub fn right_views(&self) -> Vec<CorrespondenceView> {
        self.views_with(|obs| &obs.right)
    }

    fn views_with(&self, pick: impl Fn(&PlanarTargetObservation) -> &Vec<Pt2>) -> Vec<CorrespondenceView> {
        let object = self.layout.object_points();
        self.observations
            .iter()
            .map(|obs| CorrespondenceView {
                points_3d: object.clone(),
                points_2d: pick(obs).clone(),
            })
            .collect()
    }
}
