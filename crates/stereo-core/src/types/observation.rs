//! Board-to-image correspondences and reprojection error summaries.

use crate::{Pt2, Pt3};
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Chessboard corners seen by one camera in one capture, paired with their
/// board-frame coordinates.
///
/// ```
/// use stereo_core::{CorrespondenceView, Pt2, Pt3};
///
/// let board = vec![Pt3::new(0.0, 0.0, 0.0), Pt3::new(25.0, 0.0, 0.0)];
/// let corners = vec![Pt2::new(310.5, 242.0), Pt2::new(352.25, 241.5)];
/// let view = CorrespondenceView::new(board, corners).unwrap();
/// assert_eq!(view.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrespondenceView {
    /// Board-frame corner positions (`z = 0`).
    pub points_3d: Vec<Pt3>,
    /// Detected corner pixels, same order as `points_3d`.
    pub points_2d: Vec<Pt2>,
}

impl CorrespondenceView {
    pub fn new(points_3d: Vec<Pt3>, points_2d: Vec<Pt2>) -> Result<Self> {
        ensure!(
            points_3d.len() == points_2d.len(),
            "{} board points but {} detected corners",
            points_3d.len(),
            points_2d.len()
        );
        ensure!(
            points_3d.iter().all(|p| p.z == 0.0),
            "board points must lie on the z = 0 plane"
        );
        Ok(Self { points_3d, points_2d })
    }

    /// Board coordinates with `z` dropped, for homography fits.
    pub fn planar_points(&self) -> Vec<Pt2> {
        self.points_3d.iter().map(|p| p.xy()).collect()
    }

    pub fn len(&self) -> usize {
        self.points_2d.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_2d.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Pt3, &Pt2)> {
        self.points_3d.iter().zip(&self.points_2d)
    }
}

/// Pixel reprojection error over a set of corners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionStats {
    pub mean: f64,
    pub rms: f64,
    pub max: f64,
    pub count: usize,
}

impl ReprojectionStats {
    /// Summarize per-corner Euclidean errors. Empty input gives all zeros.
    pub fn from_errors(errors: &[f64]) -> Self {
        let Some(max) = errors.iter().copied().reduce(f64::max) else {
            return Self::default();
        };
        let n = errors.len() as f64;
        let (sum, sum_sq) = errors.iter().fold((0.0, 0.0), |(s, sq), e| (s + e, sq + e * e));
        Self {
            mean: sum / n,
            rms: (sum_sq / n).sqrt(),
            max,
            count: errors.len(),
        }
    }

    /// Combine two summaries as if their errors had been pooled.
    pub fn merge(&self, other: &Self) -> Self {
        let count = self.count + other.count;
        if count == 0 {
            return Self::default();
        }
        let (a, b) = (self.count as f64, other.count as f64);
        let n = count as f64;
        Self {
            mean: (self.mean * a + other.mean * b) / n,
            rms: ((self.rms * self.rms * a + other.rms * other.rms * b) / n).sqrt(),
            max: self.max.max(other.max),
            count,
        }
    }
}
