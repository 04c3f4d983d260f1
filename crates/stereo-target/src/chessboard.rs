use crate::corners::{detect_candidates, CornerParams};
use crate::gray::{blur, to_f32};
use crate::grid::{label_grid, GridParams};
use crate::subpix::{refine_corners, SubPixParams};
use image::GrayImage;
use log::debug;
use serde::{Deserialize, Serialize};
use stereo_core::{Pt2, TargetLayout};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChessboardError {
    #[error("image {width}x{height} is too small for detection")]
    ImageTooSmall { width: u32, height: u32 },
    #[error("found {found} corner candidates, need at least {required}")]
    NotEnoughCorners { found: usize, required: usize },
    #[error("no {cols}x{rows} corner grid among {candidates} candidates")]
    GridNotFound {
        cols: usize,
        rows: usize,
        candidates: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChessboardParams {
    pub corners: CornerParams,
    pub grid: GridParams,
    pub subpix: SubPixParams,
}

/// Detected inner corners in row-major order (`index = row * cols + col`).
#[derive(Debug, Clone, PartialEq)]
pub struct ChessboardDetection {
    pub cols: usize,
    pub rows: usize,
    pub corners: Vec<Pt2>,
}

/// Detector for a board with a known number of inner corners.
#[derive(Debug, Clone)]
pub struct ChessboardDetector {
    cols: usize,
    rows: usize,
    params: ChessboardParams,
}

impl ChessboardDetector {
    pub fn new(layout: &TargetLayout) -> Self {
        Self {
            cols: layout.cols,
            rows: layout.rows,
            params: ChessboardParams::default(),
        }
    }

    pub fn with_params(mut self, params: ChessboardParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &ChessboardParams {
        &self.params
    }

    pub fn detect(&self, img: &GrayImage) -> Result<ChessboardDetection, ChessboardError> {
        let (width, height) = img.dimensions();
        let min_side = 4 * (self.params.corners.ring_radius.ceil() as u32 + 2);
        if width < min_side || height < min_side {
            return Err(ChessboardError::ImageTooSmall { width, height });
        }

        let raw = to_f32(img);
        let blurred = blur(&raw, self.params.corners.blur_sigma);
        let candidates = detect_candidates(&blurred, &self.params.corners);
        let required = self.cols * self.rows;
        debug!("chessboard: {} saddle candidates", candidates.len());
        if candidates.len() < required {
            return Err(ChessboardError::NotEnoughCorners {
                found: candidates.len(),
                required,
            });
        }

        let points: Vec<Pt2> = candidates.iter().map(|c| c.pos).collect();
        let mut corners = label_grid(&points, self.cols, self.rows, &self.params.grid).ok_or(
            ChessboardError::GridNotFound {
                cols: self.cols,
                rows: self.rows,
                candidates: candidates.len(),
            },
        )?;
        refine_corners(&raw, &mut corners, &self.params.subpix);

        Ok(ChessboardDetection {
            cols: self.cols,
            rows: self.rows,
            corners,
        })
    }
}
