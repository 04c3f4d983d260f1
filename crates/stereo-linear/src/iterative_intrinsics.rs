//! Alternating linear estimation of intrinsics and distortion.
//!
//! Zhang's method is biased when the pixels are distorted. The solver here
//! alternates:
//!
//! 1. estimate K from the current (initially raw) pixels,
//! 2. estimate distortion from homography residuals with that K,
//! 3. undistort the raw pixels with the new distortion,
//!
//! for a fixed number of iterations. The result seeds non-linear refinement.

use crate::{
    distortion_fit::{DistortionFitError, DistortionFitOptions, DistortionSolver, DistortionView},
    homography::{HomographyError, HomographySolver},
    zhang_intrinsics::{ZhangError, ZhangSolver},
};
use log::debug;
use stereo_core::{BrownConrady5, CorrespondenceView, DistortionModel, FxFyCxCySkew, IntrinsicsModel, Pt2, Real};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IterativeIntrinsicsError {
    #[error("zhang intrinsics failed: {0}")]
    Zhang(#[from] ZhangError),
    #[error("distortion estimation failed: {0}")]
    Distortion(#[from] DistortionFitError),
    #[error("homography estimation failed in view {view}: {source}")]
    Homography {
        view: usize,
        #[source]
        source: HomographyError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct IterativeIntrinsicsOptions {
    /// Number of distortion → K refinement rounds after the initial Zhang estimate.
    pub iterations: usize,
    pub distortion_opts: DistortionFitOptions,
    /// Force skew to zero after each intrinsics estimate.
    pub zero_skew: bool,
}

impl Default for IterativeIntrinsicsOptions {
    fn default() -> Self {
        Self {
            iterations: 2,
            distortion_opts: DistortionFitOptions::default(),
            zero_skew: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IterativeIntrinsicsResult {
    pub intrinsics: FxFyCxCySkew<Real>,
    pub distortion: BrownConrady5<Real>,
}

#[derive(Debug, Clone, Copy)]
pub struct IterativeIntrinsicsSolver;

impl IterativeIntrinsicsSolver {
    /// Estimate intrinsics and distortion from planar views (board Z=0).
    pub fn estimate(
        views: &[CorrespondenceView],
        opts: IterativeIntrinsicsOptions,
    ) -> Result<IterativeIntrinsicsResult, IterativeIntrinsicsError> {
        let boards: Vec<Vec<Pt2>> = views.iter().map(CorrespondenceView::planar_points).collect();

        let homographies = |pixels: &[Vec<Pt2>]| {
            boards
                .iter()
                .zip(pixels)
                .enumerate()
                .map(|(view, (b, p))| {
                    HomographySolver::dlt(b, p)
                        .map_err(|source| IterativeIntrinsicsError::Homography { view, source })
                })
                .collect::<Result<Vec<_>, _>>()
        };

        let raw_owned: Vec<Vec<Pt2>> = views.iter().map(|v| v.points_2d.clone()).collect();
        let mut intrinsics = ZhangSolver::from_homographies(&homographies(&raw_owned[..])?)?;
        if opts.zero_skew {
            intrinsics.skew = 0.0;
        }
        let mut distortion = BrownConrady5 {
            iters: opts.distortion_opts.iters,
            ..Default::default()
        };
        debug!("zhang init: {intrinsics:?}");

        for iter in 0..opts.iterations {
            let raw_h = homographies(&raw_owned[..])?;
            let dviews: Vec<DistortionView> = raw_h
                .into_iter()
                .zip(&boards)
                .zip(&raw_owned)
                .map(|((homography, b), p)| DistortionView {
                    homography,
                    board_points: b.clone(),
                    pixel_points: p.clone(),
                })
                .collect();
            distortion =
                DistortionSolver::from_homographies(&intrinsics.k_matrix(), &dviews, opts.distortion_opts)?;

            let undistorted: Vec<Vec<Pt2>> = raw_owned
                .iter()
                .map(|pixels| {
                    pixels
                        .iter()
                        .map(|px| {
                            let n = distortion.undistort(&intrinsics.pixel_to_normalized(&px.coords));
                            let p = intrinsics.normalized_to_pixel(&n);
                            Pt2::new(p.x, p.y)
                        })
                        .collect()
                })
                .collect();

            intrinsics = ZhangSolver::from_homographies(&homographies(&undistorted[..])?)?;
            if opts.zero_skew {
                intrinsics.skew = 0.0;
            }
            debug!("iteration {iter}: {intrinsics:?} {distortion:?}");
        }

        Ok(IterativeIntrinsicsResult {
            intrinsics,
            distortion,
        })
    }
}
