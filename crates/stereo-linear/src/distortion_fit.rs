//! Closed-form distortion estimate from homography residuals.
//!
//! With intrinsics `K` and per-view homographies computed from *distorted*
//! pixels, the residual between observed and homography-predicted normalized
//! coordinates is linear in `(k1, k2, k3, p1, p2)`:
//!
//! ```text
//! dx = x (k1 r² + k2 r⁴ + k3 r⁶) + 2 p1 x y + p2 (r² + 2 x²)
//! dy = y (k1 r² + k2 r⁴ + k3 r⁶) + p1 (r² + 2 y²) + 2 p2 x y
//! ```
//!
//! The stacked system is solved in the least-squares sense via SVD. This is
//! an initializer; accuracy degrades for strong (wide-angle) distortion.

use nalgebra::{DMatrix, DVector};
use stereo_core::{from_homogeneous, to_homogeneous, BrownConrady5, Mat3, Pt2, Real, Vec2};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum DistortionFitError {
    #[error("need at least {0} points for distortion estimation, got {1}")]
    NotEnoughPoints(usize, usize),
    #[error("svd failed during distortion estimation")]
    SvdFailed,
    #[error("intrinsics matrix is not invertible")]
    IntrinsicsNotInvertible,
    #[error("degenerate configuration: all points near image center")]
    DegenerateConfiguration,
}

#[derive(Debug, Clone, Copy)]
pub struct DistortionFitOptions {
    /// Keep `p1 = p2 = 0`.
    pub fix_tangential: bool,
    /// Keep `k3 = 0`; the r⁶ term tends to overfit a linear estimate.
    pub fix_k3: bool,
    /// Undistortion iterations of the returned model.
    pub iters: u32,
}

impl Default for DistortionFitOptions {
    fn default() -> Self {
        Self {
            fix_tangential: false,
            fix_k3: true,
            iters: 8,
        }
    }
}

/// One view: homography plus board/pixel correspondences.
#[derive(Debug, Clone)]
pub struct DistortionView {
    /// Board → pixel homography fitted to the distorted pixels.
    pub homography: Mat3,
    pub board_points: Vec<Pt2>,
    pub pixel_points: Vec<Pt2>,
}

#[derive(Debug, Clone, Copy)]
pub struct DistortionSolver;

impl DistortionSolver {
    pub fn from_homographies(
        intrinsics: &Mat3,
        views: &[DistortionView],
        opts: DistortionFitOptions,
    ) -> Result<BrownConrady5<Real>, DistortionFitError> {
        let total_points: usize = views.iter().map(|v| v.board_points.len()).sum();
        let n_params = 2 + usize::from(!opts.fix_k3) + if opts.fix_tangential { 0 } else { 2 };
        let min_points = n_params.div_ceil(2) + 2;
        if total_points < min_points {
            return Err(DistortionFitError::NotEnoughPoints(min_points, total_points));
        }

        let k_inv = intrinsics
            .try_inverse()
            .ok_or(DistortionFitError::IntrinsicsNotInvertible)?;
        let normalize = |px: &Pt2| -> Vec2 { from_homogeneous(&(k_inv * to_homogeneous(px))).coords };

        let mut a = DMatrix::<Real>::zeros(2 * total_points, n_params);
        let mut b = DVector::<Real>::zeros(2 * total_points);
        let mut max_r2: Real = 0.0;

        let mut row = 0;
        for view in views {
            for (board_pt, pixel_obs) in view.board_points.iter().zip(&view.pixel_points) {
                let ideal = from_homogeneous(&(view.homography * to_homogeneous(board_pt)));
                let n_ideal = normalize(&ideal);
                let residual = normalize(pixel_obs) - n_ideal;

                let (x, y) = (n_ideal.x, n_ideal.y);
                let r2 = x * x + y * y;
                let r4 = r2 * r2;
                max_r2 = max_r2.max(r2);

                let mut col = 0;
                a[(row, col)] = x * r2;
                a[(row + 1, col)] = y * r2;
                col += 1;
                a[(row, col)] = x * r4;
                a[(row + 1, col)] = y * r4;
                col += 1;
                if !opts.fix_k3 {
                    a[(row, col)] = x * r4 * r2;
                    a[(row + 1, col)] = y * r4 * r2;
                    col += 1;
                }
                if !opts.fix_tangential {
                    a[(row, col)] = 2.0 * x * y;
                    a[(row + 1, col)] = r2 + 2.0 * y * y;
                    a[(row, col + 1)] = r2 + 2.0 * x * x;
                    a[(row + 1, col + 1)] = 2.0 * x * y;
                }

                b[row] = residual.x;
                b[row + 1] = residual.y;
                row += 2;
            }
        }

        if max_r2 < 1e-6 {
            return Err(DistortionFitError::DegenerateConfiguration);
        }

        let x = a
            .svd(true, true)
            .solve(&b, 1e-12)
            .map_err(|_| DistortionFitError::SvdFailed)?;

        let mut it = x.iter().copied();
        let mut next = || it.next().unwrap_or(0.0);
        let k1 = next();
        let k2 = next();
        let k3 = if opts.fix_k3 { 0.0 } else { next() };
        let (p1, p2) = if opts.fix_tangential {
            (0.0, 0.0)
        } else {
            (next(), next())
        };

        Ok(BrownConrady5 {
            k1,
            k2,
            k3,
            p1,
            p2,
            iters: opts.iters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Isometry3, Rotation3, Translation3, Vector3};
    use stereo_core::{CameraModel, FxFyCxCySkew, ImageSize, Pt3};

    #[test]
    fn recovers_distortion_from_ideal_homographies() {
        let k = FxFyCxCySkew {
            fx: 800.0,
            fy: 800.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        };
        let dist = BrownConrady5 {
            k1: -0.2,
            k2: 0.05,
            k3: 0.0,
            p1: 0.001,
            p2: -0.002,
            iters: 8,
        };
        let cam = CameraModel::new(ImageSize::new(1280, 720), k, dist);
        let kmtx = k.k_matrix();

        let board: Vec<Pt2> = (0..7)
            .flat_map(|j| (0..7).map(move |i| Pt2::new(i as Real * 30.0, j as Real * 30.0)))
            .collect();
        let poses = [
            (Rotation3::from_euler_angles(0.1, 0.0, 0.05), Vector3::new(100.0, -50.0, 1000.0)),
            (Rotation3::from_euler_angles(-0.05, 0.15, -0.1), Vector3::new(-50.0, 100.0, 1200.0)),
            (Rotation3::from_euler_angles(0.2, -0.1, 0.0), Vector3::new(0.0, 0.0, 900.0)),
        ];

        let views: Vec<DistortionView> = poses
            .iter()
            .map(|(rot, t)| {
                let iso = Isometry3::from_parts(Translation3::from(*t), (*rot).into());
                let pixels: Vec<Pt2> = board
                    .iter()
                    .map(|b| cam.project_target_point(&iso, &Pt3::new(b.x, b.y, 0.0)).unwrap())
                    .collect();
                // Ideal plane homography K [r1 r2 t].
                let r = rot.matrix();
                let mut homography = Mat3::zeros();
                homography.set_column(0, &(kmtx * r.column(0)));
                homography.set_column(1, &(kmtx * r.column(1)));
                homography.set_column(2, &(kmtx * t));
                DistortionView {
                    homography,
                    board_points: board.clone(),
                    pixel_points: pixels,
                }
            })
            .collect();

        let est =
            DistortionSolver::from_homographies(&kmtx, &views, DistortionFitOptions::default())
                .unwrap();
        assert!((est.k1 - dist.k1).abs() < 1e-4, "k1 = {}", est.k1);
        assert!((est.k2 - dist.k2).abs() < 1e-3, "k2 = {}", est.k2);
        assert!((est.p1 - dist.p1).abs() < 1e-5, "p1 = {}", est.p1);
        assert!((est.p2 - dist.p2).abs() < 1e-5, "p2 = {}", est.p2);
        assert_eq!(est.k3, 0.0);
    }

    #[test]
    fn rejects_points_at_principal_point() {
        let kmtx = Mat3::new(800.0, 0.0, 640.0, 0.0, 800.0, 360.0, 0.0, 0.0, 1.0);
        let view = DistortionView {
            homography: Mat3::new(1e-6, 0.0, 640.0, 0.0, 1e-6, 360.0, 0.0, 0.0, 1.0),
            board_points: vec![Pt2::new(1.0, 1.0); 8],
            pixel_points: vec![Pt2::new(640.0, 360.0); 8],
        };
        assert_eq!(
            DistortionSolver::from_homographies(&kmtx, &[view], DistortionFitOptions::default()),
            Err(DistortionFitError::DegenerateConfiguration)
        );
    }
}
