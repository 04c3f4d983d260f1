//! Homography estimation (plane-induced projective transform).
//!
//! The homography `H` maps **board points** on the Z=0 target plane to
//! **image points** in pixels: `x' ~ H x`. Hartley normalization is applied
//! internally and the result is de-normalized.

use crate::math::normalize_points_2d;
use nalgebra::DMatrix;
use stereo_core::{from_homogeneous, to_homogeneous, Mat3, Pt2, Real};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HomographyError {
    #[error("need at least 4 point correspondences, got {0}")]
    NotEnoughPoints(usize),
    #[error("board/image point counts differ: {0} vs {1}")]
    CountMismatch(usize, usize),
    #[error("degenerate point configuration for normalization")]
    Degenerate,
    #[error("svd failed during homography estimation")]
    SvdFailed,
}

#[derive(Debug, Clone, Copy)]
pub struct HomographySolver;

impl HomographySolver {
    /// Estimate `H` with `x' ~ H x` using the normalized DLT.
    ///
    /// The result is scaled so that `H[2,2] == 1` when possible.
    pub fn dlt(board: &[Pt2], image: &[Pt2]) -> Result<Mat3, HomographyError> {
        let n = board.len();
        if image.len() != n {
            return Err(HomographyError::CountMismatch(n, image.len()));
        }
        if n < 4 {
            return Err(HomographyError::NotEnoughPoints(n));
        }

        let (board_n, t_b) = normalize_points_2d(board).ok_or(HomographyError::Degenerate)?;
        let (image_n, t_i) = normalize_points_2d(image).ok_or(HomographyError::Degenerate)?;

        // Pad to at least 9 rows so the SVD exposes the full right null space.
        let rows = (2 * n).max(9);
        let mut a = DMatrix::<Real>::zeros(rows, 9);
        for (i, (pb, pi)) in board_n.iter().zip(image_n.iter()).enumerate() {
            let (x, y, u, v) = (pb.x, pb.y, pi.x, pi.y);
            let r0 = 2 * i;
            let r1 = r0 + 1;

            a[(r0, 0)] = -x;
            a[(r0, 1)] = -y;
            a[(r0, 2)] = -1.0;
            a[(r0, 6)] = u * x;
            a[(r0, 7)] = u * y;
            a[(r0, 8)] = u;

            a[(r1, 3)] = -x;
            a[(r1, 4)] = -y;
            a[(r1, 5)] = -1.0;
            a[(r1, 6)] = v * x;
            a[(r1, 7)] = v * y;
            a[(r1, 8)] = v;
        }

        let svd = a.svd(false, true);
        let v_t = svd.v_t.ok_or(HomographyError::SvdFailed)?;
        // Null vector: right singular vector of the smallest singular value.
        let (min_idx, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .fold((0, Real::INFINITY), |best, (i, &s)| if s < best.1 { (i, s) } else { best });
        let h_vec = v_t.row(min_idx);

        let mut h = Mat3::zeros();
        for r in 0..3 {
            for c in 0..3 {
                h[(r, c)] = h_vec[3 * r + c];
            }
        }

        let t_i_inv = t_i.try_inverse().ok_or(HomographyError::Degenerate)?;
        h = t_i_inv * h * t_b;

        let scale = h[(2, 2)];
        if scale.abs() > Real::EPSILON {
            h /= scale;
        }
        Ok(h)
    }

    /// Per-point transfer error `|H x - x'|` in pixels.
    pub fn transfer_errors(h: &Mat3, board: &[Pt2], image: &[Pt2]) -> Vec<Real> {
        board
            .iter()
            .zip(image)
            .map(|(b, i)| (from_homogeneous(&(h * to_homogeneous(b))) - i).norm())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlt_recovers_known_homography() {
        let h_gt = Mat3::new(1.2, 0.05, 320.0, -0.03, 1.1, 240.0, 1e-4, -2e-4, 1.0);
        let board: Vec<Pt2> = (0..5)
            .flat_map(|j| (0..6).map(move |i| Pt2::new(i as Real * 20.0, j as Real * 20.0)))
            .collect();
        let image: Vec<Pt2> = board
            .iter()
            .map(|p| from_homogeneous(&(h_gt * to_homogeneous(p))))
            .collect();

        let h = HomographySolver::dlt(&board, &image).unwrap();
        assert!((h - h_gt).norm() < 1e-6, "{h}");
        let errs = HomographySolver::transfer_errors(&h, &board, &image);
        assert!(errs.iter().all(|e| *e < 1e-6));
    }

    #[test]
    fn dlt_rejects_too_few_points() {
        let pts = vec![Pt2::new(0.0, 0.0); 3];
        assert_eq!(
            HomographySolver::dlt(&pts, &pts),
            Err(HomographyError::NotEnoughPoints(3))
        );
    }
}
