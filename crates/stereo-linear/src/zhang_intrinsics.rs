//! Zhang's closed-form intrinsics from plane homographies (no distortion).

use nalgebra::{DMatrix, SVector};
use stereo_core::{FxFyCxCySkew, Mat3, Real};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ZhangError {
    #[error("need at least 3 homographies for intrinsics estimation, got {0}")]
    NotEnoughViews(usize),
    #[error("degenerate configuration in intrinsics estimation")]
    Degenerate,
    #[error("svd failed during intrinsics estimation")]
    SvdFailed,
}

/// The 6-vector `v_ij(H)` of Zhang's constraint equations (0-based columns).
fn v_ij(hmtx: &Mat3, i: usize, j: usize) -> SVector<Real, 6> {
    let hi = hmtx.column(i);
    let hj = hmtx.column(j);

    SVector::<Real, 6>::from_row_slice(&[
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ])
}

#[derive(Debug, Clone, Copy)]
pub struct ZhangSolver;

impl ZhangSolver {
    /// Estimate K from ≥3 plane homographies.
    pub fn from_homographies(hmtxs: &[Mat3]) -> Result<FxFyCxCySkew<Real>, ZhangError> {
        let m = hmtxs.len();
        if m < 3 {
            return Err(ZhangError::NotEnoughViews(m));
        }

        let mut vmtx = DMatrix::<Real>::zeros(2 * m, 6);
        for (k, hmtx) in hmtxs.iter().enumerate() {
            // Normalize each homography so views are weighted comparably.
            let h = hmtx / hmtx.norm();
            let v11 = v_ij(&h, 0, 0);
            let v22 = v_ij(&h, 1, 1);
            let v12 = v_ij(&h, 0, 1);
            vmtx.row_mut(2 * k).copy_from(&v12.transpose());
            vmtx.row_mut(2 * k + 1).copy_from(&(v11 - v22).transpose());
        }

        let svd = vmtx.svd(false, true);
        let v_t = svd.v_t.ok_or(ZhangError::SvdFailed)?;
        let (min_idx, _) = svd
            .singular_values
            .iter()
            .enumerate()
            .fold((0, Real::INFINITY), |best, (i, &s)| if s < best.1 { (i, s) } else { best });
        let b = v_t.row(min_idx);

        let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

        // v0 = (B12 B13 - B11 B23) / (B11 B22 - B12^2)
        // λ = B33 - (B13^2 + v0 (B12 B13 - B11 B23)) / B11
        // α = sqrt(λ / B11), β = sqrt(λ B11 / (B11 B22 - B12^2))
        // γ = -B12 α^2 β / λ, u0 = γ v0 / β - B13 α^2 / λ
        let denom = b11 * b22 - b12 * b12;
        let denom_norm = b11 * b11 + b22 * b22;
        if denom_norm <= 0.0 || denom.abs() / denom_norm <= 1e-9 {
            return Err(ZhangError::Degenerate);
        }

        let v0 = (b12 * b13 - b11 * b23) / denom;
        let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
        let alpha_sq = lambda / b11;
        let beta_sq = lambda * b11 / denom;
        if alpha_sq <= 0.0 || beta_sq <= 0.0 {
            return Err(ZhangError::Degenerate);
        }

        let alpha = alpha_sq.sqrt();
        let beta = beta_sq.sqrt();
        let gamma = -b12 * alpha * alpha * beta / lambda;
        let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

        Ok(FxFyCxCySkew {
            fx: alpha,
            fy: beta,
            cx: u0,
            cy: v0,
            skew: gamma,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    fn synthetic_homography(kmtx: &Mat3, rot: Rotation3<Real>, t: Vector3<Real>) -> Mat3 {
        // For the Z=0 plane, H = K [r1 r2 t].
        let r = rot.matrix();
        let mut h = Mat3::zeros();
        h.set_column(0, &(kmtx * r.column(0)));
        h.set_column(1, &(kmtx * r.column(1)));
        h.set_column(2, &(kmtx * t));
        h
    }

    #[test]
    fn recovers_intrinsics_from_exact_homographies() {
        let k_gt = FxFyCxCySkew {
            fx: 900.0,
            fy: 880.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        };
        let kmtx = k_gt.k_matrix();
        let hs = vec![
            synthetic_homography(
                &kmtx,
                Rotation3::from_euler_angles(0.1, 0.0, 0.05),
                Vector3::new(0.1, -0.05, 1.0),
            ),
            synthetic_homography(
                &kmtx,
                Rotation3::from_euler_angles(-0.05, 0.15, -0.1),
                Vector3::new(-0.05, 0.1, 1.2),
            ),
            synthetic_homography(
                &kmtx,
                Rotation3::from_euler_angles(0.2, -0.1, 0.0),
                Vector3::new(0.0, 0.0, 0.9),
            ),
        ];

        let k = ZhangSolver::from_homographies(&hs).unwrap();
        assert!((k.fx - k_gt.fx).abs() < 1e-2, "fx {}", k.fx);
        assert!((k.fy - k_gt.fy).abs() < 1e-2, "fy {}", k.fy);
        assert!((k.cx - k_gt.cx).abs() < 1e-2, "cx {}", k.cx);
        assert!((k.cy - k_gt.cy).abs() < 1e-2, "cy {}", k.cy);
        assert!(k.skew.abs() < 1e-6);
    }

    #[test]
    fn rejects_two_views() {
        let hs = vec![Mat3::identity(); 2];
        assert_eq!(
            ZhangSolver::from_homographies(&hs),
            Err(ZhangError::NotEnoughViews(2))
        );
    }
}
