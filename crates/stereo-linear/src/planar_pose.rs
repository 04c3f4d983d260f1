//! Planar pose estimation from a homography.
//!
//! Decomposes a plane-induced homography into the board pose `cam_se3_board`
//! given intrinsics `K`, with the board on `Z = 0` in its own coordinates.

use anyhow::{bail, Result};
use nalgebra::{Translation3, UnitQuaternion};
use stereo_core::{project_to_so3, Iso3, Mat3};

#[derive(Debug, Clone, Copy)]
pub struct PlanarPoseSolver;

impl PlanarPoseSolver {
    /// Decompose `H ~ K [r1 r2 t]` into a pose.
    ///
    /// The rotation is projected onto SO(3); the translation is scaled so that
    /// the first two rotation columns have unit norm on average, and the board
    /// is kept in front of the camera (`t.z > 0`).
    pub fn from_homography(kmtx: &Mat3, hmtx: &Mat3) -> Result<Iso3> {
        let Some(k_inv) = kmtx.try_inverse() else {
            bail!("intrinsics matrix is not invertible");
        };

        let k_inv_h1 = k_inv * hmtx.column(0);
        let k_inv_h2 = k_inv * hmtx.column(1);
        let k_inv_h3 = k_inv * hmtx.column(2);

        let denom = 0.5 * (k_inv_h1.norm() + k_inv_h2.norm());
        if denom <= 1e-12 {
            bail!("degenerate homography for planar pose extraction");
        }
        let mut lambda = 1.0 / denom;
        if k_inv_h3.z < 0.0 {
            lambda = -lambda;
        }

        let r1 = lambda * k_inv_h1;
        let r2 = lambda * k_inv_h2;
        let t = lambda * k_inv_h3;
        let r3 = r1.cross(&r2);
        if r3.norm() <= 1e-12 {
            bail!("degenerate homography for planar pose extraction");
        }

        let r = project_to_so3(&Mat3::from_columns(&[r1, r2, r3]));
        Ok(Iso3::from_parts(
            Translation3::from(t),
            UnitQuaternion::from_rotation_matrix(&r),
        ))
    }
}
