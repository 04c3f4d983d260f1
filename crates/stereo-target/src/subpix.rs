//! Sub-pixel corner refinement.
//!
//! At a saddle point `q`, every gradient `g(p)` in the neighbourhood is
//! orthogonal to `p - q`. Minimising `sum w(p) (g(p)^T (p - q))^2` gives the
//! 2x2 system `(sum w g g^T) q = sum w g g^T p`, solved iteratively with the
//! window re-centred on the latest estimate.

use crate::gray::{sample, GrayF32};
use serde::{Deserialize, Serialize};
use stereo_core::Pt2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPixParams {
    /// Window half-size; the window is `(2 * half_window + 1)²` pixels.
    pub half_window: u32,
    pub max_iters: usize,
    /// Stop when the update is shorter than this (pixels).
    pub epsilon: f64,
}

impl Default for SubPixParams {
    fn default() -> Self {
        Self {
            half_window: 5,
            max_iters: 30,
            epsilon: 0.001,
        }
    }
}

/// Refine a single corner. Falls back to the input position if the estimate
/// leaves the search window or the system is singular at the first step.
pub fn refine_corner(img: &GrayF32, initial: Pt2, params: &SubPixParams) -> Pt2 {
    let hw = params.half_window as i32;
    let inv_sigma2 = 1.0 / (hw as f64 * hw as f64).max(1.0);
    let mut q = initial;
    for _ in 0..params.max_iters {
        let (mut a, mut b, mut c, mut bb1, mut bb2) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for j in -hw..=hw {
            for i in -hw..=hw {
                let px = q.x + i as f64;
                let py = q.y + j as f64;
                let (fx, fy) = (px as f32, py as f32);
                let gx = 0.5 * (sample(img, fx + 1.0, fy) - sample(img, fx - 1.0, fy)) as f64;
                let gy = 0.5 * (sample(img, fx, fy + 1.0) - sample(img, fx, fy - 1.0)) as f64;
                let w = (-((i * i + j * j) as f64) * inv_sigma2).exp();
                let (gxx, gxy, gyy) = (gx * gx * w, gx * gy * w, gy * gy * w);
                a += gxx;
                b += gxy;
                c += gyy;
                bb1 += gxx * px + gxy * py;
                bb2 += gxy * px + gyy * py;
            }
        }
        let det = a * c - b * b;
        if det.abs() <= f64::EPSILON * (a * c).abs().max(1e-30) {
            break;
        }
        let next = Pt2::new((c * bb1 - b * bb2) / det, (a * bb2 - b * bb1) / det);
        let shift = (next - q).norm();
        q = next;
        if shift < params.epsilon {
            break;
        }
    }
    if (q - initial).norm() > hw as f64 || !q.x.is_finite() || !q.y.is_finite() {
        return initial;
    }
    q
}

/// Refine all corners in place.
pub fn refine_corners(img: &GrayF32, corners: &mut [Pt2], params: &SubPixParams) {
    for p in corners.iter_mut() {
        *p = refine_corner(img, *p, params);
    }
}
