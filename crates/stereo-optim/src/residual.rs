//! Shared reprojection residuals and numeric differentiation.

use crate::RobustKernel;
use nalgebra::{DMatrix, DVector};
use stereo_core::{CameraModel, CorrespondenceView, Iso3, Real};

/// Residual assigned to both coordinates of a point that lands behind the camera.
const BEHIND_CAMERA_PX: Real = 1.0e4;

/// Relative central-difference step.
const STEP: Real = 1.0e-6;

/// Write `project(p_i) - observed_i` for every point of `view` into `out`
/// (`2 * view.len()` rows).
pub(crate) fn reprojection(
    camera: &CameraModel,
    cam_se3_target: &Iso3,
    view: &CorrespondenceView,
    out: &mut [Real],
) {
    for (i, (pw, meas)) in view.iter().enumerate() {
        let (ex, ey) = match camera.project_target_point(cam_se3_target, pw) {
            Some(p) => (p.x - meas.x, p.y - meas.y),
            None => (BEHIND_CAMERA_PX, BEHIND_CAMERA_PX),
        };
        out[2 * i] = ex;
        out[2 * i + 1] = ey;
    }
}

/// Euclidean per-point errors of a view.
pub(crate) fn point_errors(camera: &CameraModel, cam_se3_target: &Iso3, view: &CorrespondenceView) -> Vec<Real> {
    view.iter()
        .map(|(pw, meas)| match camera.project_target_point(cam_se3_target, pw) {
            Some(p) => (p - meas).norm(),
            None => Real::INFINITY,
        })
        .collect()
}

/// IRLS scales shared by the x and y rows of each point.
pub(crate) fn pairwise_scales(kernel: RobustKernel, r: &DVector<Real>) -> DVector<Real> {
    let mut scales = DVector::from_element(r.len(), 1.0);
    if matches!(kernel, RobustKernel::None) {
        return scales;
    }
    for i in (0..r.len()).step_by(2) {
        let s = kernel.row_scale(r[i] * r[i] + r[i + 1] * r[i + 1]);
        scales[i] = s;
        scales[i + 1] = s;
    }
    scales
}

/// Fill `j[rows.., col]` with the central difference of `eval` w.r.t. `x[col]`.
///
/// `eval` writes exactly `len` residual rows for the perturbed parameters.
pub(crate) fn central_difference<F>(
    x: &DVector<Real>,
    col: usize,
    row_offset: usize,
    len: usize,
    j: &mut DMatrix<Real>,
    eval: F,
) where
    F: Fn(&DVector<Real>, &mut [Real]),
{
    let h = STEP * x[col].abs().max(1.0);
    let mut xp = x.clone();
    xp[col] += h;
    let mut xm = x.clone();
    xm[col] -= h;

    let mut rp = vec![0.0; len];
    let mut rm = vec![0.0; len];
    eval(&xp, &mut rp);
    eval(&xm, &mut rm);
    for (i, (p, m)) in rp.iter().zip(&rm).enumerate() {
        j[(row_offset + i, col)] = (p - m) / (2.0 * h);
    }
}
