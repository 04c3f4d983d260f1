//! Bouguet stereo rectification.
//!
//! Given both camera models and the left → right transform, computes the
//! rotations `R1`, `R2` that make the image rows of both cameras parallel to
//! the baseline, shared-focal projection matrices `P1`, `P2`, the
//! disparity-to-depth matrix `Q` and the valid-pixel regions.
//!
//! The relative rotation is split in half between the cameras, then a common
//! rotation aligns the (half-rotated) baseline with the image x axis (or the
//! y axis for vertical rigs). The crop parameter `alpha` scales the common
//! focal length between "only valid pixels" (`0`) and "every source pixel"
//! (`1`).

use log::{debug, warn};
use stereo_core::{
    axis_angle_from_rotation, rotation_from_axis_angle, CameraModel, ImageSize, Mat3, Mat34, Mat4,
    Pt2, Real, RectificationGeometry, Roi, StereoExtrinsics, Vec3,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RectifyError {
    #[error("baseline has zero length")]
    ZeroBaseline,
    #[error("alpha must be <= 1 (negative disables scaling), got {0}")]
    InvalidAlpha(Real),
    #[error("image sizes differ: left {left:?}, right {right:?}")]
    ImageSizeMismatch { left: ImageSize, right: ImageSize },
}

#[derive(Debug, Clone, Copy)]
pub struct RectifyOptions {
    /// 0 = crop to valid pixels, 1 = keep every source pixel, negative = no scaling.
    pub alpha: Real,
    /// Share the principal point between both views so that points at
    /// infinity have zero disparity.
    pub zero_disparity: bool,
}

impl Default for RectifyOptions {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            zero_disparity: true,
        }
    }
}

/// Project raw pixels through undistortion, a rectifying rotation and a new
/// pinhole `(f, cx, cy)`.
fn rectify_pixels(cam: &CameraModel, r: &Mat3, f: Real, cx: Real, cy: Real, pts: &[Pt2]) -> Vec<Pt2> {
    pts.iter()
        .map(|px| {
            let ray = r * cam.backproject_pixel(px);
            Pt2::new(f * ray.x / ray.z + cx, f * ray.y / ray.z + cy)
        })
        .collect()
}

struct Rect {
    x: Real,
    y: Real,
    width: Real,
    height: Real,
}

/// Inner (fully valid) and outer (bounding) rectangles of the rectified image
/// of a 9×9 grid spanning the source image.
fn valid_rectangles(cam: &CameraModel, r: &Mat3, p: &Mat34, size: ImageSize) -> (Rect, Rect) {
    const N: usize = 9;
    let (w, h) = ((size.width - 1) as Real, (size.height - 1) as Real);
    let grid: Vec<Pt2> = (0..N)
        .flat_map(|y| (0..N).map(move |x| Pt2::new(x as Real * w / (N - 1) as Real, y as Real * h / (N - 1) as Real)))
        .collect();
    let pts = rectify_pixels(cam, r, p[(0, 0)], p[(0, 2)], p[(1, 2)], &grid);

    let (mut ix0, mut ix1, mut iy0, mut iy1) = (Real::MIN, Real::MAX, Real::MIN, Real::MAX);
    let (mut ox0, mut ox1, mut oy0, mut oy1) = (Real::MAX, Real::MIN, Real::MAX, Real::MIN);
    for y in 0..N {
        for x in 0..N {
            let p = pts[y * N + x];
            ox0 = ox0.min(p.x);
            ox1 = ox1.max(p.x);
            oy0 = oy0.min(p.y);
            oy1 = oy1.max(p.y);
            if x == 0 {
                ix0 = ix0.max(p.x);
            }
            if x == N - 1 {
                ix1 = ix1.min(p.x);
            }
            if y == 0 {
                iy0 = iy0.max(p.y);
            }
            if y == N - 1 {
                iy1 = iy1.min(p.y);
            }
        }
    }
    (
        Rect {
            x: ix0,
            y: iy0,
            width: ix1 - ix0,
            height: iy1 - iy0,
        },
        Rect {
            x: ox0,
            y: oy0,
            width: ox1 - ox0,
            height: oy1 - oy0,
        },
    )
}

fn projection(f: Real, cx: Real, cy: Real) -> Mat34 {
    Mat34::new(f, 0.0, cx, 0.0, 0.0, f, cy, 0.0, 0.0, 0.0, 1.0, 0.0)
}

/// Compute rectification geometry for a horizontal or vertical stereo rig.
pub fn stereo_rectify(
    left: &CameraModel,
    right: &CameraModel,
    extrinsics: &StereoExtrinsics,
    opts: &RectifyOptions,
) -> Result<RectificationGeometry, RectifyError> {
    if left.image_size != right.image_size {
        return Err(RectifyError::ImageSizeMismatch {
            left: left.image_size,
            right: right.image_size,
        });
    }
    if opts.alpha > 1.0 || opts.alpha.is_nan() {
        return Err(RectifyError::InvalidAlpha(opts.alpha));
    }
    let size = left.image_size;
    let (nx, ny) = (size.width as Real, size.height as Real);

    // Half of the relative rotation for each camera.
    let om = axis_angle_from_rotation(&extrinsics.rotation);
    let r_r = rotation_from_axis_angle(&(om * -0.5));
    let t = r_r * extrinsics.translation;

    let idx = if t.x.abs() > t.y.abs() { 0 } else { 1 };
    let c = t[idx];
    let nt = t.norm();
    if nt <= Real::EPSILON {
        return Err(RectifyError::ZeroBaseline);
    }
    let mut uu = Vec3::zeros();
    uu[idx] = if c > 0.0 { 1.0 } else { -1.0 };

    // Rotation taking the baseline onto the row axis.
    let mut ww = t.cross(&uu);
    let nw = ww.norm();
    if nw > 0.0 {
        ww *= (c.abs() / nt).clamp(-1.0, 1.0).acos() / nw;
    }
    let w_r = rotation_from_axis_angle(&ww);
    let r1 = w_r * r_r.transpose();
    let r2 = w_r * r_r;
    let t_new = r2 * extrinsics.translation;

    // Common focal length along the axis orthogonal to the baseline, shrunk
    // for barrel distortion so the border stays inside the frame.
    let mut fc_new = Real::MAX;
    for cam in [left, right] {
        let k = cam.k_matrix();
        let mut fc = k[(idx ^ 1, idx ^ 1)];
        let dk1 = cam.dist.k1;
        if dk1 < 0.0 {
            fc *= 1.0 + dk1 * (nx * nx + ny * ny) / (4.0 * fc * fc);
        }
        fc_new = fc_new.min(fc);
    }

    // Principal points that keep the image-corner centroid centred.
    let corners = [
        Pt2::new(0.0, 0.0),
        Pt2::new(nx - 1.0, 0.0),
        Pt2::new(0.0, ny - 1.0),
        Pt2::new(nx - 1.0, ny - 1.0),
    ];
    let mut cc_new = [Pt2::origin(); 2];
    for (k, (cam, r)) in [(left, &r1), (right, &r2)].into_iter().enumerate() {
        let pts = rectify_pixels(cam, r, fc_new, 0.0, 0.0, &corners);
        let avg = pts.iter().fold(Vec3::zeros(), |acc, p| acc + Vec3::new(p.x, p.y, 0.0)) / 4.0;
        cc_new[k] = Pt2::new((nx - 1.0) / 2.0 - avg.x, (ny - 1.0) / 2.0 - avg.y);
    }
    if opts.zero_disparity {
        let mid = Pt2::from((cc_new[0].coords + cc_new[1].coords) * 0.5);
        cc_new = [mid, mid];
    } else if idx == 0 {
        let cy = 0.5 * (cc_new[0].y + cc_new[1].y);
        cc_new[0].y = cy;
        cc_new[1].y = cy;
    } else {
        let cx = 0.5 * (cc_new[0].x + cc_new[1].x);
        cc_new[0].x = cx;
        cc_new[1].x = cx;
    }

    let p1 = projection(fc_new, cc_new[0].x, cc_new[0].y);
    let mut p2 = projection(fc_new, cc_new[1].x, cc_new[1].y);
    p2[(idx, 3)] = t_new[idx] * fc_new;

    let (cx1, cy1, cx2, cy2) = (cc_new[0].x, cc_new[0].y, cc_new[1].x, cc_new[1].y);
    let (inner1, outer1) = valid_rectangles(left, &r1, &p1, size);
    let (inner2, outer2) = valid_rectangles(right, &r2, &p2, size);

    let mut s = 1.0;
    if opts.alpha >= 0.0 {
        let (w1, h1) = (nx - 1.0, ny - 1.0);
        let scale_to = |cx: Real, cy: Real, r: &Rect| {
            [
                cx / (cx - r.x),
                cy / (cy - r.y),
                (w1 - cx) / (r.x + r.width - cx),
                (h1 - cy) / (r.y + r.height - cy),
            ]
        };
        let s0 = scale_to(cx1, cy1, &inner1)
            .into_iter()
            .chain(scale_to(cx2, cy2, &inner2))
            .fold(Real::MIN, Real::max);
        let s1 = scale_to(cx1, cy1, &outer1)
            .into_iter()
            .chain(scale_to(cx2, cy2, &outer2))
            .fold(Real::MAX, Real::min);
        let blended = s0 * (1.0 - opts.alpha) + s1 * opts.alpha;
        if blended.is_finite() && blended > 0.0 {
            s = blended;
        } else {
            warn!("rectification scale degenerate (s0={s0}, s1={s1}); keeping unit scale");
        }
    }
    debug!("rectify: axis={idx} fc={fc_new:.3} scale={s:.4}");

    let fc = fc_new * s;
    let p1 = projection(fc, cx1, cy1);
    let mut p2 = projection(fc, cx2, cy2);
    p2[(idx, 3)] = t_new[idx] * fc;

    let roi = |inner: &Rect, cx: Real, cy: Real| {
        let x0 = ((inner.x - cx) * s + cx).ceil() as i32;
        let y0 = ((inner.y - cy) * s + cy).ceil() as i32;
        let w = (inner.width * s).floor() as i32;
        let h = (inner.height * s).floor() as i32;
        clip_roi(x0, y0, w, h, size)
    };

    let mut q = Mat4::identity();
    q[(0, 3)] = -cx1;
    q[(1, 3)] = -cy1;
    q[(2, 2)] = 0.0;
    q[(2, 3)] = fc;
    q[(3, 2)] = -1.0 / t_new[idx];
    let dc = if idx == 0 { cx1 - cx2 } else { cy1 - cy2 };
    q[(3, 3)] = dc / t_new[idx];

    Ok(RectificationGeometry {
        image_size: size,
        alpha: opts.alpha,
        r1,
        r2,
        p1,
        p2,
        q,
        roi_left: roi(&inner1, cx1, cy1),
        roi_right: roi(&inner2, cx2, cy2),
    })
}

fn clip_roi(x: i32, y: i32, w: i32, h: i32, size: ImageSize) -> Roi {
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + w).min(size.width as i32);
    let y1 = (y + h).min(size.height as i32);
    if x1 <= x0 || y1 <= y0 {
        return Roi::default();
    }
    Roi {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Rotation3;
    use stereo_core::{BrownConrady5, FxFyCxCySkew, Pt3};

    fn camera(dist: BrownConrady5<Real>) -> CameraModel {
        CameraModel::new(
            ImageSize::new(640, 480),
            FxFyCxCySkew {
                fx: 500.0,
                fy: 500.0,
                cx: 319.5,
                cy: 239.5,
                skew: 0.0,
            },
            dist,
        )
    }

    #[test]
    fn identity_rig_differs_only_in_baseline_term() {
        let cam = camera(BrownConrady5::default());
        let baseline = 60.0;
        let extr = StereoExtrinsics::new(Mat3::identity(), Vec3::new(-baseline, 0.0, 0.0));

        for alpha in [0.0, 0.5, 1.0] {
            let geom = stereo_rectify(&cam, &cam, &extr, &RectifyOptions { alpha, zero_disparity: true }).unwrap();

            assert_relative_eq!(geom.r1, Mat3::identity(), epsilon = 1e-12);
            assert_relative_eq!(geom.r2, Mat3::identity(), epsilon = 1e-12);

            let mut diff = geom.p2 - geom.p1;
            assert_relative_eq!(diff[(0, 3)], -baseline * geom.focal(), epsilon = 1e-9);
            diff[(0, 3)] = 0.0;
            assert!(diff.norm() < 1e-9, "P1/P2 differ beyond the baseline term: {diff}");

            assert_relative_eq!(geom.focal(), 500.0, epsilon = 1e-6);
            assert_relative_eq!(geom.p1[(0, 2)], 319.5, epsilon = 1e-6);
            assert_relative_eq!(geom.p1[(1, 2)], 239.5, epsilon = 1e-6);
        }
    }

    #[test]
    fn q_reprojects_disparity_to_depth() {
        let cam = camera(BrownConrady5::default());
        let extr = StereoExtrinsics::new(Mat3::identity(), Vec3::new(-60.0, 0.0, 0.0));
        let geom = stereo_rectify(&cam, &cam, &extr, &RectifyOptions::default()).unwrap();

        let p = Pt3::new(40.0, -25.0, 1200.0);
        let xl = geom.p1 * p.to_homogeneous();
        let xr = geom.p2 * p.to_homogeneous();
        let (ul, vl) = (xl.x / xl.z, xl.y / xl.z);
        let ur = xr.x / xr.z;

        let rec = geom.reproject(ul, vl, ul - ur).unwrap();
        assert!((rec - p).norm() < 1e-6, "{rec:?}");
    }

    #[test]
    fn rectified_rows_align_for_rotated_rig() {
        let dist = BrownConrady5 {
            k1: -0.05,
            k2: 0.01,
            k3: 0.0,
            p1: 0.0,
            p2: 0.0,
            iters: 16,
        };
        let cam = camera(dist);
        let extr = StereoExtrinsics::new(
            Rotation3::from_euler_angles(0.01, -0.03, 0.02).into_inner(),
            Vec3::new(-60.0, 2.0, 1.0),
        );
        let geom = stereo_rectify(&cam, &cam, &extr, &RectifyOptions::default()).unwrap();

        for p in [Pt3::new(0.0, 0.0, 800.0), Pt3::new(-100.0, 60.0, 1000.0), Pt3::new(80.0, -40.0, 600.0)] {
            let pr = Pt3::from(extr.rotation * p.coords + extr.translation);
            let xl = cam.project_point(&p).unwrap();
            let xr = cam.project_point(&pr).unwrap();
            let yl = rectify_pixels(&cam, &geom.r1, geom.focal(), geom.p1[(0, 2)], geom.p1[(1, 2)], &[xl])[0].y;
            let yr = rectify_pixels(&cam, &geom.r2, geom.focal(), geom.p2[(0, 2)], geom.p2[(1, 2)], &[xr])[0].y;
            assert!((yl - yr).abs() < 1e-6, "row mismatch {yl} vs {yr}");
        }
        assert!(!geom.roi_left.is_empty());
        assert!(!geom.roi_right.is_empty());
    }

    #[test]
    fn rejects_zero_baseline() {
        let cam = camera(BrownConrady5::default());
        let extr = StereoExtrinsics::new(Mat3::identity(), Vec3::zeros());
        assert_eq!(
            stereo_rectify(&cam, &cam, &extr, &RectifyOptions::default()),
            Err(RectifyError::ZeroBaseline)
        );
    }
}
