//! Stereo extrinsics and rectification geometry.

use crate::{skew_symmetric, CameraModel, ImageSize, Iso3, Mat3, Mat34, Mat4, Pt3, Real, Vec3};
use nalgebra::{Rotation3, Translation3, UnitQuaternion, Vector4};
use serde::{Deserialize, Serialize};

/// Rigid transform from the left camera frame to the right camera frame.
///
/// `X_right = rotation * X_left + translation`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoExtrinsics {
    pub rotation: Mat3,
    pub translation: Vec3,
}

impl StereoExtrinsics {
    pub fn new(rotation: Mat3, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from the `right_se3_left` isometry.
    pub fn from_isometry(right_se3_left: &Iso3) -> Self {
        Self {
            rotation: right_se3_left.rotation.to_rotation_matrix().into_inner(),
            translation: right_se3_left.translation.vector,
        }
    }

    pub fn to_isometry(&self) -> Iso3 {
        let rot = Rotation3::from_matrix(&self.rotation);
        Iso3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::from_rotation_matrix(&rot),
        )
    }

    /// Distance between the optical centres.
    pub fn baseline(&self) -> Real {
        self.translation.norm()
    }

    /// Essential matrix `E = [t]x R` (normalized left → right).
    pub fn essential(&self) -> Mat3 {
        skew_symmetric(&self.translation) * self.rotation
    }

    /// Fundamental matrix `F = K_r^-T E K_l^-1` (left pixels → right epipolar lines).
    ///
    /// Returns `None` if either intrinsics matrix is singular.
    pub fn fundamental(&self, left: &CameraModel, right: &CameraModel) -> Option<Mat3> {
        let kl_inv = left.k_matrix().try_inverse()?;
        let kr_inv = right.k_matrix().try_inverse()?;
        Some(kr_inv.transpose() * self.essential() * kl_inv)
    }
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Output of stereo rectification: per-camera rectifying rotations, the new
/// projection matrices and the disparity-to-depth matrix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RectificationGeometry {
    pub image_size: ImageSize,
    /// Crop parameter the geometry was computed with.
    pub alpha: Real,
    /// Rotation applied to the left camera frame.
    pub r1: Mat3,
    /// Rotation applied to the right camera frame.
    pub r2: Mat3,
    /// Left projection matrix in the rectified frame.
    pub p1: Mat34,
    /// Right projection matrix; `p2[(0, 3)] = Tx * f`.
    pub p2: Mat34,
    /// Disparity-to-depth matrix.
    pub q: Mat4,
    /// Region of the left rectified image containing only valid pixels.
    pub roi_left: Roi,
    /// Region of the right rectified image containing only valid pixels.
    pub roi_right: Roi,
}

impl RectificationGeometry {
    /// Geometry of a rig whose cameras are already row-aligned and share
    /// `camera`'s undistorted pinhole: identity rotations, right camera at
    /// `tx` along the left x axis (negative for a right camera on the right).
    pub fn aligned(camera: &CameraModel, tx: Real) -> Self {
        let k = &camera.k;
        let p1 = Mat34::new(k.fx, 0.0, k.cx, 0.0, 0.0, k.fy, k.cy, 0.0, 0.0, 0.0, 1.0, 0.0);
        let mut p2 = p1;
        p2[(0, 3)] = tx * k.fx;
        #[rustfmt::skip]
        let q = Mat4::new(
            1.0, 0.0, 0.0, -k.cx,
            0.0, 1.0, 0.0, -k.cy,
            0.0, 0.0, 0.0, k.fx,
            0.0, 0.0, -1.0 / tx, 0.0,
        );
        let full = Roi {
            x: 0,
            y: 0,
            width: camera.image_size.width as i32,
            height: camera.image_size.height as i32,
        };
        Self {
            image_size: camera.image_size,
            alpha: -1.0,
            r1: Mat3::identity(),
            r2: Mat3::identity(),
            p1,
            p2,
            q,
            roi_left: full,
            roi_right: full,
        }
    }

    /// Rectified focal length in pixels.
    pub fn focal(&self) -> Real {
        self.p1[(0, 0)]
    }

    /// Rectified baseline (signed `Tx` in world units).
    pub fn rectified_tx(&self) -> Real {
        self.p2[(0, 3)] / self.p2[(0, 0)]
    }

    /// Reproject a rectified left pixel with disparity `d` to a left-rectified 3D point.
    ///
    /// Returns `None` for a degenerate homogeneous scale (`d` at infinity).
    pub fn reproject(&self, x: Real, y: Real, disparity: Real) -> Option<Pt3> {
        let h = self.q * Vector4::new(x, y, disparity, 1.0);
        if h.w.abs() < 1e-12 {
            return None;
        }
        Some(Pt3::new(h.x / h.w, h.y / h.w, h.z / h.w))
    }
}
