//! Parameter block packing.
//!
//! - camera block (9): `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`, zero skew;
//! - pose block (6): `[wx, wy, wz, tx, ty, tz]`, axis-angle rotation + translation.

use nalgebra::{DVector, Translation3, UnitQuaternion, Vector3};
use stereo_core::{BrownConrady5, CameraModel, FxFyCxCySkew, ImageSize, Iso3, Real};

pub const CAMERA_DIM: usize = 9;
pub const POSE_DIM: usize = 6;

/// Write the camera block into `out[..CAMERA_DIM]`.
pub fn pack_camera(camera: &CameraModel, out: &mut [Real]) {
    let d = &camera.dist;
    out[..CAMERA_DIM].copy_from_slice(&[
        camera.k.fx,
        camera.k.fy,
        camera.k.cx,
        camera.k.cy,
        d.k1,
        d.k2,
        d.p1,
        d.p2,
        d.k3,
    ]);
}

/// Decode a camera block with `iters` undistortion iterations.
pub fn unpack_camera(v: &[Real], image_size: ImageSize, iters: u32) -> CameraModel {
    CameraModel::new(
        image_size,
        FxFyCxCySkew {
            fx: v[0],
            fy: v[1],
            cx: v[2],
            cy: v[3],
            skew: 0.0,
        },
        BrownConrady5 {
            k1: v[4],
            k2: v[5],
            p1: v[6],
            p2: v[7],
            k3: v[8],
            iters,
        },
    )
}

/// Write a pose block into `out[..POSE_DIM]`.
pub fn pack_pose(pose: &Iso3, out: &mut [Real]) {
    let w = pose.rotation.scaled_axis();
    let t = pose.translation.vector;
    out[..POSE_DIM].copy_from_slice(&[w.x, w.y, w.z, t.x, t.y, t.z]);
}

pub fn unpack_pose(v: &[Real]) -> Iso3 {
    Iso3::from_parts(
        Translation3::new(v[3], v[4], v[5]),
        UnitQuaternion::from_scaled_axis(Vector3::new(v[0], v[1], v[2])),
    )
}

/// Pose blocks stored back to back starting at `offset`.
pub fn unpack_poses(x: &[Real], offset: usize, count: usize) -> Vec<Iso3> {
    (0..count)
        .map(|i| {
            let start = offset + POSE_DIM * i;
            unpack_pose(&x[start..start + POSE_DIM])
        })
        .collect()
}

/// Concatenate an optional leading block with pose blocks.
pub fn pack_with_poses(head: &[Real], poses: &[Iso3]) -> DVector<Real> {
    let mut x = DVector::zeros(head.len() + POSE_DIM * poses.len());
    x.as_mut_slice()[..head.len()].copy_from_slice(head);
    for (i, pose) in poses.iter().enumerate() {
        let start = head.len() + POSE_DIM * i;
        pack_pose(pose, &mut x.as_mut_slice()[start..start + POSE_DIM]);
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn pose_block_round_trip() {
        let pose = Iso3::from_parts(
            Translation3::new(1.0, -2.0, 300.0),
            UnitQuaternion::from_euler_angles(0.1, -0.2, 0.3),
        );
        let mut v = [0.0; POSE_DIM];
        pack_pose(&pose, &mut v);
        let back = unpack_pose(&v);
        assert_relative_eq!(back.to_homogeneous(), pose.to_homogeneous(), epsilon = 1e-12);
    }

    #[test]
    fn camera_block_uses_opencv_order() {
        let cam = CameraModel::new(
            ImageSize::new(640, 480),
            FxFyCxCySkew {
                fx: 500.0,
                fy: 510.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            BrownConrady5 {
                k1: -0.1,
                k2: 0.01,
                p1: 0.001,
                p2: -0.002,
                k3: 0.003,
                iters: 8,
            },
        );
        let mut v = [0.0; CAMERA_DIM];
        pack_camera(&cam, &mut v);
        assert_eq!(v, [500.0, 510.0, 320.0, 240.0, -0.1, 0.01, 0.001, -0.002, 0.003]);
        assert_eq!(unpack_camera(&v, cam.image_size, 8), cam);
    }
}
