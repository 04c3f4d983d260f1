use serde::{Deserialize, Serialize};

use super::{BrownConrady5, DistortionModel, FxFyCxCySkew, IntrinsicsModel, Pinhole, ProjectionModel};
use crate::{Iso3, Mat3, Pt2, Pt3, Real, Vec2, Vec3};

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels (`width * height`).
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Calibrated pinhole camera with Brown-Conrady distortion.
///
/// `pixel = K * distort(project(p_c))` for a camera-frame point `p_c`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    /// Image size the model was calibrated for.
    pub image_size: ImageSize,
    pub k: FxFyCxCySkew<Real>,
    pub dist: BrownConrady5<Real>,
}

impl CameraModel {
    pub fn new(image_size: ImageSize, k: FxFyCxCySkew<Real>, dist: BrownConrady5<Real>) -> Self {
        Self {
            image_size,
            k,
            dist,
        }
    }

    /// Camera with zero distortion.
    pub fn pinhole(image_size: ImageSize, k: FxFyCxCySkew<Real>) -> Self {
        Self::new(image_size, k, BrownConrady5::default())
    }

    pub fn k_matrix(&self) -> Mat3 {
        self.k.k_matrix()
    }

    /// Project a camera-frame point to pixels. `None` if the point is behind the camera.
    pub fn project_point(&self, p_c: &Pt3) -> Option<Pt2> {
        let n = Pinhole.project_dir(&p_c.coords)?;
        Some(self.normalized_to_pixel(&n))
    }

    /// Project a target-frame point seen under `cam_se3_target`.
    pub fn project_target_point(&self, cam_se3_target: &Iso3, p_t: &Pt3) -> Option<Pt2> {
        self.project_point(&cam_se3_target.transform_point(p_t))
    }

    /// Distort ideal normalized coordinates and map them to pixels.
    pub fn normalized_to_pixel(&self, n_undist: &Vec2) -> Pt2 {
        let n_dist = self.dist.distort(n_undist);
        let px = self.k.normalized_to_pixel(&n_dist);
        Pt2::new(px.x, px.y)
    }

    /// Remove intrinsics and distortion: pixel -> ideal normalized coordinates.
    pub fn pixel_to_normalized(&self, px: &Pt2) -> Vec2 {
        let n_dist = self.k.pixel_to_normalized(&px.coords);
        self.dist.undistort(&n_dist)
    }

    /// Unit-depth camera-frame ray through a pixel.
    pub fn backproject_pixel(&self, px: &Pt2) -> Vec3 {
        Pinhole.unproject_dir(&self.pixel_to_normalized(px))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraModel {
        CameraModel::new(
            ImageSize::new(640, 480),
            FxFyCxCySkew {
                fx: 600.0,
                fy: 610.0,
                cx: 320.0,
                cy: 240.0,
                skew: 0.0,
            },
            BrownConrady5 {
                k1: -0.1,
                k2: 0.02,
                k3: 0.0,
                p1: 0.0005,
                p2: -0.0003,
                iters: 16,
            },
        )
    }

    #[test]
    fn project_then_backproject_recovers_ray() {
        let cam = camera();
        let p = Pt3::new(0.2, -0.1, 1.5);
        let px = cam.project_point(&p).unwrap();
        let ray = cam.backproject_pixel(&px);
        let expected = Vec3::new(p.x / p.z, p.y / p.z, 1.0);
        assert!((ray - expected).norm() < 1e-9);
    }

    #[test]
    fn points_behind_camera_are_rejected() {
        assert!(camera().project_point(&Pt3::new(0.0, 0.0, -1.0)).is_none());
    }

    #[test]
    fn serde_round_trip_is_exact() {
        let cam = camera();
        let json = serde_json::to_string(&cam).unwrap();
        let back: CameraModel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cam);
    }
}
