use crate::bundle::{BundleError, CalibrationBundle, CameraPair};
use image::RgbImage;
use log::info;
use std::path::Path;
use std::sync::Arc;
use stereo_core::{ImageSize, Pt3, RectificationGeometry};
use stereo_depth::{DisparityField, RectificationMaps};

/// A calibrated rig ready for per-frame rectification.
///
/// The remap tables are shared behind an [`Arc`] and never mutated, so clones
/// are cheap and safe to hand to other threads.
#[derive(Debug, Clone)]
pub struct StereoRig {
    geometry: RectificationGeometry,
    maps: Arc<RectificationMaps>,
    cameras: Option<CameraPair>,
}

impl StereoRig {
    pub fn new(geometry: RectificationGeometry, maps: RectificationMaps, cameras: Option<CameraPair>) -> Self {
        Self {
            geometry,
            maps: Arc::new(maps),
            cameras,
        }
    }

    pub fn from_bundle(bundle: &CalibrationBundle) -> Result<Self, BundleError> {
        Ok(Self::new(bundle.geometry()?, bundle.maps()?, bundle.cameras))
    }

    pub fn load(path: &Path) -> Result<Self, BundleError> {
        let rig = Self::from_bundle(&CalibrationBundle::load(path)?)?;
        let size = rig.image_size();
        info!(
            "loaded calibration {} ({}x{}, f={:.1}px)",
            path.display(),
            size.width,
            size.height,
            rig.geometry.focal()
        );
        Ok(rig)
    }

    pub fn image_size(&self) -> ImageSize {
        self.geometry.image_size
    }

    pub fn geometry(&self) -> &RectificationGeometry {
        &self.geometry
    }

    pub fn maps(&self) -> &RectificationMaps {
        &self.maps
    }

    pub fn cameras(&self) -> Option<&CameraPair> {
        self.cameras.as_ref()
    }

    pub fn rectify(&self, left: &RgbImage, right: &RgbImage) -> (RgbImage, RgbImage) {
        self.maps.rectify_pair(left, right)
    }

    /// Left-rectified 3D point for a pixel of `field` through `Q`.
    pub fn reproject_point(&self, field: &DisparityField, x: u32, y: u32) -> Option<Pt3> {
        field.reproject(x, y, &self.geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_core::{CameraModel, FxFyCxCySkew, Real, StereoExtrinsics, Vec3};

    fn rig() -> StereoRig {
        let cam = CameraModel::pinhole(
            ImageSize::new(40, 30),
            FxFyCxCySkew {
                fx: 50.0,
                fy: 50.0,
                cx: 19.5,
                cy: 14.5,
                skew: 0.0,
            },
        );
        let extr = StereoExtrinsics::new(nalgebra::Matrix3::identity(), Vec3::new(-60.0, 0.0, 0.0));
        let geometry = RectificationGeometry::aligned(&cam, extr.translation.x);
        let maps = RectificationMaps::build(&cam, &cam, &geometry).unwrap();
        let bundle = CalibrationBundle::new(&geometry, &maps, None, Some(&extr));
        StereoRig::from_bundle(&bundle).unwrap()
    }

    #[test]
    fn identity_rig_passes_frames_through() {
        let rig = rig();
        let img = RgbImage::from_fn(40, 30, |x, y| image::Rgb([x as u8 * 5, y as u8 * 7, 99]));
        let (l, r) = rig.rectify(&img, &img);
        assert_eq!(l, img);
        assert_eq!(r, img);
    }

    #[test]
    fn disparity_reprojects_to_depth() {
        let rig = rig();
        let mut field = DisparityField::zeros(40, 30, 0, 16);
        field.set(19, 14, 10.0);
        let p = rig.reproject_point(&field, 19, 14).unwrap();
        // z = f * b / d
        let expected: Real = 50.0 * 60.0 / 10.0;
        assert!((p.z - expected).abs() < 1e-6, "{p:?}");
        assert!(rig.reproject_point(&field, 0, 0).is_none());
    }
}
