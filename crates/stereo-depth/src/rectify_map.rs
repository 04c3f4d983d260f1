//! Undistort-and-rectify lookup tables and per-frame remapping.

use image::{GrayImage, Luma, Pixel, Rgb, RgbImage};
use log::debug;
use stereo_core::{CameraModel, ImageSize, Mat3, Mat34, Real, RectificationGeometry, Vec2, Vec3};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemapError {
    #[error("map has {got} entries, expected {expected} for {width}x{height}")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
    #[error("rectified projection matrix is singular")]
    SingularProjection,
}

/// Per-output-pixel source coordinates for one camera.
///
/// `(map_x[i], map_y[i])` is the fractional source pixel sampled for output
/// pixel `i` (row-major).
#[derive(Debug, Clone, PartialEq)]
pub struct RemapTable {
    width: u32,
    height: u32,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
}

impl RemapTable {
    pub fn from_parts(width: u32, height: u32, map_x: Vec<f32>, map_y: Vec<f32>) -> Result<Self, RemapError> {
        let expected = width as usize * height as usize;
        for got in [map_x.len(), map_y.len()] {
            if got != expected {
                return Err(RemapError::SizeMismatch {
                    width,
                    height,
                    expected,
                    got,
                });
            }
        }
        Ok(Self {
            width,
            height,
            map_x,
            map_y,
        })
    }

    /// Build the table mapping rectified pixels (projection `p`, rotation `r`)
    /// back to raw pixels of `camera`.
    pub fn build(camera: &CameraModel, r: &Mat3, p: &Mat34, size: ImageSize) -> Result<Self, RemapError> {
        let k_new = p.fixed_view::<3, 3>(0, 0).into_owned();
        let ir = (k_new * r).try_inverse().ok_or(RemapError::SingularProjection)?;
        let n = size.area();
        let mut map_x = Vec::with_capacity(n);
        let mut map_y = Vec::with_capacity(n);
        for v in 0..size.height {
            for u in 0..size.width {
                let ray = ir * Vec3::new(u as Real, v as Real, 1.0);
                if ray.z <= 0.0 {
                    map_x.push(-1.0);
                    map_y.push(-1.0);
                    continue;
                }
                let px = camera.normalized_to_pixel(&Vec2::new(ray.x / ray.z, ray.y / ray.z));
                map_x.push(px.x as f32);
                map_y.push(px.y as f32);
            }
        }
        Self::from_parts(size.width, size.height, map_x, map_y)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn map_x(&self) -> &[f32] {
        &self.map_x
    }

    pub fn map_y(&self) -> &[f32] {
        &self.map_y
    }

    /// Source coordinate for output pixel `(x, y)`.
    pub fn lookup(&self, x: u32, y: u32) -> (f32, f32) {
        let i = y as usize * self.width as usize + x as usize;
        (self.map_x[i], self.map_y[i])
    }

    fn remap<P, F>(&self, src_w: u32, src_h: u32, mut fetch: F) -> image::ImageBuffer<P, Vec<u8>>
    where
        P: Pixel<Subpixel = u8>,
        F: FnMut(u32, u32) -> P,
    {
        let channels = P::CHANNEL_COUNT as usize;
        image::ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let (sx, sy) = self.lookup(x, y);
            let x0 = sx.floor();
            let y0 = sy.floor();
            let (fx, fy) = (sx - x0, sy - y0);
            let (xi, yi) = (x0 as i64, y0 as i64);
            let mut acc = [0.0f32; 4];
            for (dx, dy, w) in [
                (0, 0, (1.0 - fx) * (1.0 - fy)),
                (1, 0, fx * (1.0 - fy)),
                (0, 1, (1.0 - fx) * fy),
                (1, 1, fx * fy),
            ] {
                let (px, py) = (xi + dx, yi + dy);
                // Constant-zero border.
                if px < 0 || py < 0 || px >= src_w as i64 || py >= src_h as i64 || w == 0.0 {
                    continue;
                }
                let pix = fetch(px as u32, py as u32);
                for (a, c) in acc.iter_mut().zip(pix.channels()) {
                    *a += w * *c as f32;
                }
            }
            let mut out = [0u8; 4];
            for c in 0..channels {
                out[c] = acc[c].round().clamp(0.0, 255.0) as u8;
            }
            *P::from_slice(&out[..channels])
        })
    }

    /// Bilinear remap of a grayscale frame; samples outside the source are zero.
    pub fn apply(&self, src: &GrayImage) -> GrayImage {
        let (w, h) = src.dimensions();
        self.remap::<Luma<u8>, _>(w, h, |x, y| *src.get_pixel(x, y))
    }

    /// Bilinear remap of a colour frame.
    pub fn apply_rgb(&self, src: &RgbImage) -> RgbImage {
        let (w, h) = src.dimensions();
        self.remap::<Rgb<u8>, _>(w, h, |x, y| *src.get_pixel(x, y))
    }
}

/// Rectification tables for both cameras of a rig.
#[derive(Debug, Clone, PartialEq)]
pub struct RectificationMaps {
    pub left: RemapTable,
    pub right: RemapTable,
}

impl RectificationMaps {
    pub fn build(
        left: &CameraModel,
        right: &CameraModel,
        geometry: &RectificationGeometry,
    ) -> Result<Self, RemapError> {
        let size = geometry.image_size;
        let maps = Self {
            left: RemapTable::build(left, &geometry.r1, &geometry.p1, size)?,
            right: RemapTable::build(right, &geometry.r2, &geometry.p2, size)?,
        };
        debug!("rectification maps built for {}x{}", size.width, size.height);
        Ok(maps)
    }

    pub fn rectify_pair(&self, left: &RgbImage, right: &RgbImage) -> (RgbImage, RgbImage) {
        (self.left.apply_rgb(left), self.right.apply_rgb(right))
    }
}
