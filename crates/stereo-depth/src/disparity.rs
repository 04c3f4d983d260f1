//! Dense disparity field.

use serde::{Deserialize, Serialize};
use stereo_core::{Pt3, Real, RectificationGeometry};

/// Row-major `f32` disparities in pixels, together with the matcher's
/// search range.
///
/// A value `v` is valid when `invalid_value() < v < max_disparity()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisparityField {
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub num_disparities: i32,
    pub data: Vec<f32>,
}

impl DisparityField {
    /// Field filled with the invalid marker.
    pub fn invalid(width: u32, height: u32, min_disparity: i32, num_disparities: i32) -> Self {
        let marker = (min_disparity - 1) as f32;
        Self {
            width,
            height,
            min_disparity,
            num_disparities,
            data: vec![marker; width as usize * height as usize],
        }
    }

    /// Field filled with zeros (used when decoding sparse data).
    pub fn zeros(width: u32, height: u32, min_disparity: i32, num_disparities: i32) -> Self {
        Self {
            width,
            height,
            min_disparity,
            num_disparities,
            data: vec![0.0; width as usize * height as usize],
        }
    }

    /// Value written for rejected pixels.
    pub fn invalid_value(&self) -> f32 {
        (self.min_disparity - 1) as f32
    }

    /// Exclusive upper bound of the search range.
    pub fn max_disparity(&self) -> f32 {
        (self.min_disparity + self.num_disparities) as f32
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: f32) {
        let i = self.index(x, y);
        self.data[i] = v;
    }

    #[inline]
    pub fn is_valid(&self, v: f32) -> bool {
        v > self.invalid_value() && v < self.max_disparity()
    }

    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|&&v| self.is_valid(v)).count()
    }

    /// Fraction of pixels with a strictly positive disparity.
    pub fn positive_fraction(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().filter(|&&v| v > 0.0).count() as f64 / self.data.len() as f64
    }

    /// Left-rectified 3D point for pixel `(x, y)`; `None` for invalid or
    /// non-positive disparities.
    pub fn reproject(&self, x: u32, y: u32, geometry: &RectificationGeometry) -> Option<Pt3> {
        let d = self.get(x, y);
        if !self.is_valid(d) || d <= 0.0 {
            return None;
        }
        geometry.reproject(x as Real, y as Real, d as Real)
    }
}
