//! Floating-point grayscale helpers.

use image::{GrayImage, ImageBuffer, Luma};

/// Single-channel `f32` image with intensities in `[0, 1]`.
pub type GrayF32 = ImageBuffer<Luma<f32>, Vec<f32>>;

pub fn to_f32(img: &GrayImage) -> GrayF32 {
    let (w, h) = img.dimensions();
    let data = img.as_raw().iter().map(|&v| v as f32 / 255.0).collect();
    // Buffer length equals w * h by construction.
    GrayF32::from_raw(w, h, data).unwrap_or_else(|| GrayF32::new(w, h))
}

/// Gaussian blur via `imageproc`; `sigma <= 0` returns a copy.
pub fn blur(img: &GrayF32, sigma: f32) -> GrayF32 {
    if sigma <= 0.0 {
        return img.clone();
    }
    imageproc::filter::gaussian_blur_f32(img, sigma)
}

#[inline]
fn at(img: &GrayF32, x: i64, y: i64) -> f32 {
    let (w, h) = img.dimensions();
    let xc = x.clamp(0, w as i64 - 1) as u32;
    let yc = y.clamp(0, h as i64 - 1) as u32;
    img.get_pixel(xc, yc)[0]
}

/// Bilinear sample with clamp-to-edge borders.
pub fn sample(img: &GrayF32, x: f32, y: f32) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (xi, yi) = (x0 as i64, y0 as i64);
    let top = at(img, xi, yi) * (1.0 - fx) + at(img, xi + 1, yi) * fx;
    let bottom = at(img, xi, yi + 1) * (1.0 - fx) + at(img, xi + 1, yi + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}
