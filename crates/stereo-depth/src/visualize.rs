//! Colour views of disparity fields for display and capture records.

use crate::disparity::DisparityField;
use image::{imageops, GrayImage, Luma, Rgb, RgbImage};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use imageproc::edges::canny;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BLEND: f32 = 0.6;
pub const BLEND_STEP: f32 = 0.05;

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
/// Gaussian sigma matching a 21x21 kernel.
const EDGE_BLUR_SIGMA: f32 = 3.5;
const EDGE_FRAME_WEIGHT: f32 = 0.4;

/// Which view the presenter shows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisualStyle {
    /// Colour-mapped disparity only.
    Depth,
    /// Disparity colours blended over the left frame.
    Overlay,
    /// Edge-distance view of the left frame.
    EdgeDistance,
    /// Five-view panel: both frames and the depth map on top, overlay and
    /// edge view below.
    #[default]
    Panel,
}

/// JET colormap entry for `v` in `0..=255`.
pub fn jet(v: u8) -> Rgb<u8> {
    let t = v as f32 / 255.0;
    let channel = |centre: f32| ((1.5 - (4.0 * t - centre).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Colour-map the valid positive disparities (`min_disparity < v < max`),
/// normalized to their own min/max and median-filtered. Other pixels are black.
pub fn depth_color(field: &DisparityField) -> RgbImage {
    let lo_bound = field.min_disparity as f32;
    let hi_bound = field.max_disparity();
    let in_mask = |v: f32| v > lo_bound && v < hi_bound;

    let (min, max) = field
        .data
        .iter()
        .filter(|&&v| in_mask(v))
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
    if !min.is_finite() {
        return RgbImage::new(field.width, field.height);
    }

    let gray = GrayImage::from_fn(field.width, field.height, |x, y| {
        let v = field.get(x, y);
        if in_mask(v) {
            Luma([((v - min) / (max - min + 1e-5) * 255.0) as u8])
        } else {
            Luma([0])
        }
    });
    let smoothed = median_filter(&gray, 2, 2);
    RgbImage::from_fn(field.width, field.height, |x, y| {
        if in_mask(field.get(x, y)) {
            jet(smoothed.get_pixel(x, y)[0])
        } else {
            Rgb([0, 0, 0])
        }
    })
}

/// `base * (1 - strength) + overlay * strength`, per channel.
pub fn blend(base: &RgbImage, overlay: &RgbImage, strength: f32) -> RgbImage {
    let s = strength.clamp(0.0, 1.0);
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let a = base.get_pixel(x, y);
        let b = if x < overlay.width() && y < overlay.height() {
            *overlay.get_pixel(x, y)
        } else {
            Rgb([0, 0, 0])
        };
        Rgb(std::array::from_fn(|c| {
            (a[c] as f32 * (1.0 - s) + b[c] as f32 * s).round().clamp(0.0, 255.0) as u8
        }))
    })
}

/// Distance-to-nearest-edge map of `frame`, colour-mapped and blended over it.
pub fn edge_distance_view(frame: &RgbImage) -> RgbImage {
    let gray = imageops::grayscale(frame);
    let edges = canny(&gray, CANNY_LOW, CANNY_HIGH);
    let dist_sq = euclidean_squared_distance_transform(&edges);

    let dist: Vec<f64> = dist_sq
        .pixels()
        .map(|p| if p[0].is_finite() { p[0].sqrt() } else { 0.0 })
        .collect();
    let (min, max) = dist
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), &v| (a.min(v), b.max(v)));
    let range = max - min;
    let normalized = GrayImage::from_fn(frame.width(), frame.height(), |x, y| {
        let v = dist[(y * frame.width() + x) as usize];
        if range > 0.0 {
            Luma([((v - min) / range * 255.0).round() as u8])
        } else {
            Luma([0])
        }
    });

    let blurred = gaussian_blur_f32(&normalized, EDGE_BLUR_SIGMA);
    let colored = RgbImage::from_fn(frame.width(), frame.height(), |x, y| jet(blurred.get_pixel(x, y)[0]));
    blend(frame, &colored, 1.0 - EDGE_FRAME_WEIGHT)
}

/// Tile four equally sized images as `[tl, tr; bl, br]`.
pub fn composite_2x2(tl: &RgbImage, tr: &RgbImage, bl: &RgbImage, br: &RgbImage) -> RgbImage {
    let (w, h) = tl.dimensions();
    let mut out = RgbImage::new(2 * w, 2 * h);
    imageops::replace(&mut out, tl, 0, 0);
    imageops::replace(&mut out, tr, w as i64, 0);
    imageops::replace(&mut out, bl, 0, h as i64);
    imageops::replace(&mut out, br, w as i64, h as i64);
    out
}

/// All views derived from one rectified pair and its disparities.
#[derive(Debug, Clone)]
pub struct ViewSet {
    pub left: RgbImage,
    pub right: RgbImage,
    pub depth: RgbImage,
    pub overlay: RgbImage,
    pub edges: RgbImage,
}

impl ViewSet {
    /// Auxiliary composite stored as the capture's depth image:
    /// `[right, depth; overlay, edges]`.
    pub fn capture_composite(&self) -> RgbImage {
        composite_2x2(&self.right, &self.depth, &self.overlay, &self.edges)
    }

    /// Three views on top, two centred below with half-width black padding.
    pub fn panel(&self) -> RgbImage {
        let (w, h) = self.left.dimensions();
        let mut out = RgbImage::new(3 * w, 2 * h);
        for (i, view) in [&self.left, &self.right, &self.depth].into_iter().enumerate() {
            imageops::replace(&mut out, view, (i as u32 * w) as i64, 0);
        }
        imageops::replace(&mut out, &self.overlay, (w / 2) as i64, h as i64);
        imageops::replace(&mut out, &self.edges, (w / 2 + w) as i64, h as i64);
        out
    }

    pub fn render(&self, style: VisualStyle) -> RgbImage {
        match style {
            VisualStyle::Depth => self.depth.clone(),
            VisualStyle::Overlay => self.overlay.clone(),
            VisualStyle::EdgeDistance => self.edges.clone(),
            VisualStyle::Panel => self.panel(),
        }
    }
}

/// Display settings that operators adjust while the session runs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Visualizer {
    pub style: VisualStyle,
    pub blend: f32,
}

impl Default for Visualizer {
    fn default() -> Self {
        Self {
            style: VisualStyle::default(),
            blend: DEFAULT_BLEND,
        }
    }
}

impl Visualizer {
    pub fn new(style: VisualStyle, blend: f32) -> Self {
        Self {
            style,
            blend: blend.clamp(0.0, 1.0),
        }
    }

    pub fn increase_blend(&mut self) {
        self.blend = (self.blend + BLEND_STEP).min(1.0);
    }

    pub fn decrease_blend(&mut self) {
        self.blend = (self.blend - BLEND_STEP).max(0.0);
    }

    pub fn views(&self, left: &RgbImage, right: &RgbImage, field: &DisparityField) -> ViewSet {
        let depth = depth_color(field);
        ViewSet {
            overlay: blend(left, &depth, self.blend),
            edges: edge_distance_view(left),
            left: left.clone(),
            right: right.clone(),
            depth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_endpoints() {
        assert_eq!(jet(0), Rgb([0, 0, 128]));
        assert_eq!(jet(255), Rgb([128, 0, 0]));
        let mid = jet(128);
        assert!(mid[1] > 240);
    }

    #[test]
    fn depth_color_blacks_out_invalid_pixels() {
        let mut field = DisparityField::invalid(12, 12, 0, 16);
        for y in 0..12 {
            for x in 6..12 {
                field.set(x, y, 2.0 + x as f32);
            }
        }
        let img = depth_color(&field);
        assert_eq!(img.get_pixel(2, 5), &Rgb([0, 0, 0]));
        assert_ne!(img.get_pixel(9, 5), &Rgb([0, 0, 0]));
        // Zero disparity sits on the mask boundary.
        field.set(9, 5, 0.0);
        assert_eq!(depth_color(&field).get_pixel(9, 5), &Rgb([0, 0, 0]));
    }

    #[test]
    fn blend_interpolates_and_clamps() {
        let a = RgbImage::from_pixel(2, 2, Rgb([100, 0, 200]));
        let b = RgbImage::from_pixel(2, 2, Rgb([200, 100, 0]));
        assert_eq!(blend(&a, &b, 0.5).get_pixel(0, 0), &Rgb([150, 50, 100]));
        assert_eq!(blend(&a, &b, 3.0).get_pixel(1, 1), &Rgb([200, 100, 0]));
    }

    #[test]
    fn blend_steps_stay_in_range() {
        let mut v = Visualizer::default();
        for _ in 0..20 {
            v.increase_blend();
        }
        assert_eq!(v.blend, 1.0);
        for _ in 0..30 {
            v.decrease_blend();
        }
        assert_eq!(v.blend, 0.0);
    }

    #[test]
    fn edge_view_keeps_frame_size() {
        let frame = RgbImage::from_fn(40, 30, |x, _| if x < 20 { Rgb([20, 20, 20]) } else { Rgb([230, 230, 230]) });
        let view = edge_distance_view(&frame);
        assert_eq!(view.dimensions(), (40, 30));
        let flat = edge_distance_view(&RgbImage::from_pixel(10, 10, Rgb([90, 90, 90])));
        assert_eq!(flat.dimensions(), (10, 10));
    }

    #[test]
    fn composites_have_expected_layout() {
        let solid = |v| RgbImage::from_pixel(4, 3, Rgb([v, v, v]));
        let views = ViewSet {
            left: solid(1),
            right: solid(2),
            depth: solid(3),
            overlay: solid(4),
            edges: solid(5),
        };
        let cap = views.capture_composite();
        assert_eq!(cap.dimensions(), (8, 6));
        assert_eq!(cap.get_pixel(0, 0)[0], 2);
        assert_eq!(cap.get_pixel(5, 0)[0], 3);
        assert_eq!(cap.get_pixel(0, 4)[0], 4);
        assert_eq!(cap.get_pixel(7, 5)[0], 5);

        let panel = views.render(VisualStyle::Panel);
        assert_eq!(panel.dimensions(), (12, 6));
        assert_eq!(panel.get_pixel(0, 4)[0], 0);
        assert_eq!(panel.get_pixel(2, 4)[0], 4);
        assert_eq!(panel.get_pixel(6, 4)[0], 5);
    }
}
