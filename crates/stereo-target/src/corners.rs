//! Saddle-point corner candidates.

use crate::gray::{sample, GrayF32};
use serde::{Deserialize, Serialize};
use stereo_core::Pt2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CornerParams {
    /// Gaussian sigma applied before the Hessian.
    pub blur_sigma: f32,
    /// Keep responses above this fraction of the strongest one.
    pub threshold_rel: f32,
    /// Non-maximum suppression radius (pixels).
    pub nms_radius: u32,
    /// Radius of the ring sampled to verify the alternating quadrant pattern.
    pub ring_radius: f32,
    /// Minimum intensity spread on the ring (intensities in `[0, 1]`).
    pub min_ring_contrast: f32,
}

impl Default for CornerParams {
    fn default() -> Self {
        Self {
            blur_sigma: 1.5,
            threshold_rel: 0.1,
            nms_radius: 3,
            ring_radius: 5.0,
            min_ring_contrast: 0.15,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub pos: Pt2,
    pub response: f32,
}

/// `Ixy^2 - Ixx * Iyy`, positive at saddle points.
fn saddle_response(img: &GrayF32) -> Vec<f32> {
    let (w, h) = img.dimensions();
    let (w, h) = (w as usize, h as usize);
    let raw = img.as_raw();
    let mut out = vec![0.0f32; w * h];
    for y in 1..h.saturating_sub(1) {
        for x in 1..w.saturating_sub(1) {
            let i = y * w + x;
            let c = raw[i];
            let ixx = raw[i - 1] - 2.0 * c + raw[i + 1];
            let iyy = raw[i - w] - 2.0 * c + raw[i + w];
            let ixy = 0.25 * (raw[i + w + 1] - raw[i + w - 1] - raw[i - w + 1] + raw[i - w - 1]);
            out[i] = (ixy * ixy - ixx * iyy).max(0.0);
        }
    }
    out
}

/// Number of sign changes of `I - mean` along a ring, or `None` when the ring
/// has too little contrast.
pub(crate) fn ring_sign_changes(img: &GrayF32, p: Pt2, radius: f32, min_contrast: f32) -> Option<usize> {
    const SAMPLES: usize = 32;
    let values: Vec<f32> = (0..SAMPLES)
        .map(|k| {
            let a = k as f32 * std::f32::consts::TAU / SAMPLES as f32;
            sample(img, p.x as f32 + radius * a.cos(), p.y as f32 + radius * a.sin())
        })
        .collect();
    let (lo, hi) = values
        .iter()
        .fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi - lo < min_contrast {
        return None;
    }
    let mid = 0.5 * (lo + hi);
    let signs: Vec<bool> = values.iter().map(|&v| v > mid).collect();
    Some((0..SAMPLES).filter(|&k| signs[k] != signs[(k + 1) % SAMPLES]).count())
}

/// Pixel-accurate chessboard corner candidates on a pre-blurred image.
pub(crate) fn detect_candidates(blurred: &GrayF32, params: &CornerParams) -> Vec<Candidate> {
    let (w, h) = blurred.dimensions();
    let (w, h) = (w as usize, h as usize);
    let response = saddle_response(blurred);
    let max = response.iter().copied().fold(0.0f32, f32::max);
    if max <= 0.0 {
        return Vec::new();
    }
    let threshold = params.threshold_rel * max;
    let r = params.nms_radius as usize;
    let margin = (params.ring_radius.ceil() as usize + 1).max(r);

    let mut out = Vec::new();
    for y in margin..h.saturating_sub(margin) {
        for x in margin..w.saturating_sub(margin) {
            let v = response[y * w + x];
            if v < threshold {
                continue;
            }
            let is_max = (y - r..=y + r).all(|yy| {
                (x - r..=x + r).all(|xx| {
                    let o = response[yy * w + xx];
                    // Strict on earlier pixels so plateaus keep one winner.
                    o < v || (o == v && (yy, xx) >= (y, x))
                })
            });
            if !is_max {
                continue;
            }
            let pos = Pt2::new(x as f64, y as f64);
            if ring_sign_changes(blurred, pos, params.ring_radius, params.min_ring_contrast) == Some(4) {
                out.push(Candidate { pos, response: v });
            }
        }
    }
    out
}
