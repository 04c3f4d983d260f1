//! Repeatable corner jitter for synthetic calibration sets.

use crate::{Pt2, Real, Vec2};

/// Uniform per-axis pixel jitter in `[-max_abs_px, max_abs_px]`.
///
/// Each sample is a pure function of `(seed, view, point)`, so a dataset can
/// be regenerated exactly without carrying RNG state around.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UniformPixelNoise {
    pub seed: u64,
    pub max_abs_px: Real,
}

impl UniformPixelNoise {
    pub fn sample(&self, view_idx: usize, point_idx: usize) -> Vec2 {
        let amplitude = self.max_abs_px.abs();
        if amplitude == 0.0 {
            return Vec2::zeros();
        }
        let mut state = self.seed ^ ((view_idx as u64) << 32 | point_idx as u64).rotate_left(17);
        let mut unit = || 2.0 * to_unit(pcg_step(&mut state)) - 1.0;
        Vec2::new(unit() * amplitude, unit() * amplitude)
    }

    pub fn apply(&self, view_idx: usize, point_idx: usize, px: Pt2) -> Pt2 {
        px + self.sample(view_idx, point_idx)
    }
}

/// One PCG-XSH-RR style step with a 64-bit output.
fn pcg_step(state: &mut u64) -> u64 {
    *state = state
        .wrapping_mul(6_364_136_223_846_793_005)
        .wrapping_add(1_442_695_040_888_963_407);
    let x = *state;
    let hi = ((x ^ (x >> 18)) >> 27) as u32;
    let lo = (x >> 33) as u32 ^ hi.rotate_right((x >> 59) as u32);
    (u64::from(hi.rotate_right((x >> 59) as u32)) << 32) | u64::from(lo)
}

/// `[0, 1)` from the top 53 bits.
fn to_unit(x: u64) -> Real {
    (x >> 11) as Real / (1u64 << 53) as Real
}
