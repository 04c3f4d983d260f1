//! Semi-global block matching on rectified image pairs.
//!
//! Pixel costs are Birchfield-Tomasi dissimilarities of an x-Sobel
//! prefiltered image plus a quarter of the raw-intensity dissimilarity,
//! summed over a square window. Costs are then aggregated along scanline
//! paths with the usual `P1`/`P2` smoothness penalties. Each pixel takes the
//! winner that passes the uniqueness test, refined by a parabola fit and then
//! checked against the right-view winners. Disparities are kept in 16x fixed point
//! until the speckle filter has run.
//!
//! Block costs are produced one row at a time from a rolling window of
//! horizontal sums. [`SgbmMode::ThreeWay`] consumes them in a single top-down
//! pass; the four and eight path modes keep the top-down sums of every row
//! and finish each row on the way back up. All buffers
//! live in the matcher and are reused across frames.

use crate::disparity::DisparityField;
use crate::speckle::filter_speckles;
use crate::DISP_SCALE;
use image::{GrayImage, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SgbmError {
    #[error("num_disparities must be a positive multiple of 16, got {0}")]
    InvalidNumDisparities(i32),
    #[error("block_size must be odd and within 1..=21, got {0}")]
    InvalidBlockSize(u32),
    #[error("penalties must satisfy 0 < p1 < p2, got p1={p1} p2={p2}")]
    InvalidPenalties { p1: u32, p2: u32 },
    #[error("uniqueness_ratio must be below 100, got {0}")]
    InvalidUniquenessRatio(u32),
    #[error("pre_filter_cap must be within 1..=63, got {0}")]
    InvalidPreFilterCap(u32),
    #[error("image sizes differ: left {left:?}, right {right:?}")]
    SizeMismatch { left: (u32, u32), right: (u32, u32) },
}

/// Aggregation directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SgbmMode {
    /// Left-to-right, right-to-left and top-to-bottom paths in one streaming
    /// pass. Only a few rows of costs are alive at any time.
    #[default]
    ThreeWay,
    /// Horizontal and vertical paths.
    FourPath,
    /// Adds the four diagonals.
    EightPath,
}

type Direction = (isize, isize);

const ROW_AND_DOWN: &[Direction] = &[(1, 0), (-1, 0), (0, 1)];
const ROW_AND_DOWN_DIAGONAL: &[Direction] = &[(1, 0), (-1, 0), (0, 1), (1, 1), (-1, 1)];
const UP: &[Direction] = &[(0, -1)];
const NO_PATHS: &[Direction] = &[];
const UP_DIAGONAL: &[Direction] = &[(0, -1), (1, -1), (-1, -1)];

impl SgbmMode {
    /// Directions `(dx, dy)` aggregated on the top-down pass and on the
    /// bottom-up pass. The predecessor of `(x, y)` is `(x - dx, y - dy)`.
    fn passes(self) -> (&'static [Direction], &'static [Direction]) {
        match self {
            SgbmMode::ThreeWay => (ROW_AND_DOWN, NO_PATHS),
            SgbmMode::FourPath => (ROW_AND_DOWN, UP),
            SgbmMode::EightPath => (ROW_AND_DOWN_DIAGONAL, UP_DIAGONAL),
        }
    }
}

/// Matcher tuning. `Default` gives the values used by the live pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgbmParams {
    pub min_disparity: i32,
    pub num_disparities: i32,
    pub block_size: u32,
    pub p1: u32,
    pub p2: u32,
    /// Maximum left-right disagreement in whole pixels; negative disables the check.
    pub disp12_max_diff: i32,
    pub uniqueness_ratio: u32,
    /// Largest blob (pixels) removed by the speckle filter; 0 disables it.
    pub speckle_window_size: u32,
    pub speckle_range: u32,
    pub pre_filter_cap: u32,
    pub mode: SgbmMode,
}

/// Smoothness penalties `(8 cn bs², 32 cn bs²)` for a block size and channel count.
pub fn default_penalties(block_size: u32, channels: u32) -> (u32, u32) {
    let area = block_size * block_size;
    (8 * channels * area, 32 * channels * area)
}

impl Default for SgbmParams {
    fn default() -> Self {
        let block_size = 9;
        let (p1, p2) = default_penalties(block_size, 3);
        Self {
            min_disparity: 0,
            num_disparities: 96,
            block_size,
            p1,
            p2,
            disp12_max_diff: 1,
            uniqueness_ratio: 10,
            speckle_window_size: 100,
            speckle_range: 32,
            pre_filter_cap: 63,
            mode: SgbmMode::ThreeWay,
        }
    }
}

impl SgbmParams {
    pub fn validate(&self) -> Result<(), SgbmError> {
        if self.num_disparities <= 0 || self.num_disparities % 16 != 0 {
            return Err(SgbmError::InvalidNumDisparities(self.num_disparities));
        }
        if self.block_size % 2 == 0 || !(1..=21).contains(&self.block_size) {
            return Err(SgbmError::InvalidBlockSize(self.block_size));
        }
        if self.p1 == 0 || self.p1 >= self.p2 {
            return Err(SgbmError::InvalidPenalties {
                p1: self.p1,
                p2: self.p2,
            });
        }
        if self.uniqueness_ratio >= 100 {
            return Err(SgbmError::InvalidUniquenessRatio(self.uniqueness_ratio));
        }
        if !(1..=63).contains(&self.pre_filter_cap) {
            return Err(SgbmError::InvalidPreFilterCap(self.pre_filter_cap));
        }
        Ok(())
    }

    /// Marker written for rejected pixels, in whole pixels.
    pub fn invalid_disparity(&self) -> i32 {
        self.min_disparity - 1
    }
}

/// Validated matcher. Parameters are fixed for the lifetime of the value;
/// the working buffers are kept between calls and reused.
#[derive(Debug, Clone)]
pub struct SgbmMatcher {
    params: SgbmParams,
    scratch: Scratch,
}

#[derive(Debug, Clone, Default)]
struct Scratch {
    left_pf: Vec<u8>,
    right_pf: Vec<u8>,
    costs: CostRows,
    paths: Vec<PathRows>,
    /// Aggregated costs: one row in a single-pass mode, every row otherwise.
    sum: Vec<u32>,
    fixed: Vec<i32>,
    disp2: Vec<i32>,
    disp2_cost: Vec<u32>,
}

impl SgbmMatcher {
    pub fn new(params: SgbmParams) -> Result<Self, SgbmError> {
        params.validate()?;
        Ok(Self {
            params,
            scratch: Scratch::default(),
        })
    }

    pub fn params(&self) -> &SgbmParams {
        &self.params
    }

    /// Disparity of the left view against the right view.
    pub fn compute(&mut self, left: &GrayImage, right: &GrayImage) -> Result<DisparityField, SgbmError> {
        check_sizes(left.dimensions(), right.dimensions())?;
        let (w, h) = left.dimensions();
        Ok(self.run(left.as_raw(), right.as_raw(), w, h, 1))
    }

    /// Same as [`compute`](Self::compute) with costs summed over RGB channels.
    pub fn compute_rgb(&mut self, left: &RgbImage, right: &RgbImage) -> Result<DisparityField, SgbmError> {
        check_sizes(left.dimensions(), right.dimensions())?;
        let (w, h) = left.dimensions();
        Ok(self.run(left.as_raw(), right.as_raw(), w, h, 3))
    }

    fn run(&mut self, left: &[u8], right: &[u8], width: u32, height: u32, cn: usize) -> DisparityField {
        let p = self.params;
        let (w, h) = (width as usize, height as usize);
        let min_d = p.min_disparity;
        let nd = p.num_disparities as usize;
        let max_d = min_d + p.num_disparities;
        let invalid_scaled = p.invalid_disparity() * DISP_SCALE;

        let min_x1 = max_d.max(0) as usize;
        let max_x1 = (w as i64 + min_d.min(0) as i64).max(0) as usize;
        if max_x1 <= min_x1 || h == 0 {
            debug!("sgbm: {w}x{h} image has no column inside the disparity range");
            return DisparityField::invalid(width, height, min_d, p.num_disparities);
        }
        let w1 = max_x1 - min_x1;
        let stride = w1 * nd;

        let Scratch {
            left_pf,
            right_pf,
            costs,
            paths,
            sum,
            fixed,
            disp2,
            disp2_cost,
        } = &mut self.scratch;
        let cap = p.pre_filter_cap as i32;
        prefilter_x_sobel(left, w, h, cn, cap, left_pf);
        prefilter_x_sobel(right, w, h, cn, cap, right_pf);
        let geometry = CostGeometry {
            w,
            h,
            cn,
            min_x1,
            w1,
            nd,
            min_d,
            radius: (p.block_size / 2) as usize,
            sources: [(left_pf.as_slice(), right_pf.as_slice(), 0), (left, right, 2)],
        };
        costs.reset(&geometry);
        let select = WinnerSelection {
            min_x1,
            max_x1,
            nd,
            min_d,
            uniqueness_ratio: p.uniqueness_ratio,
            disp12_max_diff: p.disp12_max_diff,
            invalid_scaled,
        };
        fixed.clear();
        fixed.resize(w * h, invalid_scaled);

        let (down, up) = p.mode.passes();
        start_paths(paths, down, w1, nd);
        if up.is_empty() {
            sum.clear();
            sum.resize(stride, 0);
            for y in 0..h {
                let cost = costs.row(&geometry, y);
                sum.fill(0);
                for path in paths.iter_mut() {
                    path.advance(cost, sum, y == 0, p.p1, p.p2);
                }
                select.row(sum, &mut fixed[y * w..(y + 1) * w], disp2, disp2_cost);
            }
        } else {
            sum.clear();
            sum.resize(h * stride, 0);
            for y in 0..h {
                let cost = costs.row(&geometry, y);
                let row_sum = &mut sum[y * stride..(y + 1) * stride];
                for path in paths.iter_mut() {
                    path.advance(cost, row_sum, y == 0, p.p1, p.p2);
                }
            }
            start_paths(paths, up, w1, nd);
            for y in (0..h).rev() {
                let cost = costs.row(&geometry, y);
                let row_sum = &mut sum[y * stride..(y + 1) * stride];
                for path in paths.iter_mut() {
                    path.advance(cost, row_sum, y + 1 == h, p.p1, p.p2);
                }
                select.row(row_sum, &mut fixed[y * w..(y + 1) * w], disp2, disp2_cost);
            }
        }

        filter_speckles(
            fixed,
            w,
            h,
            invalid_scaled,
            p.speckle_window_size as usize,
            DISP_SCALE * p.speckle_range as i32,
        );

        let data: Vec<f32> = fixed.iter().map(|&v| v as f32 / DISP_SCALE as f32).collect();
        let field = DisparityField {
            width,
            height,
            min_disparity: min_d,
            num_disparities: p.num_disparities,
            data,
        };
        debug!(
            "sgbm: {w}x{h} {:?}, {} of {} pixels valid",
            p.mode,
            field.valid_count(),
            field.data.len()
        );
        field
    }
}

fn check_sizes(left: (u32, u32), right: (u32, u32)) -> Result<(), SgbmError> {
    if left != right {
        return Err(SgbmError::SizeMismatch { left, right });
    }
    Ok(())
}

/// Clipped horizontal Sobel response, shifted to `0..=2 cap`. Border columns
/// hold the zero response `cap`; rows are reflected at the image edges.
fn prefilter_x_sobel(src: &[u8], w: usize, h: usize, cn: usize, cap: i32, out: &mut Vec<u8>) {
    out.clear();
    out.resize(src.len(), cap as u8);
    if w < 3 {
        return;
    }
    let at = |x: usize, y: usize, c: usize| src[(y * w + x) * cn + c] as i32;
    for y in 0..h {
        let above = if y > 0 { y - 1 } else { 1.min(h - 1) };
        let below = if y + 1 < h { y + 1 } else { h.saturating_sub(2) };
        for x in 1..w - 1 {
            for c in 0..cn {
                let diff = |row: usize| at(x + 1, row, c) - at(x - 1, row, c);
                let v = diff(y) * 2 + diff(above) + diff(below);
                out[(y * w + x) * cn + c] = (v + cap).clamp(0, 2 * cap) as u8;
            }
        }
    }
}

/// Value with its lower and upper half-pixel interpolation bounds.
type Bounds = (i32, i32, i32);

/// Birchfield-Tomasi bounds of channel `c` along row `y`.
fn bt_bounds(src: &[u8], w: usize, cn: usize, y: usize, c: usize, out: &mut Vec<Bounds>) {
    let at = |x: usize| src[(y * w + x) * cn + c] as i32;
    out.clear();
    out.extend((0..w).map(|x| {
        let v = at(x);
        let prev = (v + at(x.saturating_sub(1))) / 2;
        let next = (v + at((x + 1).min(w - 1))) / 2;
        (v, v.min(prev).min(next), v.max(prev).max(next))
    }));
}

struct CostGeometry<'a> {
    w: usize,
    h: usize,
    cn: usize,
    min_x1: usize,
    w1: usize,
    nd: usize,
    min_d: i32,
    radius: usize,
    /// `(left, right, shift)`: each source adds its dissimilarity `>> shift`.
    sources: [(&'a [u8], &'a [u8], u32); 2],
}

impl CostGeometry<'_> {
    fn stride(&self) -> usize {
        self.w1 * self.nd
    }

    /// Pixel-wise matching costs of row `y` for every in-range column and
    /// disparity, `[x * nd + d]`.
    fn pixel_costs(&self, y: usize, out: &mut [u32], bounds: &mut [Vec<Bounds>; 2]) {
        out.fill(0);
        let [lb, rb] = bounds;
        for &(left, right, shift) in &self.sources {
            for c in 0..self.cn {
                bt_bounds(left, self.w, self.cn, y, c, lb);
                bt_bounds(right, self.w, self.cn, y, c, rb);
                for (xi, lane) in out.chunks_exact_mut(self.nd).enumerate() {
                    let x = self.min_x1 + xi;
                    let (u, ul, uh) = lb[x];
                    for (d, slot) in lane.iter_mut().enumerate() {
                        let x2 = (x as i64 - self.min_d as i64 - d as i64) as usize;
                        let (v, vl, vh) = rb[x2];
                        let c0 = (u - vh).max(vl - u).max(0);
                        let c1 = (v - uh).max(ul - v).max(0);
                        *slot += (c0.min(c1) >> shift) as u32;
                    }
                }
            }
        }
    }

    /// Sums of `pix` over `2 radius + 1` columns, clamped at the in-range
    /// borders.
    fn horizontal_sums(&self, pix: &[u32], out: &mut [u32]) {
        let (nd, w1, r) = (self.nd, self.w1, self.radius);
        let lane_at = |x: usize| &pix[x * nd..(x + 1) * nd];
        let first = &mut out[..nd];
        first.fill(0);
        for k in 0..=2 * r {
            for (a, &b) in first.iter_mut().zip(lane_at(k.saturating_sub(r).min(w1 - 1))) {
                *a += b;
            }
        }
        for xi in 1..w1 {
            let (done, rest) = out.split_at_mut(xi * nd);
            let lane = &mut rest[..nd];
            lane.copy_from_slice(&done[(xi - 1) * nd..]);
            let entering = lane_at((xi + r).min(w1 - 1));
            let leaving = lane_at((xi - 1).saturating_sub(r));
            for ((a, &p), &m) in lane.iter_mut().zip(entering).zip(leaving) {
                *a = *a + p - m;
            }
        }
    }
}

/// Block costs produced one row at a time from a ring of horizontal sums.
#[derive(Debug, Clone, Default)]
struct CostRows {
    ring: Vec<u32>,
    ring_rows: Vec<Option<usize>>,
    pix: Vec<u32>,
    bounds: [Vec<Bounds>; 2],
    /// Block costs of row `at`.
    window: Vec<u32>,
    at: Option<usize>,
}

impl CostRows {
    fn reset(&mut self, g: &CostGeometry<'_>) {
        let stride = g.stride();
        let slots = 2 * g.radius + 2;
        self.ring.resize(slots * stride, 0);
        self.ring_rows.clear();
        self.ring_rows.resize(slots, None);
        self.pix.resize(stride, 0);
        self.window.resize(stride, 0);
        self.at = None;
    }

    /// Offset into `ring` of the horizontal sums of row `y`.
    fn load(&mut self, g: &CostGeometry<'_>, y: usize) -> usize {
        let stride = g.stride();
        let slot = y % self.ring_rows.len();
        let offset = slot * stride;
        if self.ring_rows[slot] != Some(y) {
            g.pixel_costs(y, &mut self.pix, &mut self.bounds);
            g.horizontal_sums(&self.pix, &mut self.ring[offset..offset + stride]);
            self.ring_rows[slot] = Some(y);
        }
        offset
    }

    fn accumulate(&mut self, g: &CostGeometry<'_>, y: usize, add: bool) {
        let offset = self.load(g, y);
        let src = &self.ring[offset..offset + g.stride()];
        if add {
            self.window.iter_mut().zip(src).for_each(|(a, &b)| *a += b);
        } else {
            self.window.iter_mut().zip(src).for_each(|(a, &b)| *a -= b);
        }
    }

    /// Block costs of row `y`, `[x * nd + d]`, with rows clamped at the image
    /// borders. A step of one row from the previous call is incremental.
    fn row(&mut self, g: &CostGeometry<'_>, y: usize) -> &[u32] {
        let r = g.radius as isize;
        let last = g.h as isize - 1;
        let clamp = |v: isize| v.clamp(0, last) as usize;
        let yi = y as isize;
        match self.at {
            Some(at) if at == y => {}
            Some(at) if at + 1 == y => {
                self.accumulate(g, clamp(yi + r), true);
                self.accumulate(g, clamp(yi - r - 1), false);
            }
            Some(at) if y + 1 == at => {
                self.accumulate(g, clamp(yi - r), true);
                self.accumulate(g, clamp(yi + r + 1), false);
            }
            _ => {
                self.window.fill(0);
                for k in -r..=r {
                    self.accumulate(g, clamp(yi + k), true);
                }
            }
        }
        self.at = Some(y);
        &self.window
    }
}

/// Path costs of one direction for the previous and the current row.
#[derive(Debug, Clone, Default)]
struct PathRows {
    dx: isize,
    vertical: bool,
    prev: Vec<u32>,
    prev_min: Vec<u32>,
    cur: Vec<u32>,
    cur_min: Vec<u32>,
    lane: Vec<u32>,
}

impl PathRows {
    fn reset(&mut self, (dx, dy): Direction, w1: usize, nd: usize) {
        self.dx = dx;
        self.vertical = dy != 0;
        for buf in [&mut self.prev, &mut self.cur] {
            buf.resize(w1 * nd, 0);
        }
        for buf in [&mut self.prev_min, &mut self.cur_min] {
            buf.resize(w1, 0);
        }
        self.lane.resize(nd, 0);
    }

    /// Aggregate one row of block costs and add the result into `sum`.
    fn advance(&mut self, cost: &[u32], sum: &mut [u32], first_row: bool, p1: u32, p2: u32) {
        let nd = self.lane.len();
        let w1 = self.cur_min.len();
        for i in 0..w1 {
            let x = if self.dx >= 0 { i } else { w1 - 1 - i };
            let px = x as isize - self.dx;
            let min_prev = if (0..w1 as isize).contains(&px) && !(self.vertical && first_row) {
                let px = px as usize;
                let (buf, mins) = if self.vertical {
                    (&self.prev, &self.prev_min)
                } else {
                    (&self.cur, &self.cur_min)
                };
                self.lane.copy_from_slice(&buf[px * nd..(px + 1) * nd]);
                Some(mins[px])
            } else {
                None
            };
            let lanes = x * nd..(x + 1) * nd;
            let lane: &[u32] = &self.lane;
            let out = &mut self.cur[lanes.clone()];
            self.cur_min[x] = path_step(&cost[lanes.clone()], min_prev.map(|m| (lane, m)), out, p1, p2);
            for (s, &v) in sum[lanes].iter_mut().zip(out.iter()) {
                *s += v;
            }
        }
        if self.vertical {
            std::mem::swap(&mut self.prev, &mut self.cur);
            std::mem::swap(&mut self.prev_min, &mut self.cur_min);
        }
    }
}

fn start_paths(paths: &mut Vec<PathRows>, directions: &[Direction], w1: usize, nd: usize) {
    paths.resize_with(directions.len(), PathRows::default);
    for (path, &direction) in paths.iter_mut().zip(directions) {
        path.reset(direction, w1, nd);
    }
}

/// One step of the path recurrence. Returns the minimum of `out`.
fn path_step(cost: &[u32], prev: Option<(&[u32], u32)>, out: &mut [u32], p1: u32, p2: u32) -> u32 {
    let nd = cost.len();
    let mut best = u32::MAX;
    match prev {
        None => {
            for (o, &c) in out.iter_mut().zip(cost) {
                *o = c;
                best = best.min(c);
            }
        }
        Some((lp, min_prev)) => {
            let jump = min_prev + p2;
            for d in 0..nd {
                let mut m = lp[d].min(jump);
                if d > 0 {
                    m = m.min(lp[d - 1] + p1);
                }
                if d + 1 < nd {
                    m = m.min(lp[d + 1] + p1);
                }
                let v = cost[d] + m - min_prev;
                out[d] = v;
                best = best.min(v);
            }
        }
    }
    best
}

/// Per-row winner selection and left-right check.
struct WinnerSelection {
    min_x1: usize,
    max_x1: usize,
    nd: usize,
    min_d: i32,
    uniqueness_ratio: u32,
    disp12_max_diff: i32,
    invalid_scaled: i32,
}

impl WinnerSelection {
    /// Fill `out` (one image row, pre-set to the invalid marker) from the
    /// aggregated costs of that row.
    fn row(&self, sum: &[u32], out: &mut [i32], disp2: &mut Vec<i32>, disp2_cost: &mut Vec<u32>) {
        let w = out.len();
        disp2.clear();
        disp2.resize(w, self.min_d - 1);
        disp2_cost.clear();
        disp2_cost.resize(w, u32::MAX);
        for (xi, lane) in sum.chunks_exact(self.nd).enumerate() {
            let Some(d) = winner(lane, self.uniqueness_ratio) else {
                continue;
            };
            let min_s = lane[d];
            let x = self.min_x1 + xi;
            let x2 = x as i64 - d as i64 - self.min_d as i64;
            if (0..w as i64).contains(&x2) && disp2_cost[x2 as usize] > min_s {
                disp2_cost[x2 as usize] = min_s;
                disp2[x2 as usize] = d as i32 + self.min_d;
            }
            out[x] = subpixel(lane, d) + self.min_d * DISP_SCALE;
        }
        left_right_check(
            out,
            disp2,
            self.min_x1,
            self.max_x1,
            self.min_d,
            self.disp12_max_diff,
            self.invalid_scaled,
        );
    }
}

/// Winner-take-all index, or `None` when a non-adjacent disparity comes
/// within the uniqueness margin.
fn winner(lane: &[u32], uniqueness_ratio: u32) -> Option<usize> {
    let mut best = 0;
    for (d, &s) in lane.iter().enumerate() {
        if s < lane[best] {
            best = d;
        }
    }
    let min_s = lane[best] as u64;
    let keep = 100 - uniqueness_ratio as u64;
    let ambiguous = lane
        .iter()
        .enumerate()
        .any(|(d, &s)| (s as u64) * keep < min_s * 100 && d.abs_diff(best) > 1);
    (!ambiguous).then_some(best)
}

/// Parabolic refinement of the winner `d`, in 16x fixed point relative to
/// the first disparity of the range.
fn subpixel(lane: &[u32], d: usize) -> i32 {
    if d == 0 || d + 1 >= lane.len() {
        return d as i32 * DISP_SCALE;
    }
    let (sm, s0, sp) = (lane[d - 1] as i64, lane[d] as i64, lane[d + 1] as i64);
    let denom2 = (sm + sp - 2 * s0).max(1);
    let scale = DISP_SCALE as i64;
    (d as i64 * scale + ((sm - sp) * scale + denom2) / (denom2 * 2)) as i32
}

/// Invalidate pixels whose left and right winners disagree by more than
/// `max_diff` on both the floor and the ceiling of the sub-pixel disparity.
/// A negative `max_diff` disables the check.
fn left_right_check(
    row: &mut [i32],
    disp2: &[i32],
    min_x1: usize,
    max_x1: usize,
    min_d: i32,
    max_diff: i32,
    invalid_scaled: i32,
) {
    if max_diff < 0 {
        return;
    }
    let w = row.len() as i64;
    let consistent = |x2: i64, d: i32| {
        !(0..w).contains(&x2) || {
            let r = disp2[x2 as usize];
            r < min_d || (r - d).abs() <= max_diff
        }
    };
    for x in min_x1..max_x1 {
        let d1 = row[x];
        if d1 == invalid_scaled {
            continue;
        }
        let d_lo = d1.div_euclid(DISP_SCALE);
        let d_hi = (d1 + DISP_SCALE - 1).div_euclid(DISP_SCALE);
        if !consistent(x as i64 - d_lo as i64, d_lo) && !consistent(x as i64 - d_hi as i64, d_hi) {
            row[x] = invalid_scaled;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn texture(w: u32, h: u32, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..h).map(|_| (0..w).map(|_| rng.gen()).collect()).collect()
    }

    fn params(num_disparities: i32) -> SgbmParams {
        let block_size = 5;
        let (p1, p2) = default_penalties(block_size, 1);
        SgbmParams {
            num_disparities,
            block_size,
            p1,
            p2,
            ..SgbmParams::default()
        }
    }

    #[test]
    fn default_params_are_valid() {
        let p = SgbmParams::default();
        assert_eq!((p.p1, p.p2), (1944, 7776));
        assert!(SgbmMatcher::new(p).is_ok());
    }

    #[test]
    fn invalid_params_are_rejected() {
        let base = SgbmParams::default();
        let cases = [
            (
                SgbmParams {
                    num_disparities: 40,
                    ..base
                },
                SgbmError::InvalidNumDisparities(40),
            ),
            (
                SgbmParams {
                    num_disparities: 0,
                    ..base
                },
                SgbmError::InvalidNumDisparities(0),
            ),
            (SgbmParams { block_size: 8, ..base }, SgbmError::InvalidBlockSize(8)),
            (SgbmParams { block_size: 23, ..base }, SgbmError::InvalidBlockSize(23)),
            (
                SgbmParams {
                    p1: 100,
                    p2: 100,
                    ..base
                },
                SgbmError::InvalidPenalties { p1: 100, p2: 100 },
            ),
            (
                SgbmParams {
                    uniqueness_ratio: 100,
                    ..base
                },
                SgbmError::InvalidUniquenessRatio(100),
            ),
            (
                SgbmParams {
                    pre_filter_cap: 0,
                    ..base
                },
                SgbmError::InvalidPreFilterCap(0),
            ),
        ];
        for (p, err) in cases {
            assert_eq!(SgbmMatcher::new(p).unwrap_err(), err);
        }
    }

    #[test]
    fn params_parse_with_defaults() {
        let p: SgbmParams = serde_json::from_str(r#"{"num_disparities": 64, "mode": "eight_path"}"#).unwrap();
        assert_eq!(p.num_disparities, 64);
        assert_eq!(p.mode, SgbmMode::EightPath);
        assert_eq!(p.block_size, 9);
    }

    #[test]
    fn identical_images_give_zero_disparity() {
        let tex = texture(64, 40, 7);
        let img = GrayImage::from_fn(64, 40, |x, y| Luma([tex[y as usize][x as usize]]));
        let mut matcher = SgbmMatcher::new(params(16)).unwrap();
        let field = matcher.compute(&img, &img).unwrap();
        assert_eq!((field.width, field.height), (64, 40));
        let valid: Vec<f32> = field.data.iter().copied().filter(|&v| field.is_valid(v)).collect();
        assert!(valid.len() > (64 - 16) * 40 / 2, "only {} valid pixels", valid.len());
        assert!(valid.iter().all(|v| v.abs() < 0.5));
        // Columns left of the search range are never matched.
        for y in 0..40 {
            for x in 0..16 {
                assert_eq!(field.get(x, y), -1.0);
            }
        }
    }

    #[test]
    fn shifted_texture_recovers_shift() {
        let shift = 5;
        let tex = texture(80 + shift, 40, 11);
        let left = GrayImage::from_fn(80, 40, |x, y| Luma([tex[y as usize][x as usize]]));
        let right = GrayImage::from_fn(80, 40, |x, y| Luma([tex[y as usize][x as usize + shift as usize]]));
        for mode in [SgbmMode::ThreeWay, SgbmMode::FourPath, SgbmMode::EightPath] {
            let mut matcher = SgbmMatcher::new(SgbmParams { mode, ..params(16) }).unwrap();
            let field = matcher.compute(&left, &right).unwrap();
            let mut valid: Vec<f32> = field.data.iter().copied().filter(|&v| field.is_valid(v)).collect();
            assert!(valid.len() > (80 - 16) * 40 / 2, "{mode:?}: {} valid", valid.len());
            valid.sort_by(|a, b| a.total_cmp(b));
            let median = valid[valid.len() / 2];
            assert!((median - shift as f32).abs() <= 0.25, "{mode:?}: median {median}");
        }
    }

    #[test]
    fn rgb_matching_sums_channels() {
        let tex = texture(48, 24, 3);
        let img = RgbImage::from_fn(48, 24, |x, y| {
            let v = tex[y as usize][x as usize];
            Rgb([v, v.wrapping_mul(3), 255 - v])
        });
        let (p1, p2) = default_penalties(5, 3);
        let mut matcher = SgbmMatcher::new(SgbmParams {
            block_size: 5,
            p1,
            p2,
            num_disparities: 16,
            ..SgbmParams::default()
        })
        .unwrap();
        let field = matcher.compute_rgb(&img, &img).unwrap();
        assert!(field.valid_count() > 0);
        assert!(field.data.iter().filter(|&&v| field.is_valid(v)).all(|v| v.abs() < 0.5));
    }

    #[test]
    fn narrow_image_is_all_invalid() {
        let img = GrayImage::from_pixel(10, 10, Luma([100]));
        let field = SgbmMatcher::new(params(16)).unwrap().compute(&img, &img).unwrap();
        assert_eq!(field.valid_count(), 0);
    }

    #[test]
    fn mismatched_sizes_fail() {
        let a = GrayImage::new(32, 16);
        let b = GrayImage::new(32, 17);
        assert_eq!(
            SgbmMatcher::new(params(16)).unwrap().compute(&a, &b).unwrap_err(),
            SgbmError::SizeMismatch {
                left: (32, 16),
                right: (32, 17)
            }
        );
    }

    #[test]
    fn subpixel_fit_moves_towards_cheaper_neighbour() {
        assert_eq!(subpixel(&[10, 4, 10], 1), 16);
        assert!(subpixel(&[10, 4, 6], 1) > 16);
        assert!(subpixel(&[6, 4, 10], 1) < 16);
        assert_eq!(subpixel(&[1, 5, 9], 0), 0);
    }

    #[test]
    fn uniqueness_rejects_distant_runner_up() {
        assert_eq!(winner(&[100, 50, 52, 100], 10), Some(1));
        assert_eq!(winner(&[100, 50, 100, 52], 10), None);
        assert_eq!(winner(&[100, 50, 100, 80], 10), Some(1));
    }

    #[test]
    fn left_right_check_uses_disp12_max_diff() {
        let inv = -DISP_SCALE;
        // x = 5 sits at 3, x = 6 at 3.5, x = 7 at 2.
        let row = || {
            let mut r = vec![inv; 10];
            r[5..8].copy_from_slice(&[48, 56, 32]);
            r
        };
        let mut disp2 = vec![-1; 10];
        disp2[2] = 5;
        disp2[3] = 9;

        let mut strict = row();
        left_right_check(&mut strict, &disp2, 0, 10, 0, 1, inv);
        // x = 6 fails on its floor but its ceiling lands on x2 = 2 within 1.
        assert_eq!(&strict[5..8], &[inv, 56, 32]);

        let mut loose = row();
        left_right_check(&mut loose, &disp2, 0, 10, 0, 2, inv);
        assert_eq!(&loose[5..8], &[48, 56, 32]);

        disp2[2] = 9;
        let mut both_sides = row();
        left_right_check(&mut both_sides, &disp2, 0, 10, 0, 1, inv);
        assert_eq!(&both_sides[5..8], &[inv, inv, 32]);

        let mut disabled = row();
        left_right_check(&mut disabled, &disp2, 0, 10, 0, -1, inv);
        assert_eq!(disabled, row());
    }

    #[test]
    fn occluded_background_fails_left_right_check() {
        let (w, h) = (96u32, 32u32);
        let bg = texture(w + 16, h, 21);
        let fg = texture(w + 16, h, 22);
        // A foreground strip at left columns 40..60 with disparity 12 over a
        // background at disparity 3. Left columns 32..40 are hidden in the
        // right view.
        let left = GrayImage::from_fn(w, h, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Luma([if (40..60).contains(&x) { fg[y][x] } else { bg[y][x] }])
        });
        let right = GrayImage::from_fn(w, h, |x, y| {
            let (x, y) = (x as usize, y as usize);
            Luma([if (28..48).contains(&x) { fg[y][x + 12] } else { bg[y][x + 3] }])
        });
        let run = |disp12_max_diff| {
            SgbmMatcher::new(SgbmParams {
                uniqueness_ratio: 0,
                speckle_window_size: 0,
                disp12_max_diff,
                ..params(16)
            })
            .unwrap()
            .compute(&left, &right)
            .unwrap()
        };
        let valid_in = |field: &DisparityField, xs: std::ops::Range<u32>| {
            let total = xs.len() as f64 * h as f64;
            let valid = (0..h)
                .flat_map(|y| xs.clone().map(move |x| (x, y)))
                .filter(|&(x, y)| field.is_valid(field.get(x, y)))
                .count();
            valid as f64 / total
        };

        let unchecked = run(-1);
        assert_eq!(valid_in(&unchecked, 32..40), 1.0);

        let checked = run(1);
        let occluded = valid_in(&checked, 32..40);
        assert!(occluded < 0.5, "occluded band {occluded}");
        let strip = valid_in(&checked, 44..56);
        assert!(strip > 0.8, "foreground strip {strip}");
    }

    #[test]
    fn matcher_reuses_buffers_across_frame_sizes() {
        let pair = |w: u32, h: u32, seed: u64| {
            let tex = texture(w + 4, h, seed);
            let left = GrayImage::from_fn(w, h, |x, y| Luma([tex[y as usize][x as usize]]));
            let right = GrayImage::from_fn(w, h, |x, y| Luma([tex[y as usize][x as usize + 4]]));
            (left, right)
        };
        for mode in [SgbmMode::ThreeWay, SgbmMode::EightPath] {
            let mut reused = SgbmMatcher::new(SgbmParams { mode, ..params(16) }).unwrap();
            for (w, h, seed) in [(80, 40, 1), (48, 24, 2), (80, 40, 3)] {
                let (left, right) = pair(w, h, seed);
                let fresh = SgbmMatcher::new(*reused.params()).unwrap().compute(&left, &right).unwrap();
                assert_eq!(reused.compute(&left, &right).unwrap(), fresh, "{mode:?} {w}x{h}");
            }
        }
    }

    fn flat(tex: &[Vec<u8>]) -> Vec<u8> {
        tex.concat()
    }

    #[test]
    fn rolling_block_costs_match_direct_sums() {
        let (w, h) = (30usize, 12usize);
        let left = flat(&texture(w as u32, h as u32, 5));
        let right = flat(&texture(w as u32, h as u32, 6));
        let g = CostGeometry {
            w,
            h,
            cn: 1,
            min_x1: 16,
            w1: w - 16,
            nd: 16,
            min_d: 0,
            radius: 2,
            sources: [(left.as_slice(), right.as_slice(), 0), (left.as_slice(), right.as_slice(), 2)],
        };
        let stride = g.stride();
        let mut bounds = Default::default();
        let pix: Vec<Vec<u32>> = (0..h)
            .map(|y| {
                let mut row = vec![0; stride];
                g.pixel_costs(y, &mut row, &mut bounds);
                row
            })
            .collect();
        let r = g.radius as isize;
        let direct = |y: usize| {
            let mut out = vec![0u32; stride];
            for ky in -r..=r {
                let yy = (y as isize + ky).clamp(0, h as isize - 1) as usize;
                for xi in 0..g.w1 {
                    for kx in -r..=r {
                        let xx = (xi as isize + kx).clamp(0, g.w1 as isize - 1) as usize;
                        for d in 0..g.nd {
                            out[xi * g.nd + d] += pix[yy][xx * g.nd + d];
                        }
                    }
                }
            }
            out
        };

        let mut rows = CostRows::default();
        rows.reset(&g);
        let order: Vec<usize> = (0..h).chain((0..h).rev()).chain([5, 0, 11, 3, 4]).collect();
        for y in order {
            assert_eq!(rows.row(&g, y), direct(y).as_slice(), "row {y}");
        }
    }

    #[test]
    fn wide_blocks_do_not_saturate() {
        // Raw intensities 255 against 0 on three channels cost 3 * 63 per
        // pixel, summed over a 21x21 block.
        let (w, h, cn) = (40usize, 25usize, 3usize);
        let bright = vec![255u8; w * h * cn];
        let dark = vec![0u8; w * h * cn];
        let flat_sobel = vec![63u8; w * h * cn];
        let g = CostGeometry {
            w,
            h,
            cn,
            min_x1: 16,
            w1: w - 16,
            nd: 16,
            min_d: 0,
            radius: 10,
            sources: [(flat_sobel.as_slice(), flat_sobel.as_slice(), 0), (bright.as_slice(), dark.as_slice(), 2)],
        };
        let mut rows = CostRows::default();
        rows.reset(&g);
        let expected = 3 * 63 * 21 * 21;
        assert!(expected > u16::MAX as u32);
        for y in [0, 12, 24] {
            assert!(rows.row(&g, y).iter().all(|&c| c == expected), "row {y}");
        }
    }

    #[test]
    fn large_blocks_still_recover_shift() {
        let shift = 6;
        let tex = texture(96 + shift, 48, 17);
        let left = GrayImage::from_fn(96, 48, |x, y| Luma([tex[y as usize][x as usize]]));
        let right = GrayImage::from_fn(96, 48, |x, y| Luma([tex[y as usize][x as usize + shift as usize]]));
        let (p1, p2) = default_penalties(21, 1);
        let field = SgbmMatcher::new(SgbmParams {
            block_size: 21,
            p1,
            p2,
            num_disparities: 16,
            ..SgbmParams::default()
        })
        .unwrap()
        .compute(&left, &right)
        .unwrap();
        let mut valid: Vec<f32> = field.data.iter().copied().filter(|&v| field.is_valid(v)).collect();
        assert!(valid.len() > (96 - 16) * 48 / 2, "{} valid", valid.len());
        valid.sort_by(|a, b| a.total_cmp(b));
        assert!((valid[valid.len() / 2] - shift as f32).abs() <= 0.25);
    }
}
