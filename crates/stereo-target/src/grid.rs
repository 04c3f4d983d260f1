//! Grid graph construction and `(col, row)` labelling of corner candidates.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use stereo_core::{Pt2, Real, Vec2};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridParams {
    /// Maximum angle between a neighbour offset and a grid axis (degrees).
    pub axis_tolerance_deg: Real,
    /// Maximum neighbour distance relative to the local nearest-neighbour distance.
    pub max_spacing_ratio: Real,
}

impl Default for GridParams {
    fn default() -> Self {
        Self {
            axis_tolerance_deg: 25.0,
            max_spacing_ratio: 1.6,
        }
    }
}

/// Dominant two directions (radians in `[0, pi)`) of short corner-to-corner offsets.
fn grid_axes(points: &[Pt2]) -> Option<(Real, Real)> {
    const BINS: usize = 180;
    let mut hist = [0.0; BINS];
    for (i, p) in points.iter().enumerate() {
        let mut near: Vec<(Real, Vec2)> = points
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, q)| ((q - p).norm(), q - p))
            .collect();
        near.sort_by(|a, b| a.0.total_cmp(&b.0));
        for (_, d) in near.iter().take(4) {
            let angle = d.y.atan2(d.x).rem_euclid(std::f64::consts::PI);
            let bin = ((angle / std::f64::consts::PI * BINS as Real) as usize).min(BINS - 1);
            hist[bin] += 1.0;
        }
    }

    // Circular smoothing over +-3 degrees.
    let smooth: Vec<Real> = (0..BINS)
        .map(|b| (0..7).map(|k| hist[(b + BINS + k - 3) % BINS]).sum())
        .collect();
    let first = (0..BINS).max_by(|&a, &b| smooth[a].total_cmp(&smooth[b]))?;
    let circ_dist = |a: usize, b: usize| {
        let d = a.abs_diff(b);
        d.min(BINS - d)
    };
    let second = (0..BINS)
        .filter(|&b| circ_dist(b, first) >= 30)
        .max_by(|&a, &b| smooth[a].total_cmp(&smooth[b]))?;
    if smooth[second] <= 0.0 {
        return None;
    }
    let to_rad = |b: usize| (b as Real + 0.5) / BINS as Real * std::f64::consts::PI;
    Some((to_rad(first), to_rad(second)))
}

/// For each point, the nearest neighbour along `dir` within tolerance.
fn neighbour_along(points: &[Pt2], i: usize, dir: Vec2, nn: Real, params: &GridParams) -> Option<usize> {
    let cos_tol = params.axis_tolerance_deg.to_radians().cos();
    points
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != i)
        .filter_map(|(j, q)| {
            let d = q - points[i];
            let len = d.norm();
            (len > 0.0 && len <= params.max_spacing_ratio * nn && d.dot(&dir) / len >= cos_tol).then_some((j, len))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(j, _)| j)
}

/// Label `points` as a `cols × rows` grid and return them in row-major order.
///
/// Returns `None` when no connected component matches the expected size.
pub(crate) fn label_grid(points: &[Pt2], cols: usize, rows: usize, params: &GridParams) -> Option<Vec<Pt2>> {
    if points.len() < cols * rows {
        return None;
    }
    let (a0, a1) = grid_axes(points)?;
    let axes = [Vec2::new(a0.cos(), a0.sin()), Vec2::new(a1.cos(), a1.sin())];

    let nn: Vec<Real> = points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            points
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, q)| (q - p).norm())
                .fold(Real::MAX, Real::min)
        })
        .collect();

    // links[i][k]: neighbour along +axes[0], -axes[0], +axes[1], -axes[1].
    let candidate = |i: usize, k: usize| {
        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
        neighbour_along(points, i, axes[k / 2] * sign, nn[i], params)
    };
    let links: Vec<[Option<usize>; 4]> = (0..points.len())
        .map(|i| [candidate(i, 0), candidate(i, 1), candidate(i, 2), candidate(i, 3)])
        .collect();
    // Keep mutual links only.
    let mutual = |i: usize, k: usize| {
        links[i][k].filter(|&j| links[j][k ^ 1] == Some(i))
    };

    let mut visited = vec![false; points.len()];
    let mut best: Option<HashMap<(i64, i64), usize>> = None;
    for start in 0..points.len() {
        if visited[start] {
            continue;
        }
        let mut labels: HashMap<(i64, i64), usize> = HashMap::new();
        let mut coord_of: HashMap<usize, (i64, i64)> = HashMap::new();
        let mut consistent = true;
        let mut queue = VecDeque::from([start]);
        visited[start] = true;
        labels.insert((0, 0), start);
        coord_of.insert(start, (0, 0));
        while let Some(i) = queue.pop_front() {
            let (u, v) = coord_of[&i];
            for k in 0..4 {
                let Some(j) = mutual(i, k) else { continue };
                let step = if k % 2 == 0 { 1 } else { -1 };
                let c = if k < 2 { (u + step, v) } else { (u, v + step) };
                match coord_of.get(&j) {
                    Some(&cj) => consistent &= cj == c,
                    None => {
                        if labels.contains_key(&c) {
                            consistent = false;
                            continue;
                        }
                        visited[j] = true;
                        labels.insert(c, j);
                        coord_of.insert(j, c);
                        queue.push_back(j);
                    }
                }
            }
        }
        if consistent && labels.len() == cols * rows && best.as_ref().map_or(true, |b| b.len() < labels.len()) {
            best = Some(labels);
        }
    }
    let labels = best?;

    let (umin, umax, vmin, vmax) = labels.keys().fold(
        (i64::MAX, i64::MIN, i64::MAX, i64::MIN),
        |(a, b, c, d), &(u, v)| (a.min(u), b.max(u), c.min(v), d.max(v)),
    );
    let (w, h) = ((umax - umin + 1) as usize, (vmax - vmin + 1) as usize);
    let pos = |u: i64, v: i64| labels.get(&(u, v)).map(|&i| points[i]);

    // Mean image step along each labelled axis.
    let mean_step = |du: i64, dv: i64| {
        let mut acc = Vec2::zeros();
        for (&(u, v), &i) in &labels {
            if let Some(q) = pos(u + du, v + dv) {
                acc += q - points[i];
            }
        }
        acc
    };
    let step_u = mean_step(1, 0);
    let step_v = mean_step(0, 1);

    // Pick which labelled axis runs along the columns.
    let u_is_cols = if w == cols && h == rows && cols != rows {
        true
    } else if w == rows && h == cols && cols != rows {
        false
    } else if w == cols && h == rows {
        step_u.x.abs() >= step_v.x.abs()
    } else {
        return None;
    };
    let (col_step, row_step) = if u_is_cols { (step_u, step_v) } else { (step_v, step_u) };
    let positive = |s: Vec2| if s.x.abs() >= s.y.abs() { s.x > 0.0 } else { s.y > 0.0 };
    let flip_col = !positive(col_step);
    let flip_row = !positive(row_step);

    let mut out = Vec::with_capacity(cols * rows);
    for r in 0..rows as i64 {
        for c in 0..cols as i64 {
            let c = if flip_col { cols as i64 - 1 - c } else { c };
            let r = if flip_row { rows as i64 - 1 - r } else { r };
            let (u, v) = if u_is_cols { (umin + c, vmin + r) } else { (umin + r, vmin + c) };
            out.push(pos(u, v)?);
        }
    }
    Some(out)
}
