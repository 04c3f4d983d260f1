//! Removal of small disconnected disparity blobs.

/// Reset every 4-connected region of at most `max_speckle_size` pixels to
/// `new_val`.
///
/// Two neighbours belong to the same region when both differ from `new_val`
/// and their values differ by at most `max_diff`. `data` is row-major with
/// `width * height` entries, normally 16x fixed-point disparities.
pub fn filter_speckles(
    data: &mut [i32],
    width: usize,
    height: usize,
    new_val: i32,
    max_speckle_size: usize,
    max_diff: i32,
) {
    debug_assert_eq!(data.len(), width * height);
    if max_speckle_size == 0 || data.is_empty() {
        return;
    }

    let mut labels = vec![0u32; data.len()];
    let mut next_label = 1u32;
    let mut stack = Vec::new();
    let mut region = Vec::new();

    for start in 0..data.len() {
        if data[start] == new_val || labels[start] != 0 {
            continue;
        }
        labels[start] = next_label;
        stack.push(start);
        region.clear();
        while let Some(p) = stack.pop() {
            region.push(p);
            let v = data[p];
            let (x, y) = (p % width, p / width);
            let mut visit = |q: usize| {
                let w = data[q];
                if w != new_val && labels[q] == 0 && (v - w).abs() <= max_diff {
                    labels[q] = next_label;
                    stack.push(q);
                }
            };
            if x + 1 < width {
                visit(p + 1);
            }
            if x > 0 {
                visit(p - 1);
            }
            if y + 1 < height {
                visit(p + width);
            }
            if y > 0 {
                visit(p - width);
            }
        }
        if region.len() <= max_speckle_size {
            for &p in &region {
                data[p] = new_val;
            }
        }
        next_label += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVALID: i32 = -16;

    #[test]
    fn small_island_is_reset() {
        let (w, h) = (12, 10);
        let mut data = vec![160; w * h];
        // 2x2 island at a very different disparity.
        for (x, y) in [(4, 4), (5, 4), (4, 5), (5, 5)] {
            data[y * w + x] = 800;
        }
        filter_speckles(&mut data, w, h, INVALID, 10, 16);
        for (x, y) in [(4, 4), (5, 4), (4, 5), (5, 5)] {
            assert_eq!(data[y * w + x], INVALID);
        }
        assert_eq!(data.iter().filter(|&&v| v == 160).count(), w * h - 4);
    }

    #[test]
    fn smooth_gradient_is_one_region() {
        let (w, h) = (8, 3);
        let mut data: Vec<i32> = (0..w * h).map(|i| (i % w) as i32 * 10).collect();
        let before = data.clone();
        filter_speckles(&mut data, w, h, INVALID, 20, 16);
        assert_eq!(data, before);
    }

    #[test]
    fn invalid_pixels_split_regions() {
        // Two 3-pixel runs separated by an invalid column.
        let mut data = vec![32, 32, 32, INVALID, 48, 48, 48];
        filter_speckles(&mut data, 7, 1, INVALID, 3, 16);
        assert!(data.iter().all(|&v| v == INVALID));
    }

    #[test]
    fn zero_window_disables_filter() {
        let mut data = vec![5, 900, 5];
        filter_speckles(&mut data, 3, 1, INVALID, 0, 1);
        assert_eq!(data, vec![5, 900, 5]);
    }
}
