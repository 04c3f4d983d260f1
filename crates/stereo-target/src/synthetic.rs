//! Ray-traced chessboard images for tests and demos.

use image::{GrayImage, Luma};
use stereo_core::{CameraModel, Iso3, Pt2, Real, TargetLayout};

const DARK: Real = 30.0;
const LIGHT: Real = 220.0;

/// Intensity of the board plane at target coordinates `(x, y)`.
///
/// Inner corners sit at `(col * s, row * s)`; the board has one extra square
/// on every side and lies on an infinite light background.
fn board_intensity(layout: &TargetLayout, x: Real, y: Real) -> Real {
    let s = layout.square_size;
    let a = (x / s).floor() as i64 + 1;
    let b = (y / s).floor() as i64 + 1;
    let inside = (0..=layout.cols as i64).contains(&a) && (0..=layout.rows as i64).contains(&b);
    if inside && (a + b) % 2 == 0 {
        DARK
    } else {
        LIGHT
    }
}

/// Render the board seen by `camera` under `cam_se3_target`, with
/// `supersample²` rays per pixel.
pub fn render_chessboard(
    camera: &CameraModel,
    cam_se3_target: &Iso3,
    layout: &TargetLayout,
    supersample: u32,
) -> GrayImage {
    let ss = supersample.max(1);
    let target_se3_cam = cam_se3_target.inverse();
    let origin = target_se3_cam.translation.vector;
    let rot = target_se3_cam.rotation;

    GrayImage::from_fn(camera.image_size.width, camera.image_size.height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..ss {
            for sx in 0..ss {
                let u = x as Real + (sx as Real + 0.5) / ss as Real - 0.5;
                let v = y as Real + (sy as Real + 0.5) / ss as Real - 0.5;
                let dir = rot * camera.backproject_pixel(&Pt2::new(u, v));
                let lambda = -origin.z / dir.z;
                acc += if dir.z.abs() > 1e-12 && lambda > 0.0 {
                    let p = origin + dir * lambda;
                    board_intensity(layout, p.x, p.y)
                } else {
                    LIGHT
                };
            }
        }
        Luma([(acc / (ss * ss) as Real).round() as u8])
    })
}
