//! Initial left → right transform from per-view board poses.
//!
//! Each view where both cameras see the board gives one estimate
//! `right_se3_left = right_se3_board * left_se3_board⁻¹`. Rotations are
//! averaged with the chordal mean (sum of matrices projected onto SO(3));
//! translations use the per-axis median, which tolerates a few bad views.

use anyhow::{ensure, Result};
use log::debug;
use stereo_core::{project_to_so3, Iso3, Mat3, Real, StereoExtrinsics, Vec3};

/// Combine per-view poses of the board in both cameras.
pub fn estimate_stereo_extrinsics(
    left_se3_board: &[Iso3],
    right_se3_board: &[Iso3],
) -> Result<StereoExtrinsics> {
    ensure!(
        left_se3_board.len() == right_se3_board.len(),
        "pose count mismatch: left={} right={}",
        left_se3_board.len(),
        right_se3_board.len()
    );
    ensure!(!left_se3_board.is_empty(), "need at least one view");

    let relative: Vec<Iso3> = left_se3_board
        .iter()
        .zip(right_se3_board)
        .map(|(l, r)| r * l.inverse())
        .collect();

    let rot_sum = relative
        .iter()
        .fold(Mat3::zeros(), |acc, t| acc + t.rotation.to_rotation_matrix().into_inner());
    let rotation = project_to_so3(&rot_sum).into_inner();

    let translation = Vec3::new(
        median(relative.iter().map(|t| t.translation.vector.x).collect()),
        median(relative.iter().map(|t| t.translation.vector.y).collect()),
        median(relative.iter().map(|t| t.translation.vector.z).collect()),
    );
    debug!(
        "stereo init from {} views: baseline {:.3}",
        relative.len(),
        translation.norm()
    );

    Ok(StereoExtrinsics::new(rotation, translation))
}

fn median(mut values: Vec<Real>) -> Real {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Translation3, UnitQuaternion};

    #[test]
    fn recovers_rig_transform_with_outlier() {
        let gt = Iso3::from_parts(
            Translation3::new(-60.0, 0.5, 1.0),
            UnitQuaternion::from_euler_angles(0.01, -0.02, 0.005),
        );
        let lefts: Vec<Iso3> = (0..5)
            .map(|i| {
                Iso3::from_parts(
                    Translation3::new(10.0 * i as Real, -5.0, 400.0 + 20.0 * i as Real),
                    UnitQuaternion::from_euler_angles(0.1 * i as Real, -0.05, 0.02),
                )
            })
            .collect();
        let mut rights: Vec<Iso3> = lefts.iter().map(|l| gt * l).collect();
        // One corrupted translation must not move the median.
        rights[2].translation.vector.x += 50.0;

        let extr = estimate_stereo_extrinsics(&lefts, &rights).unwrap();
        let gt_rot = gt.rotation.to_rotation_matrix().into_inner();
        assert!((extr.rotation - gt_rot).norm() < 1e-2);
        assert!((extr.translation.y - 0.5).abs() < 1e-6);
        assert!((extr.translation.x + 60.0).abs() < 1.0);
    }

    #[test]
    fn rejects_mismatched_counts() {
        assert!(estimate_stereo_extrinsics(&[Iso3::identity()], &[]).is_err());
    }
}
