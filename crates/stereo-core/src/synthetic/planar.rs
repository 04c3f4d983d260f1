//! Synthetic planar target helpers.
//!
//! Builds camera poses around a planar target and projects the target into
//! one or both cameras of a rig to produce observations with known ground truth.

use super::noise::UniformPixelNoise;
use crate::{
    CameraModel, CorrespondenceView, Iso3, PlanarTargetObservation, Pt2, Pt3, Real,
    StereoExtrinsics, TargetLayout,
};
use anyhow::{bail, Result};
use nalgebra::{Translation3, UnitQuaternion, Vector3};

/// Generate `n_views` poses (`cam_se3_target`) that tilt the board around both
/// in-plane axes while keeping it centred in front of the camera.
///
/// `center` is the target-frame point placed on the optical axis and `distance`
/// the nominal depth of that point.
pub fn poses_tilted(n_views: usize, center: Pt3, distance: Real) -> Vec<Iso3> {
    (0..n_views)
        .map(|i| {
            let phase = i as Real * 2.399_963; // golden angle
            let tilt = 0.15 + 0.25 * ((i % 4) as Real / 3.0);
            let roll = 0.1 * (phase * 0.5).sin();
            let rotation = UnitQuaternion::from_euler_angles(
                tilt * phase.cos(),
                tilt * phase.sin(),
                roll,
            );
            let shift = Vector3::new(
                0.08 * distance * (phase * 1.3).sin(),
                0.06 * distance * (phase * 0.7).cos(),
                distance * (1.0 + 0.15 * ((i % 3) as Real - 1.0)),
            );
            // Place `center` at `shift` in the camera frame.
            let translation = shift - rotation * center.coords;
            Iso3::from_parts(Translation3::from(translation), rotation)
        })
        .collect()
}

/// Project a planar target into the camera, requiring every point to be projectable.
pub fn project_view_all(
    camera: &CameraModel,
    cam_se3_target: &Iso3,
    target_points: &[Pt3],
) -> Result<CorrespondenceView> {
    let mut pixels = Vec::with_capacity(target_points.len());
    for (idx, pw) in target_points.iter().enumerate() {
        let pc = cam_se3_target.transform_point(pw);
        let Some(uv) = camera.project_point(&pc) else {
            bail!("point {idx} not projectable (z={:.6})", pc.z);
        };
        pixels.push(uv);
    }
    CorrespondenceView::new(target_points.to_vec(), pixels)
}

/// Project multiple views, requiring every point to be projectable in every view.
pub fn project_views_all(
    camera: &CameraModel,
    target_points: &[Pt3],
    cam_se3_target: &[Iso3],
) -> Result<Vec<CorrespondenceView>> {
    cam_se3_target
        .iter()
        .map(|pose| project_view_all(camera, pose, target_points))
        .collect()
}

/// Render stereo observations of `layout` for each left-camera pose.
///
/// Fails if a corner falls behind either camera or outside either image.
pub fn stereo_observations(
    left: &CameraModel,
    right: &CameraModel,
    extrinsics: &StereoExtrinsics,
    layout: &TargetLayout,
    left_se3_target: &[Iso3],
    noise: UniformPixelNoise,
) -> Result<Vec<PlanarTargetObservation>> {
    let object = layout.object_points();
    let right_se3_left = extrinsics.to_isometry();

    left_se3_target
        .iter()
        .enumerate()
        .map(|(view_idx, pose)| {
            let right_pose = right_se3_left * pose;
            let l = project_view_all(left, pose, &object)?;
            let r = project_view_all(right, &right_pose, &object)?;
            let in_image = |cam: &CameraModel, p: &Pt2| {
                p.x >= 0.0
                    && p.y >= 0.0
                    && p.x < cam.image_size.width as Real
                    && p.y < cam.image_size.height as Real
            };
            if !l.points_2d.iter().all(|p| in_image(left, p))
                || !r.points_2d.iter().all(|p| in_image(right, p))
            {
                bail!("view {view_idx}: target leaves the image");
            }
            let n = object.len();
            Ok(PlanarTargetObservation {
                left: l
                    .points_2d
                    .iter()
                    .enumerate()
                    .map(|(i, p)| noise.apply(view_idx, i, *p))
                    .collect(),
                right: r
                    .points_2d
                    .iter()
                    .enumerate()
                    .map(|(i, p)| noise.apply(view_idx, n + i, *p))
                    .collect(),
            })
        })
        .collect()
}
