//! Single-camera refinement: intrinsics, distortion and per-view target poses.
//!
//! Parameter layout: camera block (9, see [`crate::params`]) followed by one
//! pose block (6) per view. Residuals are pixel reprojection errors, two rows
//! per target point.

use crate::params::{
    pack_camera, pack_with_poses, unpack_camera, unpack_pose, unpack_poses, CAMERA_DIM, POSE_DIM,
};
use crate::residual::{central_difference, pairwise_scales, point_errors, reprojection};
use crate::{Objective, Minimizer, OptimError, RobustKernel, SolveOptions, SolveReport};
use nalgebra::{DMatrix, DVector};
use stereo_core::{CameraModel, CorrespondenceView, ImageSize, Iso3, Real, ReprojectionStats};

/// Minimum points per view (a homography needs four).
const MIN_POINTS: usize = 4;

#[derive(Debug, Clone)]
pub struct PlanarIntrinsicsProblem {
    views: Vec<CorrespondenceView>,
    image_size: ImageSize,
    kernel: RobustKernel,
    /// First residual row of each view.
    offsets: Vec<usize>,
    residual_dim: usize,
    undistort_iters: u32,
}

impl PlanarIntrinsicsProblem {
    pub fn new(
        views: Vec<CorrespondenceView>,
        image_size: ImageSize,
        kernel: RobustKernel,
    ) -> Result<Self, OptimError> {
        if views.is_empty() {
            return Err(OptimError::NoViews);
        }
        let mut offsets = Vec::with_capacity(views.len());
        let mut rows = 0;
        for (view, v) in views.iter().enumerate() {
            if v.len() < MIN_POINTS {
                return Err(OptimError::TooFewPoints {
                    view,
                    count: v.len(),
                    required: MIN_POINTS,
                });
            }
            offsets.push(rows);
            rows += 2 * v.len();
        }
        Ok(Self {
            views,
            image_size,
            kernel,
            offsets,
            residual_dim: rows,
            undistort_iters: 8,
        })
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    /// Pack an initial camera and `cam_se3_target` poses.
    pub fn pack(&self, camera: &CameraModel, poses: &[Iso3]) -> Result<DVector<Real>, OptimError> {
        if poses.len() != self.num_views() {
            return Err(OptimError::PoseCountMismatch {
                expected: self.num_views(),
                got: poses.len(),
            });
        }
        let mut head = [0.0; CAMERA_DIM];
        pack_camera(camera, &mut head);
        Ok(pack_with_poses(&head, poses))
    }

    pub fn decode(&self, x: &DVector<Real>) -> Result<(CameraModel, Vec<Iso3>), OptimError> {
        if x.len() != self.num_params() {
            return Err(OptimError::ParamDim {
                expected: self.num_params(),
                got: x.len(),
            });
        }
        Ok(self.decode_unchecked(x))
    }

    fn decode_unchecked(&self, x: &DVector<Real>) -> (CameraModel, Vec<Iso3>) {
        let camera = unpack_camera(&x.as_slice()[..CAMERA_DIM], self.image_size, self.undistort_iters);
        let poses = unpack_poses(x.as_slice(), CAMERA_DIM, self.num_views());
        (camera, poses)
    }

    /// Per-point reprojection statistics over all views.
    pub fn stats(&self, camera: &CameraModel, poses: &[Iso3]) -> ReprojectionStats {
        let errors: Vec<Real> = self
            .views
            .iter()
            .zip(poses)
            .flat_map(|(v, pose)| point_errors(camera, pose, v))
            .collect();
        ReprojectionStats::from_errors(&errors)
    }

    fn view_rows(&self, view: usize) -> usize {
        2 * self.views[view].len()
    }
}

impl Objective for PlanarIntrinsicsProblem {
    fn num_params(&self) -> usize {
        CAMERA_DIM + POSE_DIM * self.num_views()
    }

    fn num_residuals(&self) -> usize {
        self.residual_dim
    }

    fn raw_residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        let (camera, poses) = self.decode_unchecked(x);
        let mut r = DVector::zeros(self.residual_dim);
        for (i, view) in self.views.iter().enumerate() {
            let start = self.offsets[i];
            reprojection(&camera, &poses[i], view, &mut r.as_mut_slice()[start..start + 2 * view.len()]);
        }
        r
    }

    fn raw_jacobian(&self, x: &DVector<Real>) -> DMatrix<Real> {
        let mut j = DMatrix::zeros(self.residual_dim, self.num_params());

        // Camera parameters touch every row.
        for col in 0..CAMERA_DIM {
            central_difference(x, col, 0, self.residual_dim, &mut j, |xp, out| {
                out.copy_from_slice(self.raw_residuals(xp).as_slice());
            });
        }

        // A pose only touches the rows of its own view.
        let (camera, _) = self.decode_unchecked(x);
        for (view_idx, view) in self.views.iter().enumerate() {
            let base = CAMERA_DIM + POSE_DIM * view_idx;
            for col in base..base + POSE_DIM {
                central_difference(
                    x,
                    col,
                    self.offsets[view_idx],
                    self.view_rows(view_idx),
                    &mut j,
                    |xp, out| {
                        let pose = unpack_pose(&xp.as_slice()[base..base + POSE_DIM]);
                        reprojection(&camera, &pose, view, out);
                    },
                );
            }
        }
        j
    }

    fn irls_scales(&self, r_unweighted: &DVector<Real>) -> DVector<Real> {
        pairwise_scales(self.kernel, r_unweighted)
    }
}

/// Result of [`refine_planar_intrinsics`].
#[derive(Debug, Clone)]
pub struct PlanarIntrinsicsEstimate {
    pub camera: CameraModel,
    /// Refined `cam_se3_target` per view.
    pub poses: Vec<Iso3>,
    pub stats: ReprojectionStats,
    pub report: SolveReport,
}

/// Refine camera intrinsics, distortion and per-view poses from an initial guess.
pub fn refine_planar_intrinsics<B: Minimizer>(
    backend: &B,
    problem: &PlanarIntrinsicsProblem,
    init_camera: &CameraModel,
    init_poses: &[Iso3],
    opts: &SolveOptions,
) -> Result<PlanarIntrinsicsEstimate, OptimError> {
    let mut problem = problem.clone();
    problem.undistort_iters = init_camera.dist.iters;
    let x0 = problem.pack(init_camera, init_poses)?;
    let (x_opt, report) = backend.solve(&problem, x0, opts);
    let (camera, poses) = problem.decode(&x_opt)?;
    let stats = problem.stats(&camera, &poses);
    Ok(PlanarIntrinsicsEstimate {
        camera,
        poses,
        stats,
        report,
    })
}
