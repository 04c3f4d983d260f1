//! Stereo extrinsics refinement with both camera models held fixed.
//!
//! Parameters: `right_se3_left` as a pose block followed by one
//! `left_se3_target` pose block per view. Each view contributes the left and
//! then the right reprojection residuals.

use crate::params::{pack_pose, pack_with_poses, unpack_pose, unpack_poses, POSE_DIM};
use crate::residual::{central_difference, pairwise_scales, point_errors, reprojection};
use crate::{Objective, Minimizer, OptimError, RobustKernel, SolveOptions, SolveReport};
use nalgebra::{DMatrix, DVector};
use stereo_core::{CameraModel, CorrespondenceView, Iso3, Real, ReprojectionStats, StereoExtrinsics};

#[derive(Debug, Clone)]
pub struct StereoExtrinsicsProblem {
    left: CameraModel,
    right: CameraModel,
    /// `(left, right)` observations of the same target points.
    views: Vec<(CorrespondenceView, CorrespondenceView)>,
    kernel: RobustKernel,
    offsets: Vec<usize>,
    residual_dim: usize,
}

impl StereoExtrinsicsProblem {
    pub fn new(
        left: CameraModel,
        right: CameraModel,
        left_views: Vec<CorrespondenceView>,
        right_views: Vec<CorrespondenceView>,
        kernel: RobustKernel,
    ) -> Result<Self, OptimError> {
        if left_views.is_empty() {
            return Err(OptimError::NoViews);
        }
        if left_views.len() != right_views.len() {
            return Err(OptimError::PoseCountMismatch {
                expected: left_views.len(),
                got: right_views.len(),
            });
        }
        let mut offsets = Vec::with_capacity(left_views.len());
        let mut rows = 0;
        for (view, (l, r)) in left_views.iter().zip(&right_views).enumerate() {
            if l.len() != r.len() {
                return Err(OptimError::PairMismatch {
                    view,
                    left: l.len(),
                    right: r.len(),
                });
            }
            if l.is_empty() {
                return Err(OptimError::TooFewPoints {
                    view,
                    count: 0,
                    required: 1,
                });
            }
            offsets.push(rows);
            rows += 4 * l.len();
        }
        Ok(Self {
            left,
            right,
            views: left_views.into_iter().zip(right_views).collect(),
            kernel,
            offsets,
            residual_dim: rows,
        })
    }

    pub fn num_views(&self) -> usize {
        self.views.len()
    }

    pub fn pack(&self, init: &StereoExtrinsics, left_poses: &[Iso3]) -> Result<DVector<Real>, OptimError> {
        if left_poses.len() != self.num_views() {
            return Err(OptimError::PoseCountMismatch {
                expected: self.num_views(),
                got: left_poses.len(),
            });
        }
        let mut head = [0.0; POSE_DIM];
        pack_pose(&init.to_isometry(), &mut head);
        Ok(pack_with_poses(&head, left_poses))
    }

    pub fn decode(&self, x: &DVector<Real>) -> Result<(StereoExtrinsics, Vec<Iso3>), OptimError> {
        if x.len() != self.num_params() {
            return Err(OptimError::ParamDim {
                expected: self.num_params(),
                got: x.len(),
            });
        }
        let right_se3_left = unpack_pose(&x.as_slice()[..POSE_DIM]);
        let poses = unpack_poses(x.as_slice(), POSE_DIM, self.num_views());
        Ok((StereoExtrinsics::from_isometry(&right_se3_left), poses))
    }

    fn view_residuals(&self, right_se3_left: &Iso3, left_pose: &Iso3, view: usize, out: &mut [Real]) {
        let (l, r) = &self.views[view];
        let n = 2 * l.len();
        reprojection(&self.left, left_pose, l, &mut out[..n]);
        reprojection(&self.right, &(right_se3_left * left_pose), r, &mut out[n..2 * n]);
    }

    /// Reprojection statistics for the left camera, the right camera and both.
    pub fn stats(&self, extrinsics: &StereoExtrinsics, left_poses: &[Iso3]) -> StereoReprojection {
        let right_se3_left = extrinsics.to_isometry();
        let mut left_err = Vec::new();
        let mut right_err = Vec::new();
        for ((l, r), pose) in self.views.iter().zip(left_poses) {
            left_err.extend(point_errors(&self.left, pose, l));
            right_err.extend(point_errors(&self.right, &(right_se3_left * pose), r));
        }
        let all: Vec<Real> = left_err.iter().chain(&right_err).copied().collect();
        StereoReprojection {
            left: ReprojectionStats::from_errors(&left_err),
            right: ReprojectionStats::from_errors(&right_err),
            combined: ReprojectionStats::from_errors(&all),
        }
    }
}

impl Objective for StereoExtrinsicsProblem {
    fn num_params(&self) -> usize {
        POSE_DIM * (1 + self.num_views())
    }

    fn num_residuals(&self) -> usize {
        self.residual_dim
    }

    fn raw_residuals(&self, x: &DVector<Real>) -> DVector<Real> {
        let right_se3_left = unpack_pose(&x.as_slice()[..POSE_DIM]);
        let mut r = DVector::zeros(self.residual_dim);
        for view in 0..self.num_views() {
            let start = self.offsets[view];
            let len = 4 * self.views[view].0.len();
            let base = POSE_DIM * (1 + view);
            let pose = unpack_pose(&x.as_slice()[base..base + POSE_DIM]);
            self.view_residuals(&right_se3_left, &pose, view, &mut r.as_mut_slice()[start..start + len]);
        }
        r
    }

    fn raw_jacobian(&self, x: &DVector<Real>) -> DMatrix<Real> {
        let mut j = DMatrix::zeros(self.residual_dim, self.num_params());

        for col in 0..POSE_DIM {
            central_difference(x, col, 0, self.residual_dim, &mut j, |xp, out| {
                out.copy_from_slice(self.raw_residuals(xp).as_slice());
            });
        }

        let right_se3_left = unpack_pose(&x.as_slice()[..POSE_DIM]);
        for view in 0..self.num_views() {
            let base = POSE_DIM * (1 + view);
            let len = 4 * self.views[view].0.len();
            for col in base..base + POSE_DIM {
                central_difference(x, col, self.offsets[view], len, &mut j, |xp, out| {
                    let pose = unpack_pose(&xp.as_slice()[base..base + POSE_DIM]);
                    self.view_residuals(&right_se3_left, &pose, view, out);
                });
            }
        }
        j
    }

    fn irls_scales(&self, r_unweighted: &DVector<Real>) -> DVector<Real> {
        pairwise_scales(self.kernel, r_unweighted)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StereoReprojection {
    pub left: ReprojectionStats,
    pub right: ReprojectionStats,
    pub combined: ReprojectionStats,
}

#[derive(Debug, Clone)]
pub struct StereoExtrinsicsEstimate {
    pub extrinsics: StereoExtrinsics,
    /// Refined `left_se3_target` per view.
    pub left_poses: Vec<Iso3>,
    pub stats: StereoReprojection,
    pub report: SolveReport,
}

/// Refine the left → right transform and the target poses.
pub fn refine_stereo_extrinsics<B: Minimizer>(
    backend: &B,
    problem: &StereoExtrinsicsProblem,
    init: &StereoExtrinsics,
    init_left_poses: &[Iso3],
    opts: &SolveOptions,
) -> Result<StereoExtrinsicsEstimate, OptimError> {
    let x0 = problem.pack(init, init_left_poses)?;
    let (x_opt, report) = backend.solve(problem, x0, opts);
    let (extrinsics, left_poses) = problem.decode(&x_opt)?;
    let stats = problem.stats(&extrinsics, &left_poses);
    Ok(StereoExtrinsicsEstimate {
        extrinsics,
        left_poses,
        stats,
        report,
    })
}
