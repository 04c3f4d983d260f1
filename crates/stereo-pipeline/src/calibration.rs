//! Stereo calibration from chessboard image pairs.
//!
//! Steps, in order:
//! 1. detect the board in both images of every pair, skipping pairs where
//!    either side fails;
//! 2. per camera: iterative linear intrinsics, homography poses, then LM over
//!    intrinsics + distortion + poses;
//! 3. stereo: chordal-mean/median initial transform, then LM over the
//!    transform and left-target poses with both cameras fixed;
//! 4. Bouguet rectification and remap tables.

use crate::bundle::{CalibrationBundle, CameraPair};
use crate::quality::{FitStage, QualityWarning, EXCELLENT_STEREO_RMS, MAX_REPROJECTION_RMS};
use image::GrayImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use stereo_core::{
    CameraModel, CorrespondenceView, ImageSize, Iso3, PlanarTargetObservation, ReprojectionStats,
    StereoDataset, StereoExtrinsics, TargetLayout,
};
use stereo_depth::{RectificationMaps, RemapError};
use stereo_linear::prelude::*;
use stereo_linear::rectify::RectifyError;
use stereo_optim::planar_intrinsics::{refine_planar_intrinsics, PlanarIntrinsicsEstimate, PlanarIntrinsicsProblem};
use stereo_optim::stereo_extrinsics::{refine_stereo_extrinsics, StereoExtrinsicsProblem};
use stereo_optim::{LmBackend, OptimError, RobustKernel, SolveOptions};
use stereo_target::{ChessboardDetector, ChessboardParams};
use thiserror::Error;

/// Below this many valid pairs the result is flagged as possibly suboptimal.
pub const GOOD_PAIR_COUNT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub layout: TargetLayout,
    /// Hard minimum; never below 3.
    pub min_valid_pairs: usize,
    pub recommended_pairs: usize,
    /// Rectification crop: 0 = valid pixels only, 1 = full frame.
    pub alpha: f64,
    pub zero_disparity: bool,
    pub robust: RobustKernel,
    /// Distortion/intrinsics alternations of the linear initialization.
    pub init_iterations: usize,
    pub max_iters: usize,
    /// Fixed-point steps used when undistorting through the fitted lens.
    pub undistort_iters: u32,
    pub detector: ChessboardParams,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            layout: TargetLayout::default(),
            min_valid_pairs: 3,
            recommended_pairs: 10,
            alpha: 0.0,
            zero_disparity: true,
            robust: RobustKernel::None,
            init_iterations: 2,
            max_iters: 100,
            undistort_iters: 20,
            detector: ChessboardParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraSide {
    Left,
    Right,
}

/// Which image(s) of a pair could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairSide {
    Left,
    Right,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedPair {
    pub index: usize,
    pub side: PairSide,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("no valid chessboard pairs among {total} input pairs")]
    NoValidPairs { total: usize },
    #[error("only {valid} of {total} pairs are valid, need at least {required}")]
    NotEnoughPairs {
        valid: usize,
        required: usize,
        total: usize,
    },
    #[error("invalid calibration config: {0}")]
    InvalidConfig(String),
    #[error("found {left} left images but {right} right images")]
    PairCountMismatch { left: usize, right: usize },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{camera:?} camera initialization failed: {message}")]
    Initialization { camera: CameraSide, message: String },
    #[error(transparent)]
    Optim(#[from] OptimError),
    #[error("{stage:?} refinement did not converge ({termination})")]
    SolverDidNotConverge { stage: FitStage, termination: String },
    #[error(transparent)]
    Rectify(#[from] RectifyError),
    #[error(transparent)]
    Remap(#[from] RemapError),
}

/// Everything a stereo calibration produces.
#[derive(Debug, Clone)]
pub struct StereoCalibration {
    pub left: CameraModel,
    pub right: CameraModel,
    pub extrinsics: StereoExtrinsics,
    pub left_stats: ReprojectionStats,
    pub right_stats: ReprojectionStats,
    /// Combined left + right residuals of the stereo fit.
    pub stereo_stats: ReprojectionStats,
    pub geometry: stereo_core::RectificationGeometry,
    pub maps: RectificationMaps,
    pub valid_pairs: usize,
    pub total_pairs: usize,
    pub skipped: Vec<SkippedPair>,
    pub warnings: Vec<QualityWarning>,
}

impl StereoCalibration {
    pub fn bundle(&self) -> CalibrationBundle {
        CalibrationBundle::new(
            &self.geometry,
            &self.maps,
            Some(CameraPair {
                left: self.left,
                right: self.right,
            }),
            Some(&self.extrinsics),
        )
    }
}

/// Detected observations plus what was rejected on the way.
#[derive(Debug, Clone)]
pub struct Detections {
    pub image_size: Option<ImageSize>,
    pub observations: Vec<PlanarTargetObservation>,
    pub skipped: Vec<SkippedPair>,
    pub total: usize,
}

#[derive(Debug, Clone)]
pub struct StereoCalibrator {
    config: CalibrationConfig,
}

impl StereoCalibrator {
    pub fn new(config: CalibrationConfig) -> Result<Self, CalibrationError> {
        if config.min_valid_pairs < 3 {
            return Err(CalibrationError::InvalidConfig(format!(
                "min_valid_pairs must be >= 3, got {}",
                config.min_valid_pairs
            )));
        }
        if config.layout.cols < 2 || config.layout.rows < 2 || config.layout.square_size <= 0.0 {
            return Err(CalibrationError::InvalidConfig(format!(
                "bad target layout {:?}",
                config.layout
            )));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Detect the board in every pair; failing pairs are recorded, not fatal.
    pub fn detect(&self, pairs: &[(GrayImage, GrayImage)]) -> Detections {
        let detector = ChessboardDetector::new(&self.config.layout).with_params(self.config.detector);
        let mut image_size: Option<ImageSize> = None;
        let mut observations = Vec::new();
        let mut skipped = Vec::new();

        for (index, (left, right)) in pairs.iter().enumerate() {
            if left.dimensions() != right.dimensions() {
                skipped.push(SkippedPair {
                    index,
                    side: PairSide::Both,
                    reason: format!("image sizes differ: {:?} vs {:?}", left.dimensions(), right.dimensions()),
                });
                continue;
            }
            let size = ImageSize::new(left.width(), left.height());
            if let Some(expected) = image_size.filter(|s| *s != size) {
                skipped.push(SkippedPair {
                    index,
                    side: PairSide::Both,
                    reason: format!("expected {}x{} frames", expected.width, expected.height),
                });
                continue;
            }

            let (side, reason) = match (detector.detect(left), detector.detect(right)) {
                (Ok(l), Ok(r)) => {
                    debug!("pair {index}: board found in both images");
                    image_size = Some(size);
                    observations.push(PlanarTargetObservation {
                        left: l.corners,
                        right: r.corners,
                    });
                    continue;
                }
                (Err(e), Ok(_)) => (PairSide::Left, e.to_string()),
                (Ok(_), Err(e)) => (PairSide::Right, e.to_string()),
                (Err(a), Err(b)) => (PairSide::Both, format!("left: {a}; right: {b}")),
            };
            warn!("pair {index}: skipped ({side:?}): {reason}");
            skipped.push(SkippedPair { index, side, reason });
        }

        info!("{} of {} pairs valid", observations.len(), pairs.len());
        Detections {
            image_size,
            observations,
            skipped,
            total: pairs.len(),
        }
    }

    pub fn calibrate_images(&self, pairs: &[(GrayImage, GrayImage)]) -> Result<StereoCalibration, CalibrationError> {
        let detections = self.detect(pairs);
        let Some(image_size) = detections.image_size else {
            return Err(CalibrationError::NoValidPairs {
                total: detections.total,
            });
        };
        let dataset = StereoDataset {
            layout: self.config.layout,
            image_size,
            observations: detections.observations,
        };
        self.calibrate_inner(&dataset, detections.total, detections.skipped)
    }

    /// Calibrate from already detected observations.
    pub fn calibrate_dataset(&self, dataset: &StereoDataset) -> Result<StereoCalibration, CalibrationError> {
        self.calibrate_inner(dataset, dataset.len(), Vec::new())
    }

    /// Load `left_*.png` / `right_*.png` from `dir` and calibrate.
    ///
    /// Pairs whose images cannot be decoded are skipped like failed detections.
    pub fn calibrate_dir(&self, dir: &Path) -> Result<StereoCalibration, CalibrationError> {
        let (lefts, rights) = discover_pairs(dir)?;
        let (indices, images, unreadable) = load_pairs(&lefts, &rights);
        let mut detections = self.detect(&images);
        for skip in &mut detections.skipped {
            skip.index = indices[skip.index];
        }
        detections.skipped.extend(unreadable);
        detections.skipped.sort_by_key(|s| s.index);
        detections.total = lefts.len();

        let Some(image_size) = detections.image_size else {
            return Err(CalibrationError::NoValidPairs {
                total: detections.total,
            });
        };
        let dataset = StereoDataset {
            layout: self.config.layout,
            image_size,
            observations: detections.observations,
        };
        self.calibrate_inner(&dataset, detections.total, detections.skipped)
    }

    fn calibrate_inner(
        &self,
        dataset: &StereoDataset,
        total: usize,
        skipped: Vec<SkippedPair>,
    ) -> Result<StereoCalibration, CalibrationError> {
        let valid = dataset.len();
        if valid == 0 {
            return Err(CalibrationError::NoValidPairs { total });
        }
        if valid < self.config.min_valid_pairs {
            return Err(CalibrationError::NotEnoughPairs {
                valid,
                required: self.config.min_valid_pairs,
                total,
            });
        }

        let mut warnings = Vec::new();
        if valid < self.config.recommended_pairs {
            warn!(
                "only {valid} valid pairs, {} or more recommended",
                self.config.recommended_pairs
            );
            warnings.push(QualityWarning::FewPairs {
                valid,
                recommended: self.config.recommended_pairs,
            });
        } else if valid < GOOD_PAIR_COUNT {
            warn!("{valid} valid pairs, calibration may be suboptimal");
            warnings.push(QualityWarning::FewPairs {
                valid,
                recommended: GOOD_PAIR_COUNT,
            });
        }

        let size = dataset.image_size;
        let left_views = dataset.left_views();
        let right_views = dataset.right_views();

        let left = self.fit_camera(CameraSide::Left, left_views.clone(), size)?;
        self.check_rms(FitStage::Left, left.stats.rms, &mut warnings);
        let right = self.fit_camera(CameraSide::Right, right_views.clone(), size)?;
        self.check_rms(FitStage::Right, right.stats.rms, &mut warnings);

        let init = estimate_stereo_extrinsics(&left.poses, &right.poses).map_err(|e| {
            CalibrationError::Initialization {
                camera: CameraSide::Right,
                message: e.to_string(),
            }
        })?;
        debug!("initial baseline {:.3}", init.baseline());

        let problem = StereoExtrinsicsProblem::new(left.camera, right.camera, left_views, right_views, self.config.robust)?;
        let stereo = refine_stereo_extrinsics(&LmBackend, &problem, &init, &left.poses, &self.solve_options())?;
        if !stereo.report.converged {
            return Err(CalibrationError::SolverDidNotConverge {
                stage: FitStage::Stereo,
                termination: stereo.report.termination,
            });
        }
        let stereo_rms = stereo.stats.combined.rms;
        if stereo_rms < EXCELLENT_STEREO_RMS {
            info!("stereo RMS {stereo_rms:.4} px: excellent");
        }
        self.check_rms(FitStage::Stereo, stereo_rms, &mut warnings);
        info!(
            "baseline {:.3} (T = [{:.3}, {:.3}, {:.3}])",
            stereo.extrinsics.baseline(),
            stereo.extrinsics.translation.x,
            stereo.extrinsics.translation.y,
            stereo.extrinsics.translation.z
        );

        let geometry = stereo_rectify(
            &left.camera,
            &right.camera,
            &stereo.extrinsics,
            &RectifyOptions {
                alpha: self.config.alpha,
                zero_disparity: self.config.zero_disparity,
            },
        )?;
        let maps = RectificationMaps::build(&left.camera, &right.camera, &geometry)?;

        Ok(StereoCalibration {
            left: left.camera,
            right: right.camera,
            extrinsics: stereo.extrinsics,
            left_stats: left.stats,
            right_stats: right.stats,
            stereo_stats: stereo.stats.combined,
            geometry,
            maps,
            valid_pairs: valid,
            total_pairs: total,
            skipped,
            warnings,
        })
    }

    fn solve_options(&self) -> SolveOptions {
        SolveOptions {
            max_iters: self.config.max_iters,
            ..SolveOptions::default()
        }
    }

    fn fit_camera(
        &self,
        side: CameraSide,
        views: Vec<CorrespondenceView>,
        size: ImageSize,
    ) -> Result<PlanarIntrinsicsEstimate, CalibrationError> {
        let init_error = |message: String| CalibrationError::Initialization { camera: side, message };

        let linear = IterativeIntrinsicsSolver::estimate(
            &views,
            IterativeIntrinsicsOptions {
                iterations: self.config.init_iterations,
                ..IterativeIntrinsicsOptions::default()
            },
        )
        .map_err(|e| init_error(e.to_string()))?;
        let mut distortion = linear.distortion;
        distortion.iters = self.config.undistort_iters;
        let init_camera = CameraModel::new(size, linear.intrinsics, distortion);

        let k = linear.intrinsics.k_matrix();
        let init_poses = views
            .iter()
            .map(|v| {
                let h = HomographySolver::dlt(&v.planar_points(), &v.points_2d).map_err(|e| init_error(e.to_string()))?;
                PlanarPoseSolver::from_homography(&k, &h).map_err(|e| init_error(e.to_string()))
            })
            .collect::<Result<Vec<Iso3>, _>>()?;

        let problem = PlanarIntrinsicsProblem::new(views, size, self.config.robust)?;
        let est = refine_planar_intrinsics(&LmBackend, &problem, &init_camera, &init_poses, &self.solve_options())?;
        if !est.report.converged {
            warn!("{side:?} camera refinement stopped early: {}", est.report.termination);
        }
        info!(
            "{side:?} camera: fx={:.2} fy={:.2} cx={:.2} cy={:.2}, RMS {:.4} px",
            est.camera.k.fx, est.camera.k.fy, est.camera.k.cx, est.camera.k.cy, est.stats.rms
        );
        Ok(est)
    }

    fn check_rms(&self, stage: FitStage, rms: f64, warnings: &mut Vec<QualityWarning>) {
        if rms > MAX_REPROJECTION_RMS {
            warn!("{stage:?} reprojection RMS {rms:.3} px is high");
            warnings.push(QualityWarning::HighReprojectionError { stage, rms });
        }
    }
}

/// Sorted `left_*.png` and `right_*.png` paths in `dir`.
pub fn discover_pairs(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>), CalibrationError> {
    let io_err = |source| CalibrationError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut lefts = Vec::new();
    let mut rights = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".png") {
            continue;
        }
        if name.starts_with("left_") {
            lefts.push(path);
        } else if name.starts_with("right_") {
            rights.push(path);
        }
    }
    lefts.sort();
    rights.sort();
    if lefts.len() != rights.len() {
        return Err(CalibrationError::PairCountMismatch {
            left: lefts.len(),
            right: rights.len(),
        });
    }
    Ok((lefts, rights))
}

/// Decode every pair, keeping each pair's position in the listing. Pairs with
/// an undecodable side are reported as skipped.
fn load_pairs(lefts: &[PathBuf], rights: &[PathBuf]) -> (Vec<usize>, Vec<(GrayImage, GrayImage)>, Vec<SkippedPair>) {
    let mut indices = Vec::with_capacity(lefts.len());
    let mut images = Vec::with_capacity(lefts.len());
    let mut unreadable = Vec::new();
    for (index, (l, r)) in lefts.iter().zip(rights).enumerate() {
        match (load_gray(l), load_gray(r)) {
            (Ok(a), Ok(b)) => {
                indices.push(index);
                images.push((a, b));
            }
            (a, b) => {
                let side = match (a.is_err(), b.is_err()) {
                    (true, true) => PairSide::Both,
                    (true, false) => PairSide::Left,
                    _ => PairSide::Right,
                };
                let reason = a.err().or(b.err()).map(|e| e.to_string()).unwrap_or_default();
                warn!("pair {index}: could not load images: {reason}");
                unreadable.push(SkippedPair { index, side, reason });
            }
        }
    }
    (indices, images, unreadable)
}

fn load_gray(path: &Path) -> Result<GrayImage, CalibrationError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|source| CalibrationError::Image {
            path: path.to_path_buf(),
            source,
        })
}
