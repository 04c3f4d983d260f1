//! Calibration and rectification quality checks.

use crate::rig::StereoRig;
use image::{imageops, GrayImage, Rgb, RgbImage};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use stereo_core::Real;
use stereo_depth::{default_penalties, DisparityField, SgbmError, SgbmMatcher, SgbmParams};

/// Reprojection RMS above which a stage is reported (pixels).
pub const MAX_REPROJECTION_RMS: Real = 1.0;
/// Stereo RMS below which the calibration is logged as excellent.
pub const EXCELLENT_STEREO_RMS: Real = 0.5;

pub const EXCELLENT_ROW_CORRELATION: f64 = 0.7;
pub const MODERATE_ROW_CORRELATION: f64 = 0.5;
pub const GOOD_COVERAGE: f64 = 0.4;
pub const MODERATE_COVERAGE: f64 = 0.2;

/// Which fit a reprojection figure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStage {
    Left,
    Right,
    Stereo,
}

/// Non-fatal findings, logged when raised and returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityWarning {
    /// Fewer valid pairs than `recommended`.
    FewPairs { valid: usize, recommended: usize },
    HighReprojectionError { stage: FitStage, rms: Real },
    LowRowCorrelation { correlation: f64 },
    LowDisparityCoverage { coverage: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Good,
    Moderate,
    Poor,
}

/// Mean Pearson correlation of sampled rectified rows.
///
/// Samples every `h / 24` rows between `5h / 24` and `5h / 6` (rows 100..400
/// step 20 at 480 lines). Rows with no intensity variation are skipped.
/// `None` when no row could be evaluated.
pub fn row_correlation(left: &GrayImage, right: &GrayImage) -> Option<f64> {
    let h = left.height().min(right.height());
    let w = left.width().min(right.width()) as usize;
    let step = (h / 24).max(1) as usize;
    let mut values = Vec::new();
    for y in (h * 5 / 24..h * 5 / 6).step_by(step) {
        let a = &left.as_raw()[(y as usize * left.width() as usize)..][..w];
        let b = &right.as_raw()[(y as usize * right.width() as usize)..][..w];
        if let Some(c) = pearson(a, b) {
            values.push(c);
        }
    }
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn pearson(a: &[u8], b: &[u8]) -> Option<f64> {
    let n = a.len() as f64;
    if a.is_empty() {
        return None;
    }
    let ma = a.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mb = b.iter().map(|&v| v as f64).sum::<f64>() / n;
    let (mut sab, mut saa, mut sbb) = (0.0, 0.0, 0.0);
    for (&x, &y) in a.iter().zip(b) {
        let (dx, dy) = (x as f64 - ma, y as f64 - mb);
        sab += dx * dy;
        saa += dx * dx;
        sbb += dy * dy;
    }
    if saa <= 0.0 || sbb <= 0.0 {
        return None;
    }
    Some(sab / (saa * sbb).sqrt())
}

pub fn grade_correlation(correlation: f64) -> Grade {
    if correlation > EXCELLENT_ROW_CORRELATION {
        Grade::Good
    } else if correlation > MODERATE_ROW_CORRELATION {
        Grade::Moderate
    } else {
        Grade::Poor
    }
}

pub fn grade_coverage(coverage: f64) -> Grade {
    if coverage > GOOD_COVERAGE {
        Grade::Good
    } else if coverage > MODERATE_COVERAGE {
        Grade::Moderate
    } else {
        Grade::Poor
    }
}

/// Side-by-side rectified pair with a horizontal green line every `spacing` rows.
pub fn epipolar_overlay(left: &RgbImage, right: &RgbImage, spacing: u32) -> RgbImage {
    let (w, h) = left.dimensions();
    let mut out = RgbImage::new(w + right.width(), h.max(right.height()));
    imageops::replace(&mut out, left, 0, 0);
    imageops::replace(&mut out, right, w as i64, 0);
    let width = out.width();
    for y in (0..out.height()).step_by(spacing.max(1) as usize) {
        for x in 0..width {
            out.put_pixel(x, y, Rgb([0, 255, 0]));
        }
    }
    out
}

/// Outcome of [`verify_rectification`].
#[derive(Debug, Clone)]
pub struct RectificationReport {
    pub row_correlation: Option<f64>,
    /// Fraction of pixels with a positive disparity.
    pub coverage: f64,
    pub disparity: DisparityField,
    pub warnings: Vec<QualityWarning>,
}

/// Matcher used for the post-calibration disparity probe on grayscale frames.
pub fn probe_params() -> SgbmParams {
    let (p1, p2) = default_penalties(9, 1);
    SgbmParams {
        num_disparities: 96,
        block_size: 9,
        p1,
        p2,
        ..SgbmParams::default()
    }
}

/// Rectify one raw pair and check row alignment and disparity coverage.
pub fn verify_rectification(
    rig: &StereoRig,
    left: &RgbImage,
    right: &RgbImage,
    params: SgbmParams,
) -> Result<RectificationReport, SgbmError> {
    let (rect_l, rect_r) = rig.rectify(left, right);
    let gray_l = imageops::grayscale(&rect_l);
    let gray_r = imageops::grayscale(&rect_r);
    let mut warnings = Vec::new();

    let row_correlation = row_correlation(&gray_l, &gray_r);
    match row_correlation.map(|c| (c, grade_correlation(c))) {
        Some((c, Grade::Good)) => info!("row correlation {c:.3}: excellent rectification"),
        Some((c, Grade::Moderate)) => {
            warn!("row correlation {c:.3}: moderate rectification, usable but could be better");
            warnings.push(QualityWarning::LowRowCorrelation { correlation: c });
        }
        Some((c, Grade::Poor)) => {
            warn!("row correlation {c:.3}: poor rectification, recalibration recommended");
            warnings.push(QualityWarning::LowRowCorrelation { correlation: c });
        }
        None => warn!("row correlation could not be evaluated"),
    }

    let disparity = SgbmMatcher::new(params)?.compute(&gray_l, &gray_r)?;
    let coverage = disparity.positive_fraction();
    match grade_coverage(coverage) {
        Grade::Good => info!("disparity coverage {:.1}%: good", coverage * 100.0),
        grade => {
            warn!(
                "disparity coverage {:.1}%: {}, check scene texture",
                coverage * 100.0,
                if grade == Grade::Moderate { "moderate" } else { "low" }
            );
            warnings.push(QualityWarning::LowDisparityCoverage { coverage });
        }
    }

    Ok(RectificationReport {
        row_correlation,
        coverage,
        disparity,
        warnings,
    })
}
