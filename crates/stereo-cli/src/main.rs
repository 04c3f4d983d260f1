//! `stereo` command-line tools: calibrate a rig, run depth sessions over
//! recorded frames, inspect and verify capture records, retry uploads.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use image::RgbImage;
use log::{info, warn};
use serde::Serialize;
use stereo::calibration::quality::{epipolar_overlay, probe_params};
use stereo::calibration::{discover_pairs, QualityWarning, SkippedPair};
use stereo::capture::{
    verify_record, CaptureEvent, CaptureRecord, DepthSession, HmacSigner, HttpTransport, ImageSequenceSource,
    OperatorCommand, Presenter, ProvenanceConfig, ScriptedInput, SessionConfig, SessionSummary, Transport,
    UploadReceipt, Verification, Verifier,
};
use stereo::core::{ReprojectionStats, TargetLayout};
use stereo::depth::visualize::depth_color;
use stereo::prelude::*;

const SIGNING_KEY_ENV: &str = "PRIVATE_KEY";
const SERVER_URL_ENV: &str = "SERVER_URL";

#[derive(Debug, Parser)]
#[command(name = "stereo", version, about = "Stereo calibration, depth sessions and signed captures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Calibrate a stereo rig from left_*.png / right_*.png chessboard pairs.
    Calibrate(CalibrateArgs),
    /// Run a depth session over recorded left_* / right_* frames.
    Depth(DepthArgs),
    /// Decode the depth data of a capture record.
    Replay(ReplayArgs),
    /// Upload saved capture records.
    Upload(UploadArgs),
    /// Check capture record signatures against the key in PRIVATE_KEY.
    Verify(VerifyArgs),
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Directory with the calibration image pairs.
    #[arg(long)]
    images: PathBuf,

    /// Where to write the calibration bundle.
    #[arg(long, default_value = "stereo_calibration.json")]
    output: PathBuf,

    /// Optional path to JSON CalibrationConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the first pair, rectified, with epipolar lines to this image.
    #[arg(long)]
    overlay: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct DepthArgs {
    /// Calibration bundle written by `calibrate`.
    #[arg(long, default_value = "stereo_calibration.json")]
    calibration: PathBuf,

    /// Directory with left_* and right_* frames.
    #[arg(long)]
    frames: PathBuf,

    /// Optional path to JSON SessionConfig. Defaults are used if omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Overrides the output directory from the session config.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Capture every N-th frame; 0 disables captures.
    #[arg(long, default_value_t = 0)]
    capture_every: usize,

    /// Save every presented view into this directory.
    #[arg(long)]
    views: Option<PathBuf>,

    /// Keep records on disk without uploading them.
    #[arg(long)]
    no_upload: bool,
}

#[derive(Debug, Clone, Args)]
struct ReplayArgs {
    /// Capture record JSON.
    record: PathBuf,

    /// Write the colour-mapped disparities to this image.
    #[arg(long)]
    depth_png: Option<PathBuf>,

    /// Calibration bundle used to convert disparities to depth.
    #[arg(long)]
    calibration: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct UploadArgs {
    /// Capture record JSON files.
    #[arg(required = true)]
    records: Vec<PathBuf>,

    /// Storage server; falls back to SERVER_URL, then http://localhost:3000.
    #[arg(long)]
    server: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct VerifyArgs {
    /// Capture record JSON files.
    #[arg(required = true)]
    records: Vec<PathBuf>,
}

fn load_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn load_or_default<T: serde::de::DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    path.map_or_else(|| Ok(T::default()), load_json_file)
}

/// Signing and upload settings from the process environment.
fn provenance_from_env(upload: bool) -> ProvenanceConfig {
    let defaults = ProvenanceConfig::default();
    ProvenanceConfig {
        signing_key: std::env::var(SIGNING_KEY_ENV).ok(),
        server_url: std::env::var(SERVER_URL_ENV).unwrap_or(defaults.server_url),
        upload,
    }
}

// ── calibrate ──────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CalibrationSummary {
    bundle: PathBuf,
    layout: TargetLayout,
    valid_pairs: usize,
    total_pairs: usize,
    skipped: Vec<SkippedPair>,
    left: ReprojectionStats,
    right: ReprojectionStats,
    stereo: ReprojectionStats,
    baseline: f64,
    rectified_focal: f64,
    row_correlation: Option<f64>,
    disparity_coverage: Option<f64>,
    warnings: Vec<QualityWarning>,
}

fn run_calibrate(args: &CalibrateArgs) -> Result<CalibrationSummary> {
    let config: CalibrationConfig = load_or_default(args.config.as_deref())?;
    let layout = config.layout;
    let calibrator = StereoCalibrator::new(config)?;
    let result = calibrator
        .calibrate_dir(&args.images)
        .with_context(|| format!("calibrating from {}", args.images.display()))?;

    let bundle = result.bundle();
    bundle
        .save(&args.output)
        .with_context(|| format!("writing {}", args.output.display()))?;
    info!("calibration saved to {}", args.output.display());

    let mut warnings = result.warnings.clone();
    let mut row_correlation = None;
    let mut disparity_coverage = None;
    let (lefts, rights) = discover_pairs(&args.images)?;
    let first = lefts.first().zip(rights.first()).map(|(l, r)| load_pair(l, r));
    match first {
        Some(Ok((left, right))) => {
            let rig = StereoRig::from_bundle(&bundle)?;
            let report = verify_rectification(&rig, &left, &right, probe_params())?;
            row_correlation = report.row_correlation;
            disparity_coverage = Some(report.coverage);
            warnings.extend(report.warnings);
            if let Some(path) = &args.overlay {
                let (rect_l, rect_r) = rig.rectify(&left, &right);
                epipolar_overlay(&rect_l, &rect_r, 30)
                    .save(path)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Some(Err(e)) => warn!("rectification check skipped: {e:#}"),
        None => {}
    }

    Ok(CalibrationSummary {
        bundle: args.output.clone(),
        layout,
        valid_pairs: result.valid_pairs,
        total_pairs: result.total_pairs,
        skipped: result.skipped,
        left: result.left_stats,
        right: result.right_stats,
        stereo: result.stereo_stats,
        baseline: result.extrinsics.baseline(),
        rectified_focal: result.geometry.focal(),
        row_correlation,
        disparity_coverage,
        warnings,
    })
}

fn load_pair(left: &Path, right: &Path) -> Result<(RgbImage, RgbImage)> {
    let open = |p: &Path| -> Result<RgbImage> {
        Ok(image::open(p)
            .with_context(|| format!("reading {}", p.display()))?
            .to_rgb8())
    };
    Ok((open(left)?, open(right)?))
}

// ── depth ──────────────────────────────────────────────────────────────

/// Writes each presented view as `view_<n>.png`, or just counts them.
struct ViewWriter {
    dir: Option<PathBuf>,
    shown: usize,
}

impl Presenter for ViewWriter {
    fn present(&mut self, view: &RgbImage) {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("view_{:05}.png", self.shown));
            if let Err(e) = view.save(&path) {
                warn!("could not write {}: {e}", path.display());
            }
        }
        self.shown += 1;
    }
}

/// One command batch per frame with a capture on every `every`-th frame.
fn capture_script(frames: usize, every: usize) -> ScriptedInput {
    let batches = (1..=frames)
        .map(|n| {
            if every > 0 && n % every == 0 {
                vec![OperatorCommand::Capture]
            } else {
                Vec::new()
            }
        })
        .collect();
    ScriptedInput::new(batches)
}

fn run_depth(args: &DepthArgs, provenance: &ProvenanceConfig) -> Result<SessionSummary> {
    let rig = StereoRig::load(&args.calibration)
        .with_context(|| format!("loading calibration {}", args.calibration.display()))?;
    let mut config: SessionConfig = load_or_default(args.config.as_deref())?;
    if let Some(dir) = &args.output {
        config.output_dir = dir.clone();
    }
    let left = ImageSequenceSource::from_dir(&args.frames, "left_")
        .with_context(|| format!("listing {}", args.frames.display()))?;
    let right = ImageSequenceSource::from_dir(&args.frames, "right_")
        .with_context(|| format!("listing {}", args.frames.display()))?;
    if left.is_empty() || left.len() != right.len() {
        bail!(
            "{} holds {} left and {} right frames",
            args.frames.display(),
            left.len(),
            right.len()
        );
    }
    if let Some(dir) = &args.views {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let mut input = capture_script(left.len(), args.capture_every);
    let mut presenter = ViewWriter {
        dir: args.views.clone(),
        shown: 0,
    };
    let session = DepthSession::new(rig, Box::new(left), Box::new(right), config, provenance)?;
    Ok(session.run(&mut input, &mut presenter)?)
}

fn print_events(events: &[CaptureEvent]) {
    for event in events {
        match event {
            CaptureEvent::Saved { path, .. } => println!("saved     {}", path.display()),
            CaptureEvent::Uploaded { timestamp, receipt } => {
                println!("uploaded  {timestamp} -> {}", receipt.piece_cid)
            }
            CaptureEvent::UploadFailed { path, error, .. } => {
                println!("not sent  {} ({error})", path.display())
            }
            CaptureEvent::Cancelled { path, .. } => println!("cancelled {}", path.display()),
            CaptureEvent::Failed { timestamp, error } => println!("failed    {timestamp} ({error})"),
        }
    }
}

// ── replay ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ReplaySummary {
    timestamp: u64,
    signature: String,
    /// `[rows, cols]`
    shape: [u32; 2],
    depth_points: usize,
    min_disparity: f64,
    max_disparity: f64,
    median_depth: Option<f64>,
}

fn run_replay(args: &ReplayArgs) -> Result<ReplaySummary> {
    let record = CaptureRecord::load(&args.record)?;
    let field = record.data.depth_data.decode()?;

    if let Some(path) = &args.depth_png {
        depth_color(&field)
            .save(path)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    let median_depth = match &args.calibration {
        Some(path) => {
            let rig = StereoRig::load(path).with_context(|| format!("loading calibration {}", path.display()))?;
            let size = rig.image_size();
            if (size.width, size.height) != (field.width, field.height) {
                bail!(
                    "record is {}x{}, calibration expects {}x{}",
                    field.width,
                    field.height,
                    size.width,
                    size.height
                );
            }
            let data = &record.data.depth_data;
            let mut depths: Vec<f64> = data
                .indices_x
                .iter()
                .zip(&data.indices_y)
                .filter_map(|(&x, &y)| rig.reproject_point(&field, x, y))
                .map(|p| p.z)
                .filter(|z| z.is_finite())
                .collect();
            depths.sort_by(|a, b| a.total_cmp(b));
            depths.get(depths.len() / 2).copied()
        }
        None => None,
    };

    let values = &record.data.depth_data.values;
    Ok(ReplaySummary {
        timestamp: record.data.timestamp,
        signature: String::from(record.signature),
        shape: record.data.depth_data.shape,
        depth_points: values.len(),
        min_disparity: values.iter().copied().fold(f64::INFINITY, f64::min),
        max_disparity: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        median_depth,
    })
}

// ── upload / verify ────────────────────────────────────────────────────

fn upload_records(paths: &[PathBuf], transport: &dyn Transport) -> Result<Vec<(PathBuf, UploadReceipt)>> {
    let mut receipts = Vec::new();
    let mut failed = 0;
    for path in paths {
        let sent = CaptureRecord::load(path)
            .map_err(anyhow::Error::from)
            .and_then(|record| Ok(transport.send(&record)?));
        match sent {
            Ok(receipt) => receipts.push((path.clone(), receipt)),
            Err(e) => {
                warn!("{}: {e:#}", path.display());
                failed += 1;
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} uploads failed", paths.len());
    }
    Ok(receipts)
}

fn verify_records(paths: &[PathBuf], verifier: &dyn Verifier) -> Result<Vec<(PathBuf, Verification)>> {
    paths
        .iter()
        .map(|path| {
            let record = CaptureRecord::load(path)?;
            Ok((path.clone(), verify_record(&record, verifier)?))
        })
        .collect()
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = try_main() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    match Cli::parse().command {
        Command::Calibrate(args) => {
            let summary = run_calibrate(&args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Depth(args) => {
            let summary = run_depth(&args, &provenance_from_env(!args.no_upload))?;
            print_events(&summary.events);
            println!("{} frames processed, {} dropped", summary.frames, summary.skipped);
        }
        Command::Replay(args) => {
            let summary = run_replay(&args)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Upload(args) => {
            let server = match args.server {
                Some(url) => url,
                None => provenance_from_env(true).server_url,
            };
            let transport = HttpTransport::new(&server);
            for (path, receipt) in upload_records(&args.records, &transport)? {
                println!("{} -> {}", path.display(), receipt.piece_cid);
            }
        }
        Command::Verify(args) => {
            let Some(key) = std::env::var(SIGNING_KEY_ENV).ok().filter(|k| !k.trim().is_empty()) else {
                bail!("{SIGNING_KEY_ENV} is not set");
            };
            let verifier = HmacSigner::from_secret(key.trim())?;
            let results = verify_records(&args.records, &verifier)?;
            let mut invalid = 0;
            for (path, outcome) in &results {
                match outcome {
                    Verification::Valid => println!("valid     {}", path.display()),
                    Verification::Unsigned => println!("unsigned  {}", path.display()),
                    Verification::SigningFailed(msg) => println!("no sig    {} ({msg})", path.display()),
                    Verification::Invalid(e) => {
                        invalid += 1;
                        println!("INVALID   {} ({e})", path.display());
                    }
                }
            }
            if invalid > 0 {
                bail!("{invalid} of {} records failed verification", results.len());
            }
        }
    }
    Ok(())
}
